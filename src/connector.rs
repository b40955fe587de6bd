use std::net::SocketAddr;
use std::time::Duration;
use anyhow::Context;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use crate::config::SenderConfig;

/// A bidirectional byte stream to the collector - a TCP connection in production, an in-memory
///  pipe in tests
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl <T: AsyncRead + AsyncWrite + Unpin + Send + 'static> ByteStream for T {}

/// This is an abstraction for establishing a connection, introduced to facilitate mocking
///  the I/O part away for testing.
///
/// Every call creates a fresh stream, streams are never reused across connect attempts.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: SocketAddr) -> anyhow::Result<Box<dyn ByteStream>>;
}

pub struct TcpConnector {
    nodelay: bool,
    keepalive: Option<Duration>,
}

impl TcpConnector {
    pub fn new(config: &SenderConfig) -> TcpConnector {
        TcpConnector {
            nodelay: config.tcp_nodelay,
            keepalive: config.tcp_keepalive,
        }
    }

    fn apply_socket_options(&self, stream: &TcpStream) {
        // socket options are an optimization - a connection without them is still usable
        if let Err(e) = stream.set_nodelay(self.nodelay) {
            warn!("could not set TCP_NODELAY to {}: {}", self.nodelay, e);
        }

        if let Some(idle) = self.keepalive {
            let keepalive = TcpKeepalive::new().with_time(idle);
            if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
                warn!("could not enable TCP keepalive: {}", e);
            }
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: SocketAddr) -> anyhow::Result<Box<dyn ByteStream>> {
        let stream = TcpStream::connect(endpoint).await
            .with_context(|| format!("connecting to {:?}", endpoint))?;

        debug!("connected to {:?} from {:?}", endpoint, stream.local_addr().ok());
        self.apply_socket_options(&stream);
        Ok(Box::new(stream))
    }
}
