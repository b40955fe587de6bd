use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, trace, warn};

/// A passive stand-in for a collector: it listens on a localhost port and records everything it
///  receives, separately for each accepted connection (in the order of acceptance).
///
/// A peer can be shut down and a new one bound to the same port later, which allows testing
///  reconnect behavior. Shutting down closes the listening socket as well as all accepted
///  connections.
pub struct RecordingPeer {
    port: u16,
    received: watch::Receiver<Vec<Vec<u8>>>,
    accept_handle: Option<JoinHandle<()>>,
}

impl RecordingPeer {
    /// Binds to the given port on 127.0.0.1, or to an OS-assigned port if `port` is 0
    pub async fn bind(port: u16) -> anyhow::Result<RecordingPeer> {
        let socket = TcpSocket::new_v4()?;
        // allow re-binding while connections of a previous peer linger in TIME_WAIT
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))?;
        let listener = socket.listen(128)?;

        let port = listener.local_addr()?.port();
        debug!("recording peer listening on port {}", port);

        let (received_sender, received) = watch::channel(Vec::new());
        let accept_handle = tokio::spawn(accept_loop(listener, received_sender));

        Ok(RecordingPeer {
            port,
            received,
            accept_handle: Some(accept_handle),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn num_connections(&self) -> usize {
        self.received.borrow().len()
    }

    /// Everything received on the n-th accepted connection so far
    pub fn received(&self, connection: usize) -> Option<Vec<u8>> {
        self.received.borrow()
            .get(connection)
            .cloned()
    }

    /// Waits until the n-th accepted connection received exactly `expected` (so far), returning
    ///  `false` if that does not happen within `max_wait`. It also returns `false` as soon as
    ///  the connection received data that does not match.
    pub async fn wait_for_bytes(&self, connection: usize, expected: &[u8], max_wait: Duration) -> bool {
        let mut received = self.received.clone();

        let wait = received.wait_for(|conns| match conns.get(connection) {
            None => false,
            Some(data) => data.len() >= expected.len() || !expected.starts_with(data),
        });

        // NB: bound to a local so the borrowed watch::Ref is released before `received`
        let outcome = tokio::time::timeout(max_wait, wait).await;
        match outcome {
            Ok(Ok(conns)) => conns[connection] == expected,
            Ok(Err(_)) => false,
            Err(_) => {
                debug!("timeout waiting for data on connection #{}: received {:?}", connection, self.received(connection));
                false
            }
        }
    }

    /// Stops listening and closes all accepted connections. Unlike dropping the peer, this
    ///  waits until the sockets are actually closed.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.accept_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        debug!("recording peer on port {} shut down", self.port);
    }
}

impl Drop for RecordingPeer {
    fn drop(&mut self) {
        if let Some(handle) = self.accept_handle.take() {
            handle.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, received: watch::Sender<Vec<Vec<u8>>>) {
    // connection tasks are owned here, so aborting this task closes them as well
    let mut connections = JoinSet::new();

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let mut connection = 0;
                received.send_modify(|conns| {
                    connection = conns.len();
                    conns.push(Vec::new());
                });
                debug!("accepted connection #{} from {:?}", connection, addr);
                connections.spawn(record_connection(stream, connection, received.clone()));
            }
            Err(e) => {
                warn!("error accepting connection: {}", e);
            }
        }
    }
}

async fn record_connection(mut stream: TcpStream, connection: usize, received: watch::Sender<Vec<Vec<u8>>>) {
    let mut buf = [0u8; 4096];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                debug!("connection #{} closed by the sender", connection);
                return;
            }
            Ok(n) => {
                trace!("connection #{}: received {:?}", connection, &buf[..n]);
                received.send_modify(|conns| conns[connection].extend_from_slice(&buf[..n]));
            }
            Err(e) => {
                debug!("connection #{} broke: {}", connection, e);
                return;
            }
        }
    }
}
