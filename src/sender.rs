use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info_span, trace, warn, Instrument};
use crate::config::SenderConfig;
use crate::connector::{Connector, TcpConnector};
use crate::driver::SenderDriver;
use crate::state::SenderStatus;

/// This is the sender's public API: a best-effort, non-blocking sender of opaque messages to a
///  single collector endpoint.
///
/// Creating a sender does no I/O. Connection management starts with [TcpSender::start], which
///  spawns the sender's driver task on the runtime that was passed in. From then on, the sender
///  keeps (re-)connecting until it is dropped, re-sending the session header as the first bytes
///  on every new connection.
///
/// [TcpSender::send] is non-blocking and can be called from any thread. Messages are written
///  verbatim and in order while there is a connection. Messages sent while there is no
///  connection are dropped silently.
pub struct TcpSender {
    config: Arc<SenderConfig>,
    runtime: Handle,
    inbox: mpsc::Sender<Bytes>,
    status: watch::Receiver<SenderStatus>,
    /// the driver's half of the wiring, until the driver is spawned by `start()`
    unstarted: Option<(mpsc::Receiver<Bytes>, watch::Sender<SenderStatus>, Arc<dyn Connector>)>,
    driver_handle: Option<JoinHandle<()>>,
}

impl Debug for TcpSender {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TcpSender{{endpoint:{:?}, status:{:?}}}", self.config.endpoint, *self.status.borrow())
    }
}

impl TcpSender {
    pub fn new(runtime: Handle, config: SenderConfig) -> anyhow::Result<TcpSender> {
        let connector = Arc::new(TcpConnector::new(&config));
        Self::with_connector(runtime, config, connector)
    }

    /// Convenience for a sender with default configuration
    pub fn for_endpoint(runtime: Handle, session_header: impl Into<Bytes>, addr: IpAddr, port: u16) -> anyhow::Result<TcpSender> {
        Self::new(runtime, SenderConfig::new(SocketAddr::new(addr, port), session_header))
    }

    pub fn with_connector(runtime: Handle, config: SenderConfig, connector: Arc<dyn Connector>) -> anyhow::Result<TcpSender> {
        config.validate()?;

        let (inbox, inbox_receiver) = mpsc::channel(config.send_queue_capacity);
        let (status_sender, status) = watch::channel(SenderStatus::INITIAL);

        Ok(TcpSender {
            config: Arc::new(config),
            runtime,
            inbox,
            status,
            unstarted: Some((inbox_receiver, status_sender, connector)),
            driver_handle: None,
        })
    }

    /// Starts connection management. This is meant to be called exactly once, subsequent calls
    ///  are ignored.
    pub fn start(&mut self) {
        let Some((inbox_receiver, status_sender, connector)) = self.unstarted.take() else {
            warn!("sender for {:?} was already started", self.config.endpoint);
            return;
        };

        let driver = SenderDriver::new(self.config.clone(), connector, inbox_receiver, status_sender);
        let span = info_span!("tcp_sender", endpoint = %self.config.endpoint);
        self.driver_handle = Some(self.runtime.spawn(driver.run().instrument(span)));
    }

    /// Submits a message for best-effort sending. This never blocks, and it never fails
    ///  visibly: if the message can not be sent because there is no connection, or because
    ///  the sender is overloaded, it is dropped.
    pub fn send(&self, msg: Bytes) {
        if self.driver_handle.is_none() {
            debug!("sender for {:?} is not started - dropping message of {} bytes", self.config.endpoint, msg.len());
            return;
        }

        match self.inbox.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                trace!("send queue for {:?} is full - dropping message of {} bytes", self.config.endpoint, msg.len());
            }
            Err(TrySendError::Closed(msg)) => {
                debug!("sender for {:?} is shut down - dropping message of {} bytes", self.config.endpoint, msg.len());
            }
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.config.endpoint
    }

    pub fn status(&self) -> SenderStatus {
        *self.status.borrow()
    }

    /// Allows observing connection state transitions, e.g. for health reporting. Intermediate
    ///  states may be skipped if they change faster than the receiver looks at them.
    pub fn subscribe(&self) -> watch::Receiver<SenderStatus> {
        self.status.clone()
    }
}

impl Drop for TcpSender {
    fn drop(&mut self) {
        // aborting the driver drops its socket, timer and pending connect attempt. Nothing in
        //  the driver refers back to this object.
        if let Some(handle) = self.driver_handle.take() {
            handle.abort();
        }
    }
}
