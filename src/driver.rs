use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use bytes::{Buf, Bytes};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Sleep};
use tracing::{debug, info, trace, warn};
use crate::backoff::ReconnectBackoff;
use crate::config::SenderConfig;
use crate::connector::{ByteStream, Connector};
use crate::state::{ConnectionState, SenderStatus};

type ConnectAttempt = Pin<Box<dyn Future<Output = anyhow::Result<Box<dyn ByteStream>>> + Send>>;

enum Link {
    Disconnected {
        retry: Pin<Box<Sleep>>,
    },
    Connecting {
        generation: u64,
        attempt: ConnectAttempt,
    },
    Connected(Connection),
}

/// An established connection with its write queue. The queue belongs to the connection: when
///  the connection goes away, everything still queued goes with it.
struct Connection {
    generation: u64,
    reader: ReadHalf<Box<dyn ByteStream>>,
    writer: WriteHalf<Box<dyn ByteStream>>,
    /// NB: the front buffer may be partially written - it is advanced past the written bytes
    pending: VecDeque<Bytes>,
    read_buf: Box<[u8]>,
}

enum Event {
    Submitted(Option<Bytes>),
    RetryDue,
    ConnectFinished {
        generation: u64,
        result: anyhow::Result<Box<dyn ByteStream>>,
    },
    Written(std::io::Result<usize>),
    Received(std::io::Result<usize>),
}

impl Connection {
    const READ_BUF_SIZE: usize = 512;

    fn new(generation: u64, stream: Box<dyn ByteStream>, session_header: Bytes) -> Connection {
        let (reader, writer) = tokio::io::split(stream);

        let mut pending = VecDeque::new();
        if !session_header.is_empty() {
            pending.push_back(session_header);
        }

        Connection {
            generation,
            reader,
            writer,
            pending,
            read_buf: vec![0u8; Self::READ_BUF_SIZE].into_boxed_slice(),
        }
    }

    async fn next_event(&mut self, inbox: &mut mpsc::Receiver<Bytes>) -> Event {
        let has_pending = !self.pending.is_empty();
        let front = self.pending.front()
            .map(|b| b.as_ref())
            .unwrap_or(&[]);

        // NB: all three operations are cancel safe, i.e. nothing is lost when one of the
        //      other branches completes first
        select! {
            msg = inbox.recv() => Event::Submitted(msg),
            result = self.writer.write(front), if has_pending => Event::Written(result),
            result = self.reader.read(&mut self.read_buf[..]) => Event::Received(result),
        }
    }

    /// returns `false` if the write means that the connection is broken
    fn on_written(&mut self, num_written: usize) -> bool {
        if num_written == 0 {
            return false;
        }

        if let Some(front) = self.pending.front_mut() {
            front.advance(num_written);
            if front.is_empty() {
                self.pending.pop_front();
            }
        }
        true
    }
}

/// NB: This does not touch the runtime until it is polled, so it can be created anywhere
fn connect_attempt(connector: Arc<dyn Connector>, config: &SenderConfig) -> ConnectAttempt {
    let endpoint = config.endpoint;
    let connect_timeout = config.connect_timeout;

    Box::pin(async move {
        match timeout(connect_timeout, connector.connect(endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("connect timed out after {:?}", connect_timeout)),
        }
    })
}

/// The driver owns all of a sender's connection state and runs as a single task. All state
///  transitions happen in here, in response to events from the inbox, the retry timer, the
///  connect attempt or the connection.
pub struct SenderDriver {
    config: Arc<SenderConfig>,
    connector: Arc<dyn Connector>,
    inbox: mpsc::Receiver<Bytes>,
    status: watch::Sender<SenderStatus>,
    backoff: ReconnectBackoff,
    generation: u64,
    link: Link,
}

impl SenderDriver {
    pub fn new(
        config: Arc<SenderConfig>,
        connector: Arc<dyn Connector>,
        inbox: mpsc::Receiver<Bytes>,
        status: watch::Sender<SenderStatus>,
    ) -> SenderDriver {
        let backoff = ReconnectBackoff::new(config.as_ref());

        // the first connect attempt is issued right away, without waiting for a retry timer
        let first_attempt = connect_attempt(connector.clone(), config.as_ref());
        SenderDriver {
            config,
            connector,
            inbox,
            status,
            backoff,
            generation: 1,
            link: Link::Connecting {
                generation: 1,
                attempt: first_attempt,
            },
        }
    }

    /// Runs until the inbox is closed, i.e. until the owning sender is dropped
    pub async fn run(mut self) {
        info!("starting sender for {:?}", self.config.endpoint);
        self.publish_status();

        loop {
            match self.next_event().await {
                Event::Submitted(Some(msg)) => self.on_submitted(msg),
                Event::Submitted(None) => break,
                Event::RetryDue => self.begin_connect(),
                Event::ConnectFinished { generation, result } => self.on_connect_finished(generation, result),
                Event::Written(result) => self.on_written(result),
                Event::Received(result) => self.on_received(result),
            }
        }

        info!("sender for {:?} was dropped - shutting down", self.config.endpoint);
    }

    async fn next_event(&mut self) -> Event {
        match &mut self.link {
            Link::Disconnected { retry } => select! {
                msg = self.inbox.recv() => Event::Submitted(msg),
                _ = retry.as_mut() => Event::RetryDue,
            },
            Link::Connecting { generation, attempt } => select! {
                msg = self.inbox.recv() => Event::Submitted(msg),
                result = attempt.as_mut() => Event::ConnectFinished { generation: *generation, result },
            },
            Link::Connected(connection) => connection.next_event(&mut self.inbox).await,
        }
    }

    fn state(&self) -> ConnectionState {
        match &self.link {
            Link::Disconnected { .. } => ConnectionState::Disconnected,
            Link::Connecting { .. } => ConnectionState::Connecting,
            Link::Connected(_) => ConnectionState::Connected,
        }
    }

    fn publish_status(&self) {
        let status = SenderStatus {
            state: self.state(),
            generation: self.generation,
        };
        // there may be no subscribers, and that is fine
        self.status.send_replace(status);
    }

    fn begin_connect(&mut self) {
        self.generation += 1;
        debug!("connect attempt #{} to {:?}", self.generation, self.config.endpoint);

        self.link = Link::Connecting {
            generation: self.generation,
            attempt: connect_attempt(self.connector.clone(), self.config.as_ref()),
        };
        self.publish_status();
    }

    fn on_connect_finished(&mut self, generation: u64, result: anyhow::Result<Box<dyn ByteStream>>) {
        if generation != self.generation {
            debug!("ignoring completion of superseded connect attempt #{} (current is #{})", generation, self.generation);
            return;
        }

        match result {
            Ok(stream) => {
                info!("connected to {:?} (connection #{})", self.config.endpoint, generation);
                self.backoff.reset();
                self.link = Link::Connected(Connection::new(generation, stream, self.config.session_header.clone()));
                self.publish_status();
            }
            Err(e) => {
                warn!("failed to connect to {:?}: {:#}", self.config.endpoint, e);
                self.disconnect();
            }
        }
    }

    fn on_submitted(&mut self, msg: Bytes) {
        if msg.is_empty() {
            // nothing to write, and a zero-length write would look like a broken connection
            trace!("ignoring empty message");
            return;
        }

        match &mut self.link {
            Link::Connected(connection) => {
                // the inbox keeps being drained while the collector does not read, so the write
                //  queue needs a bound of its own
                if connection.pending.len() >= self.config.send_queue_capacity {
                    trace!("write queue of connection #{} is full - dropping message of {} bytes", connection.generation, msg.len());
                    return;
                }

                trace!("queueing message of {} bytes on connection #{}", msg.len(), connection.generation);
                connection.pending.push_back(msg);
            }
            _ => {
                trace!("not connected - dropping message of {} bytes", msg.len());
            }
        }
    }

    fn on_written(&mut self, result: std::io::Result<usize>) {
        let Link::Connected(connection) = &mut self.link else {
            return;
        };

        match result {
            Ok(n) => {
                trace!("wrote {} bytes on connection #{}", n, connection.generation);
                if !connection.on_written(n) {
                    warn!("connection to {:?} does not accept data any more", self.config.endpoint);
                    self.disconnect();
                }
            }
            Err(e) => {
                warn!("error writing to {:?}: {}", self.config.endpoint, e);
                self.disconnect();
            }
        }
    }

    fn on_received(&mut self, result: std::io::Result<usize>) {
        match result {
            Ok(0) => {
                info!("connection closed by {:?}", self.config.endpoint);
                self.disconnect();
            }
            Ok(n) => {
                trace!("discarding {} bytes received from {:?}", n, self.config.endpoint);
            }
            Err(e) => {
                warn!("error reading from {:?}: {}", self.config.endpoint, e);
                self.disconnect();
            }
        }
    }

    fn disconnect(&mut self) {
        if let Link::Connected(connection) = &self.link {
            if !connection.pending.is_empty() {
                debug!("dropping {} unsent messages with connection #{}", connection.pending.len(), connection.generation);
            }
        }

        let delay = self.backoff.next_delay();
        debug!("reconnecting to {:?} in {:?}", self.config.endpoint, delay);

        // replacing the link drops the old stream, closing the socket
        self.link = Link::Disconnected { retry: Box::pin(sleep(delay)) };
        self.publish_status();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use mockall::Sequence;
    use tokio::io::{duplex, DuplexStream};
    use tokio::runtime::Builder;
    use tokio::time::Instant;
    use super::*;
    use crate::connector::MockConnector;

    const HEADER: &[u8] = b"THIS_is_a_session_HEADER";

    fn test_config() -> Arc<SenderConfig> {
        let mut config = SenderConfig::new(([127, 0, 0, 1], 8124).into(), HEADER);
        config.reconnect_initial_interval = Duration::from_millis(100);
        config.reconnect_max_interval = Duration::from_millis(400);
        Arc::new(config)
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    /// returns the driver's inbox and status, and the task running the driver
    fn spawn_driver(config: Arc<SenderConfig>, connector: impl Connector) -> (mpsc::Sender<Bytes>, watch::Receiver<SenderStatus>, tokio::task::JoinHandle<()>) {
        let (send, recv) = mpsc::channel(16);
        let (status_send, status_recv) = watch::channel(SenderStatus::INITIAL);
        let driver = SenderDriver::new(config, Arc::new(connector), recv, status_send);
        (send, status_recv, tokio::spawn(driver.run()))
    }

    async fn wait_for_state(status: &mut watch::Receiver<SenderStatus>, state: ConnectionState, min_generation: u64) {
        status.wait_for(|s| s.state == state && s.generation >= min_generation).await
            .unwrap();
    }

    fn assert_elapsed(start: Instant, expected: Duration) {
        // the timer wheel has millisecond granularity, and deadlines are rounded up
        let elapsed = start.elapsed();
        assert!(elapsed >= expected && elapsed < expected + Duration::from_millis(10), "elapsed {:?}, expected {:?}", elapsed, expected);
    }

    async fn read_exactly(peer: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        peer.read_exact(&mut buf).await.unwrap();
        buf
    }

    fn refused() -> anyhow::Result<Box<dyn ByteStream>> {
        Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into())
    }

    #[test]
    fn test_header_first_then_messages_in_order() {
        paused_runtime().block_on(async {
            let (client, mut peer) = duplex(1024);

            let mut connector = MockConnector::new();
            connector.expect_connect()
                .times(1)
                .return_once(move |_| Ok(Box::new(client) as Box<dyn ByteStream>));

            let (inbox, mut status, _handle) = spawn_driver(test_config(), connector);
            wait_for_state(&mut status, ConnectionState::Connected, 1).await;

            for msg in ["hello", "hey", "hi"] {
                inbox.send(Bytes::from(msg)).await.unwrap();
            }

            assert_eq!(read_exactly(&mut peer, HEADER.len()).await, HEADER);
            assert_eq!(read_exactly(&mut peer, 10).await, b"helloheyhi");
        });
    }

    #[test]
    fn test_messages_dropped_while_disconnected() {
        paused_runtime().block_on(async {
            let (client, mut peer) = duplex(1024);

            let mut seq = Sequence::new();
            let mut connector = MockConnector::new();
            connector.expect_connect()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| refused());
            connector.expect_connect()
                .times(1)
                .in_sequence(&mut seq)
                .return_once(move |_| Ok(Box::new(client) as Box<dyn ByteStream>));

            let (inbox, mut status, _handle) = spawn_driver(test_config(), connector);
            wait_for_state(&mut status, ConnectionState::Disconnected, 1).await;

            inbox.send(Bytes::from_static(b"hello")).await.unwrap();

            wait_for_state(&mut status, ConnectionState::Connected, 2).await;
            inbox.send(Bytes::from_static(b"hey")).await.unwrap();

            assert_eq!(read_exactly(&mut peer, HEADER.len() + 3).await, [HEADER, b"hey"].concat());
        });
    }

    #[test]
    fn test_reconnect_after_peer_close_resends_header() {
        paused_runtime().block_on(async {
            let (client_1, mut peer_1) = duplex(1024);
            let (client_2, mut peer_2) = duplex(1024);

            let mut seq = Sequence::new();
            let mut connector = MockConnector::new();
            connector.expect_connect()
                .times(1)
                .in_sequence(&mut seq)
                .return_once(move |_| Ok(Box::new(client_1) as Box<dyn ByteStream>));
            connector.expect_connect()
                .times(1)
                .in_sequence(&mut seq)
                .return_once(move |_| Ok(Box::new(client_2) as Box<dyn ByteStream>));

            let (inbox, mut status, _handle) = spawn_driver(test_config(), connector);
            wait_for_state(&mut status, ConnectionState::Connected, 1).await;

            inbox.send(Bytes::from_static(b"hello")).await.unwrap();
            assert_eq!(read_exactly(&mut peer_1, HEADER.len() + 5).await, [HEADER, b"hello"].concat());

            drop(peer_1);
            wait_for_state(&mut status, ConnectionState::Disconnected, 1).await;

            inbox.send(Bytes::from_static(b"hey")).await.unwrap();

            wait_for_state(&mut status, ConnectionState::Connected, 2).await;
            inbox.send(Bytes::from_static(b"hi")).await.unwrap();

            assert_eq!(read_exactly(&mut peer_2, HEADER.len() + 2).await, [HEADER, b"hi"].concat());
        });
    }

    #[test]
    fn test_inbound_data_is_discarded() {
        paused_runtime().block_on(async {
            let (client, mut peer) = duplex(1024);

            let mut connector = MockConnector::new();
            connector.expect_connect()
                .times(1)
                .return_once(move |_| Ok(Box::new(client) as Box<dyn ByteStream>));

            let (inbox, mut status, _handle) = spawn_driver(test_config(), connector);
            wait_for_state(&mut status, ConnectionState::Connected, 1).await;

            peer.write_all(b"some response from the collector").await.unwrap();
            inbox.send(Bytes::from_static(b"hello")).await.unwrap();

            assert_eq!(read_exactly(&mut peer, HEADER.len() + 5).await, [HEADER, b"hello"].concat());
            assert_eq!(status.borrow().state, ConnectionState::Connected);
        });
    }

    #[test]
    fn test_write_backpressure_preserves_order() {
        paused_runtime().block_on(async {
            // a tiny pipe forces partial writes
            let (client, mut peer) = duplex(7);

            let mut connector = MockConnector::new();
            connector.expect_connect()
                .times(1)
                .return_once(move |_| Ok(Box::new(client) as Box<dyn ByteStream>));

            let (inbox, mut status, _handle) = spawn_driver(test_config(), connector);
            wait_for_state(&mut status, ConnectionState::Connected, 1).await;

            let mut expected = HEADER.to_vec();
            for i in 0..20u8 {
                let msg = vec![b'a' + i; i as usize + 1];
                expected.extend_from_slice(&msg);
                inbox.send(Bytes::from(msg)).await.unwrap();
            }

            assert_eq!(read_exactly(&mut peer, expected.len()).await, expected);
        });
    }

    #[test]
    fn test_empty_header_is_not_written() {
        paused_runtime().block_on(async {
            let (client, mut peer) = duplex(1024);

            let mut connector = MockConnector::new();
            connector.expect_connect()
                .times(1)
                .return_once(move |_| Ok(Box::new(client) as Box<dyn ByteStream>));

            let mut config = SenderConfig::new(([127, 0, 0, 1], 8124).into(), Bytes::new());
            config.reconnect_initial_interval = Duration::from_millis(100);
            let (inbox, mut status, _handle) = spawn_driver(Arc::new(config), connector);
            wait_for_state(&mut status, ConnectionState::Connected, 1).await;

            inbox.send(Bytes::from_static(b"hello")).await.unwrap();
            assert_eq!(read_exactly(&mut peer, 5).await, b"hello");
        });
    }

    #[test]
    fn test_empty_message_keeps_connection() {
        paused_runtime().block_on(async {
            let (client, mut peer) = duplex(1024);

            let mut connector = MockConnector::new();
            connector.expect_connect()
                .times(1)
                .return_once(move |_| Ok(Box::new(client) as Box<dyn ByteStream>));

            let (inbox, mut status, _handle) = spawn_driver(test_config(), connector);
            wait_for_state(&mut status, ConnectionState::Connected, 1).await;
            assert_eq!(read_exactly(&mut peer, HEADER.len()).await, HEADER);

            inbox.send(Bytes::new()).await.unwrap();
            inbox.send(Bytes::from_static(b"hello")).await.unwrap();

            assert_eq!(read_exactly(&mut peer, 5).await, b"hello");
            assert_eq!(*status.borrow(), SenderStatus { state: ConnectionState::Connected, generation: 1 });
        });
    }

    #[test]
    fn test_write_queue_is_bounded_when_peer_stops_reading() {
        paused_runtime().block_on(async {
            // the peer does not read until all messages are submitted, so the pipe fills up
            let (client, mut peer) = duplex(64);

            let mut connector = MockConnector::new();
            connector.expect_connect()
                .times(1)
                .return_once(move |_| Ok(Box::new(client) as Box<dyn ByteStream>));

            let mut config = SenderConfig::new(([127, 0, 0, 1], 8124).into(), HEADER);
            config.send_queue_capacity = 4;
            let (inbox, mut status, _handle) = spawn_driver(Arc::new(config), connector);
            wait_for_state(&mut status, ConnectionState::Connected, 1).await;

            // every message is picked up by the driver, awaiting inbox capacity as needed
            for _ in 0..1000 {
                inbox.send(Bytes::from_static(b"0123456789")).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;

            let mut received = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                match tokio::time::timeout(Duration::from_millis(100), peer.read(&mut buf)).await {
                    Ok(Ok(n)) if n > 0 => received.extend_from_slice(&buf[..n]),
                    _ => break,
                }
            }

            // what fits into the pipe, plus a write queue of at most four entries
            assert!(received.starts_with(HEADER));
            let num_messages = (received.len() - HEADER.len()) / 10;
            assert_eq!((received.len() - HEADER.len()) % 10, 0);
            assert!(num_messages >= 4 && num_messages <= 10, "{} messages were delivered", num_messages);
            assert!(status.borrow().is_connected());
        });
    }

    #[test]
    fn test_reconnect_backoff_timing() {
        paused_runtime().block_on(async {
            let (client, _peer) = duplex(1024);

            let mut seq = Sequence::new();
            let mut connector = MockConnector::new();
            connector.expect_connect()
                .times(4)
                .in_sequence(&mut seq)
                .returning(|_| refused());
            connector.expect_connect()
                .times(1)
                .in_sequence(&mut seq)
                .return_once(move |_| Ok(Box::new(client) as Box<dyn ByteStream>));

            let start = Instant::now();
            let (_inbox, mut status, _handle) = spawn_driver(test_config(), connector);
            wait_for_state(&mut status, ConnectionState::Connected, 5).await;

            // 100 + 200 + 400 + 400 (capped)
            assert_elapsed(start, Duration::from_millis(1100));
        });
    }

    #[test]
    fn test_connect_timeout_leads_to_retry() {
        struct HangingConnector;

        #[async_trait::async_trait]
        impl Connector for HangingConnector {
            async fn connect(&self, _endpoint: std::net::SocketAddr) -> anyhow::Result<Box<dyn ByteStream>> {
                std::future::pending().await
            }
        }

        paused_runtime().block_on(async {
            let mut config = SenderConfig::new(([127, 0, 0, 1], 8124).into(), HEADER);
            config.connect_timeout = Duration::from_secs(2);
            config.reconnect_initial_interval = Duration::from_millis(500);
            config.reconnect_max_interval = Duration::from_millis(500);

            let start = Instant::now();
            let (_inbox, mut status, _handle) = spawn_driver(Arc::new(config), HangingConnector);

            wait_for_state(&mut status, ConnectionState::Disconnected, 1).await;
            assert_elapsed(start, Duration::from_secs(2));

            wait_for_state(&mut status, ConnectionState::Connecting, 2).await;
            assert_elapsed(start, Duration::from_millis(2500));
        });
    }

    #[test]
    fn test_driver_terminates_when_inbox_closes() {
        paused_runtime().block_on(async {
            let mut connector = MockConnector::new();
            connector.expect_connect()
                .returning(|_| refused());

            let (inbox, _status, handle) = spawn_driver(test_config(), connector);
            tokio::time::sleep(Duration::from_millis(350)).await;

            drop(inbox);
            handle.await.unwrap();
        });
    }

    #[test]
    fn test_stale_connect_completion_is_ignored() {
        paused_runtime().block_on(async {
            let (client, _peer) = duplex(1024);
            let (_inbox_send, inbox) = mpsc::channel(16);
            let (status_send, status) = watch::channel(SenderStatus::INITIAL);

            let mut connector = MockConnector::new();
            connector.expect_connect()
                .returning(|_| refused());

            let mut driver = SenderDriver::new(test_config(), Arc::new(connector), inbox, status_send);
            driver.begin_connect();
            assert_eq!(driver.generation, 2);

            driver.on_connect_finished(1, Ok(Box::new(client) as Box<dyn ByteStream>));

            assert_eq!(driver.state(), ConnectionState::Connecting);
            assert_eq!(*status.borrow(), SenderStatus { state: ConnectionState::Connecting, generation: 2 });
        });
    }
}
