use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// The collector's address. It is fixed for the sender's lifetime, i.e. it is not re-resolved
    ///  on reconnect.
    pub endpoint: SocketAddr,

    /// These bytes identify the sender's session to the collector. They are sent verbatim as the
    ///  very first bytes of every connection, including every reconnect, allowing the collector
    ///  to re-establish session identity after gaps - even gaps that the sender did not notice.
    pub session_header: Bytes,

    /// Delay before the first reconnect attempt after a failure. This should be long enough to
    ///  avoid a tight loop against an unreachable collector, and short enough to pick up a
    ///  collector that comes back after a short outage.
    pub reconnect_initial_interval: Duration,
    pub reconnect_max_interval: Duration,
    /// growth of the reconnect interval per consecutive failure, in eighths: 8 means no growth,
    ///  16 means doubling
    pub reconnect_factor_eighths: u32,

    pub connect_timeout: Duration,

    /// Maximum number of messages handed over by `send()` but not yet picked up by the sender's
    ///  driver, and also the maximum number of messages queued for writing on a connection.
    ///  Messages in excess of either are dropped.
    pub send_queue_capacity: usize,

    pub tcp_nodelay: bool,
    /// TCP keepalive idle time, `None` to leave the OS default
    pub tcp_keepalive: Option<Duration>,
}

impl SenderConfig {
    pub fn new(endpoint: SocketAddr, session_header: impl Into<Bytes>) -> SenderConfig {
        SenderConfig {
            endpoint,
            session_header: session_header.into(),
            reconnect_initial_interval: Duration::from_secs(1),
            reconnect_max_interval: Duration::from_secs(1),
            reconnect_factor_eighths: 16,
            connect_timeout: Duration::from_secs(5),
            send_queue_capacity: 1024,
            tcp_nodelay: true,
            tcp_keepalive: Some(Duration::from_secs(30)),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoint.port() == 0 {
            bail!("destination port must be positive: {:?}", self.endpoint);
        }
        if self.reconnect_initial_interval.is_zero() {
            bail!("reconnect interval must not be zero");
        }
        if self.reconnect_max_interval < self.reconnect_initial_interval {
            bail!("maximum reconnect interval {:?} is less than the initial interval {:?}", self.reconnect_max_interval, self.reconnect_initial_interval);
        }
        if self.reconnect_factor_eighths < 8 {
            bail!("reconnect factor must be at least 8 (i.e. 1.0), was {}", self.reconnect_factor_eighths);
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must not be zero");
        }
        if self.send_queue_capacity == 0 {
            bail!("send queue capacity must be positive");
        }

        Ok(())
    }
}
