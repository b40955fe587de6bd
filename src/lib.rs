//! A fire-and-forget TCP sender for telemetry data. It keeps a long-lived outbound connection to
//!  a metrics collector, reconnects silently whenever that connection is lost, and re-announces
//!  its session on every new connection, so applications can just hand over data without ever
//!  dealing with connection state.
//!
//! ## Design goals
//!
//! * Availability and self-healing rather than reliability
//!   * there is no acknowledgement, no resending and no buffering across connections. Data
//!      submitted while there is no connection is dropped, and so is data that is queued when
//!      a connection breaks
//!   * the sender never gives up: it keeps retrying until it is dropped, even if the collector
//!      is permanently unreachable
//! * Never interfere with the instrumented application
//!   * `send()` and `start()` never block, regardless of connection state
//!   * transport failures are logged, never surfaced to the caller
//!   * memory is bounded: the hand-over queue and the current connection's write queue each
//!      hold at most `send_queue_capacity` messages, overflowing data is dropped. A collector
//!      that accepts data but stops reading does not make the sender grow
//! * Messages are opaque byte sequences, written verbatim. The sender adds no framing of its own,
//!    message boundaries are the payload's responsibility
//!
//! ## Wire contract
//!
//! ```ascii
//! connect
//! [session header]    - exactly the configured bytes, first thing on every connection
//! [message 1]         - verbatim, in the order of send() calls
//! [message 2]
//! ...
//! ```
//!
//! Anything the collector sends back is read and discarded - reading is only done to detect a
//!  closed or reset connection as early as possible.
//!
//! ## Connection state machine
//!
//! ```ascii
//!             start()
//!                |
//!                v
//!   +------> Connecting ----- connect ok -----> Connected
//!   |            |                                  |
//!   |     connect failed / timeout        write / read error, EOF
//!   |            |                                  |
//!   |            v                                  |
//!   +--timer-- Disconnected <-----------------------+
//! ```
//!
//! All of this state lives in a single driver task that is spawned on a tokio runtime handle
//!  provided by the application. Callers on any thread hand data to that task through a bounded
//!  channel, so there is no locking around the state machine. Dropping the [sender::TcpSender]
//!  aborts the driver task, closing the connection and cancelling timers.

pub mod backoff;
pub mod config;
pub mod connector;
mod driver;
pub mod sender;
pub mod state;
pub mod test_util;
