use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// A snapshot of a sender's connection state, published on every transition.
///
/// `generation` identifies the connect attempt the state belongs to: it is incremented for every
///  attempt, so a `Connected` status with a higher generation than previously observed means
///  that the sender reconnected in between.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SenderStatus {
    pub state: ConnectionState,
    pub generation: u64,
}

impl SenderStatus {
    pub const INITIAL: SenderStatus = SenderStatus {
        state: ConnectionState::Disconnected,
        generation: 0,
    };

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}
