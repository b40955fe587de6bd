//! This module contains utilities for testing code that sends data through a
//!  [crate::sender::TcpSender]. They are used for testing the sender itself, but they are also
//!  exported for application testing, so they are part of the crate's regular
//!  (non-#[cfg(test)]) code.

pub mod recording_peer;
