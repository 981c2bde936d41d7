//! Upgraded-stream plumbing.
//!
//! A debug request rides a plain HTTP POST until the agent accepts it, at
//! which point the connection is upgraded (101) and switches to a framed,
//! multiplexed byte protocol carrying stdin, stdout, stderr and terminal
//! resize events over the one TCP connection. This crate owns the wire
//! format and the upgrade dance; the session orchestrator only ever sees
//! in-process read/write halves and a resize event channel.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod protocol;
pub mod upgrade;

pub use error::{Result, StreamError};
pub use protocol::{Channel, FrameDecoder, TerminalSize, encode_frame};
pub use upgrade::{SessionStreams, StreamOptions, StreamTimeouts, serve_upgrade, PROTOCOL_V1};
