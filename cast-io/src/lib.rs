//! Cast Streaming I/O and Platform Abstraction
//!
//! This crate provides the collaborators the protocol core is driven by:
//! a clock (real or manually advanced), cancelable alarm deadlines, and a
//! UDP socket wrapper whose sends never wait.

pub mod socket;
pub mod time;

pub use socket::{CastSocket, SocketError};
pub use time::{Alarm, Clock, ManualClock, SystemClock};
