//! Cast Streaming Session Transport
//!
//! This crate drives the protocol core: the `SenderTransport` paces bursts of
//! RTP and RTCP for its registered `Sender`s, and the `Receiver` reassembles
//! frames and answers with compound feedback. Both talk to the network and
//! the clock through an `Environment`.

pub mod config;
pub mod environment;
pub mod receiver;
pub mod sender;
pub mod sender_transport;

pub use config::{ConfigError, SessionConfig, TransportConfig};
pub use environment::{Environment, FakeEnvironment, UdpEnvironment};
pub use receiver::{Receiver, ReceiverStats};
pub use sender::{EnqueueError, FrameCancelObserver, Sender, SenderStats};
pub use sender_transport::{SenderTransport, SenderTransportClient};
