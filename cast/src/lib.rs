//! Cast Streaming
//!
//! High-level Rust API for Cast Streaming frame transport: encrypted media
//! frames carried over RTP, with compound RTCP feedback driving
//! retransmission and pacing.

pub use cast_crypto as crypto;
pub use cast_io as io;
pub use cast_protocol as protocol;
pub use cast_transport as transport;

// Re-export commonly used types
pub use protocol::{Dependency, EncodedFrame, FrameId, RtpPayloadType, RtpTimeTicks, Ssrc};
pub use transport::{
    Environment, Receiver, Sender, SenderTransport, SessionConfig, TransportConfig, UdpEnvironment,
};
