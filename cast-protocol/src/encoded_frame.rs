//! Frame types exchanged with the encoder/decoder boundary

use crate::frame_id::FrameId;
use crate::rtp_time::RtpTimeTicks;
use bytes::Bytes;
use std::ops::Deref;
use std::time::{Duration, Instant};

/// Packet index within a frame
pub type PacketId = u16;

/// NACK sentinel meaning "every packet of this frame is missing"
pub const ALL_PACKETS_LOST: PacketId = 0xFFFF;

/// How a frame depends on earlier frames for decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dependency {
    /// Decodable alone; later frames may reference it as a recovery point
    Key,
    /// Decodable alone
    Independent,
    /// Needs `referenced_frame_id` to decode
    Dependent,
}

impl Dependency {
    #[inline]
    pub fn is_key(self) -> bool {
        self == Dependency::Key
    }
}

/// One unit of encoded media
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub dependency: Dependency,
    pub frame_id: FrameId,
    /// Frame needed to decode this one; equals `frame_id` for key frames
    pub referenced_frame_id: FrameId,
    pub rtp_timestamp: RtpTimeTicks,
    /// Capture time of the media, used for lip-sync reports
    pub reference_time: Option<Instant>,
    /// Requests a change of the receiver's playout delay from this frame on
    pub new_playout_delay: Option<Duration>,
    pub data: Bytes,
}

impl EncodedFrame {
    pub fn new(
        dependency: Dependency,
        frame_id: FrameId,
        referenced_frame_id: FrameId,
        rtp_timestamp: RtpTimeTicks,
        data: impl Into<Bytes>,
    ) -> Self {
        EncodedFrame {
            dependency,
            frame_id,
            referenced_frame_id,
            rtp_timestamp,
            reference_time: None,
            new_playout_delay: None,
            data: data.into(),
        }
    }

    pub fn with_reference_time(mut self, reference_time: Instant) -> Self {
        self.reference_time = Some(reference_time);
        self
    }

    pub fn with_new_playout_delay(mut self, delay: Duration) -> Self {
        self.new_playout_delay = Some(delay);
        self
    }
}

/// An `EncodedFrame` whose payload has been encrypted
///
/// Only `FrameCrypto` and the receive-side `FrameCollector` construct these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedFrame(EncodedFrame);

impl EncryptedFrame {
    pub(crate) fn from_encrypted_parts(frame: EncodedFrame) -> Self {
        EncryptedFrame(frame)
    }
}

impl Deref for EncryptedFrame {
    type Target = EncodedFrame;

    fn deref(&self) -> &EncodedFrame {
        &self.0
    }
}

/// Request to resend one packet, or a whole frame when `packet_id` is
/// `ALL_PACKETS_LOST`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketNack {
    pub frame_id: FrameId,
    pub packet_id: PacketId,
}

impl PacketNack {
    pub fn new(frame_id: FrameId, packet_id: PacketId) -> Self {
        PacketNack {
            frame_id,
            packet_id,
        }
    }

    pub fn whole_frame(frame_id: FrameId) -> Self {
        PacketNack::new(frame_id, ALL_PACKETS_LOST)
    }

    #[inline]
    pub fn is_whole_frame(&self) -> bool {
        self.packet_id == ALL_PACKETS_LOST
    }
}
