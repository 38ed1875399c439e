//! RTP Wire Format
//!
//! Cast RTP packet layout (all fields big-endian):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1 0|0|0|  CC=0 |M| Payload Type|        Sequence Number        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         RTP Timestamp                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |K|R| Ext Count |   Frame ID    |           Packet ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Max Packet ID         | Ref Frame ID  |  Extensions...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Each extension is a 16-bit tag (6-bit type, 10-bit size) followed by
//! `size` bytes. The only extension we emit is the adaptive latency change
//! (type 1, 2 bytes of delay in milliseconds).

use crate::encoded_frame::{PacketId, ALL_PACKETS_LOST};
use crate::frame_id::FrameId;
use crate::rtp_time::RtpTimeTicks;
use std::time::Duration;
use thiserror::Error;

/// Max UDP payload on a 1500-byte MTU path: 1500 - IPv4 header - UDP header
pub const MAX_RTP_PACKET_SIZE: usize = 1500 - 20 - 8;

/// Version 2, no padding, no extension, no CSRCs
pub const RTP_REQUIRED_FIRST_BYTE: u8 = 0b1000_0000;

pub const RTP_MARKER_BIT: u8 = 0b1000_0000;
pub const RTP_PAYLOAD_TYPE_MASK: u8 = 0b0111_1111;

/// Fixed RTP header (12) plus the Cast header (6), without a referenced frame id
pub const RTP_MIN_CAST_HEADER_SIZE: usize = 18;

/// Header as written by the packetizer: always carries a referenced frame id
pub const RTP_BASE_HEADER_SIZE: usize = 19;

pub const RTP_KEY_FRAME_BIT: u8 = 0b1000_0000;
pub const RTP_HAS_REFERENCE_FRAME_ID_BIT: u8 = 0b0100_0000;
pub const RTP_EXTENSION_COUNT_MASK: u8 = 0b0011_1111;

pub const RTP_EXTENSION_TAG_SIZE: usize = 2;
pub const RTP_EXTENSION_SIZE_BITS: u32 = 10;
pub const RTP_EXTENSION_SIZE_MASK: u16 = (1 << RTP_EXTENSION_SIZE_BITS) - 1;

pub const ADAPTIVE_LATENCY_EXTENSION_TYPE: u16 = 1;
pub const ADAPTIVE_LATENCY_EXTENSION_SIZE: usize = 2;
pub const ADAPTIVE_LATENCY_HEADER_SIZE: usize =
    RTP_EXTENSION_TAG_SIZE + ADAPTIVE_LATENCY_EXTENSION_SIZE;

pub const RTP_MAX_HEADER_SIZE: usize = RTP_BASE_HEADER_SIZE + ADAPTIVE_LATENCY_HEADER_SIZE;

/// Payload bytes per packet; the latency extension is reserved space in
/// every packet so packet boundaries do not depend on it
pub const MAX_PAYLOAD_PER_PACKET: usize = MAX_RTP_PACKET_SIZE - RTP_MAX_HEADER_SIZE;

/// Largest valid packet count per frame; keeps `ALL_PACKETS_LOST` free
pub const MAX_PACKETS_PER_FRAME: usize = ALL_PACKETS_LOST as usize - 1;

/// Payload types used by Cast streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RtpPayloadType {
    Null = 0,
    AudioOpus = 96,
    AudioAac = 97,
    AudioPcm16 = 98,
    RemoteAudio = 99,
    VideoVp8 = 100,
    VideoH264 = 101,
    RemoteVideo = 102,
}

impl RtpPayloadType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RtpPayloadType::Null),
            96 => Some(RtpPayloadType::AudioOpus),
            97 => Some(RtpPayloadType::AudioAac),
            98 => Some(RtpPayloadType::AudioPcm16),
            99 => Some(RtpPayloadType::RemoteAudio),
            100 => Some(RtpPayloadType::VideoVp8),
            101 => Some(RtpPayloadType::VideoH264),
            102 => Some(RtpPayloadType::RemoteVideo),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_audio(self) -> bool {
        matches!(
            self,
            RtpPayloadType::AudioOpus
                | RtpPayloadType::AudioAac
                | RtpPayloadType::AudioPcm16
                | RtpPayloadType::RemoteAudio
        )
    }

    pub fn is_video(self) -> bool {
        matches!(
            self,
            RtpPayloadType::VideoVp8 | RtpPayloadType::VideoH264 | RtpPayloadType::RemoteVideo
        )
    }
}

/// True for the dynamic payload types a Cast stream may carry
pub fn is_rtp_payload_type(raw: u8) -> bool {
    (RtpPayloadType::AudioOpus.as_u8()..=RtpPayloadType::RemoteVideo.as_u8()).contains(&raw)
}

/// Parsed view of one RTP packet's headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpCastHeader {
    pub payload_type: RtpPayloadType,
    pub sequence_number: u16,
    pub rtp_timestamp: RtpTimeTicks,
    pub is_key_frame: bool,
    pub frame_id: FrameId,
    pub packet_id: PacketId,
    pub max_packet_id: PacketId,
    pub referenced_frame_id: FrameId,
    pub new_playout_delay: Option<Duration>,
}

/// RTP packet parse errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Invalid first byte: {0:#04x}")]
    InvalidFirstByte(u8),

    #[error("Unknown payload type: {0}")]
    UnknownPayloadType(u8),

    #[error("Packet id {packet_id} exceeds max packet id {max_packet_id}")]
    PacketIdOutOfRange {
        packet_id: PacketId,
        max_packet_id: PacketId,
    },

    #[error("Truncated header extension")]
    TruncatedExtension,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_constants() {
        assert_eq!(MAX_RTP_PACKET_SIZE, 1472);
        assert_eq!(RTP_MAX_HEADER_SIZE, 23);
        assert_eq!(MAX_PAYLOAD_PER_PACKET, 1449);
        assert_eq!(MAX_PACKETS_PER_FRAME, 0xFFFE);
    }

    #[test]
    fn test_payload_type_roundtrip() {
        for raw in 0u8..=127 {
            if let Some(pt) = RtpPayloadType::from_u8(raw) {
                assert_eq!(pt.as_u8(), raw);
            }
        }
        assert_eq!(RtpPayloadType::from_u8(95), None);
        assert!(RtpPayloadType::AudioOpus.is_audio());
        assert!(RtpPayloadType::VideoVp8.is_video());
        assert!(!RtpPayloadType::Null.is_audio());
    }

    #[test]
    fn test_is_rtp_payload_type() {
        assert!(is_rtp_payload_type(96));
        assert!(is_rtp_payload_type(102));
        assert!(!is_rtp_payload_type(0));
        // RTCP packet types masked to 7 bits never collide.
        for rtcp in 200u8..=207 {
            assert!(!is_rtp_payload_type(rtcp & RTP_PAYLOAD_TYPE_MASK));
        }
    }
}
