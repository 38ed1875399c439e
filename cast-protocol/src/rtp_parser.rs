//! RTP Packet Parser
//!
//! Receiver-side counterpart of the packetizer. Truncated frame ids are
//! expanded against the highest frame id parsed so far and truncated RTP
//! timestamps against the last parsed timestamp.

use crate::encoded_frame::PacketId;
use crate::frame_id::FrameId;
use crate::rtp_defines::*;
use crate::rtp_time::RtpTimeTicks;
use crate::ssrc::Ssrc;
use bytes::Buf;
use std::time::Duration;

/// A parsed packet, borrowing its payload from the input datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRtpPacket<'a> {
    pub header: RtpCastHeader,
    pub payload: &'a [u8],
}

#[derive(Debug)]
pub struct RtpPacketParser {
    sender_ssrc: Ssrc,
    highest_rtp_frame_id: FrameId,
    last_parsed_rtp_timestamp: RtpTimeTicks,
}

impl RtpPacketParser {
    pub fn new(sender_ssrc: Ssrc) -> Self {
        RtpPacketParser {
            sender_ssrc,
            highest_rtp_frame_id: FrameId::first(),
            last_parsed_rtp_timestamp: RtpTimeTicks::default(),
        }
    }

    /// Parse one RTP packet
    ///
    /// Returns `Ok(None)` for well-formed packets from some other sender.
    pub fn parse<'a>(&mut self, packet: &'a [u8]) -> Result<Option<ParsedRtpPacket<'a>>, PacketError> {
        if packet.len() < RTP_MIN_CAST_HEADER_SIZE {
            return Err(PacketError::InsufficientData {
                expected: RTP_MIN_CAST_HEADER_SIZE,
                actual: packet.len(),
            });
        }

        let mut buf = packet;
        let first_byte = buf.get_u8();
        if first_byte != RTP_REQUIRED_FIRST_BYTE {
            return Err(PacketError::InvalidFirstByte(first_byte));
        }
        // The marker bit is not checked; some senders set it loosely.
        let raw_payload_type = buf.get_u8() & RTP_PAYLOAD_TYPE_MASK;
        let payload_type = RtpPayloadType::from_u8(raw_payload_type)
            .filter(|_| is_rtp_payload_type(raw_payload_type))
            .ok_or(PacketError::UnknownPayloadType(raw_payload_type))?;
        let sequence_number = buf.get_u16();
        let truncated_timestamp = buf.get_u32();
        if buf.get_u32() != self.sender_ssrc {
            return Ok(None);
        }

        let flags = buf.get_u8();
        let is_key_frame = flags & RTP_KEY_FRAME_BIT != 0;
        let has_referenced_frame_id = flags & RTP_HAS_REFERENCE_FRAME_ID_BIT != 0;
        let num_extensions = (flags & RTP_EXTENSION_COUNT_MASK) as usize;
        let frame_id = self.highest_rtp_frame_id.expand(buf.get_u8());
        let packet_id: PacketId = buf.get_u16();
        let max_packet_id: PacketId = buf.get_u16();
        if packet_id > max_packet_id {
            return Err(PacketError::PacketIdOutOfRange {
                packet_id,
                max_packet_id,
            });
        }

        let referenced_frame_id = if has_referenced_frame_id {
            if !buf.has_remaining() {
                return Err(PacketError::InsufficientData {
                    expected: RTP_BASE_HEADER_SIZE,
                    actual: packet.len(),
                });
            }
            frame_id.expand(buf.get_u8())
        } else if is_key_frame {
            frame_id
        } else {
            frame_id - 1
        };

        let mut new_playout_delay = None;
        for _ in 0..num_extensions {
            if buf.remaining() < RTP_EXTENSION_TAG_SIZE {
                return Err(PacketError::TruncatedExtension);
            }
            let type_and_size = buf.get_u16();
            let extension_type = type_and_size >> RTP_EXTENSION_SIZE_BITS;
            let size = (type_and_size & RTP_EXTENSION_SIZE_MASK) as usize;
            if buf.remaining() < size {
                return Err(PacketError::TruncatedExtension);
            }
            if extension_type == ADAPTIVE_LATENCY_EXTENSION_TYPE
                && size >= ADAPTIVE_LATENCY_EXTENSION_SIZE
            {
                let millis = (&buf[..ADAPTIVE_LATENCY_EXTENSION_SIZE]).get_u16();
                new_playout_delay = Some(Duration::from_millis(millis as u64));
            }
            buf.advance(size);
        }

        let rtp_timestamp = self.last_parsed_rtp_timestamp.expand(truncated_timestamp);
        self.last_parsed_rtp_timestamp = rtp_timestamp;
        self.highest_rtp_frame_id = self.highest_rtp_frame_id.max(frame_id);

        Ok(Some(ParsedRtpPacket {
            header: RtpCastHeader {
                payload_type,
                sequence_number,
                rtp_timestamp,
                is_key_frame,
                frame_id,
                packet_id,
                max_packet_id,
                referenced_frame_id,
                new_playout_delay,
            },
            payload: buf,
        }))
    }
}
