//! RTP Packetizer
//!
//! Splits encrypted frames into wire packets. Packets are generated on demand
//! in whatever order the sender decides to transmit them; each call stamps
//! the next sequence number, so a retransmission is distinguishable from the
//! original on the wire.

use crate::encoded_frame::{EncodedFrame, EncryptedFrame, PacketId};
use crate::rtp_defines::*;
use crate::ssrc::Ssrc;
use bytes::BufMut;
use std::time::Duration;
use tracing::trace;

#[derive(Debug)]
pub struct RtpPacketizer {
    payload_type: RtpPayloadType,
    ssrc: Ssrc,
    sequence_number: u16,
}

impl RtpPacketizer {
    /// `initial_sequence_number` should come from a secure random source
    pub fn new(payload_type: RtpPayloadType, ssrc: Ssrc, initial_sequence_number: u16) -> Self {
        RtpPacketizer {
            payload_type,
            ssrc,
            sequence_number: initial_sequence_number,
        }
    }

    pub fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    /// Sequence number the next generated packet will carry
    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    /// Number of packets `frame` splits into, or `None` if the frame is too
    /// large to address with 16-bit packet ids
    pub fn compute_number_of_packets(frame: &EncodedFrame) -> Option<usize> {
        let num_packets = if frame.data.is_empty() {
            1
        } else {
            (frame.data.len() + MAX_PAYLOAD_PER_PACKET - 1) / MAX_PAYLOAD_PER_PACKET
        };
        if num_packets > MAX_PACKETS_PER_FRAME {
            None
        } else {
            Some(num_packets)
        }
    }

    /// Write packet `packet_id` of `frame` into `buffer`
    ///
    /// Returns the written prefix of `buffer`, or an empty slice if `buffer`
    /// is too small (in which case the sequence number is not consumed).
    pub fn generate_packet<'b>(
        &mut self,
        frame: &EncryptedFrame,
        packet_id: PacketId,
        buffer: &'b mut [u8],
    ) -> &'b [u8] {
        let num_packets = match Self::compute_number_of_packets(frame) {
            Some(n) => n,
            None => return &[],
        };
        debug_assert!((packet_id as usize) < num_packets, "packet id out of range");
        if packet_id as usize >= num_packets {
            return &[];
        }
        let max_packet_id = (num_packets - 1) as PacketId;

        let start = packet_id as usize * MAX_PAYLOAD_PER_PACKET;
        let end = (start + MAX_PAYLOAD_PER_PACKET).min(frame.data.len());
        let payload = &frame.data[start.min(end)..end];

        let playout_delay = if packet_id == 0 {
            frame.new_playout_delay.filter(|d| *d > Duration::ZERO)
        } else {
            None
        };
        let header_size = RTP_BASE_HEADER_SIZE
            + if playout_delay.is_some() {
                ADAPTIVE_LATENCY_HEADER_SIZE
            } else {
                0
            };
        let packet_size = header_size + payload.len();
        if buffer.len() < packet_size {
            return &[];
        }

        let mut marker_and_type = self.payload_type.as_u8() & RTP_PAYLOAD_TYPE_MASK;
        if packet_id == max_packet_id {
            marker_and_type |= RTP_MARKER_BIT;
        }
        let mut cast_flags = RTP_HAS_REFERENCE_FRAME_ID_BIT;
        if frame.dependency.is_key() {
            cast_flags |= RTP_KEY_FRAME_BIT;
        }
        if playout_delay.is_some() {
            cast_flags |= 1;
        }

        let sequence_number = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);

        let mut out = &mut buffer[..packet_size];
        out.put_u8(RTP_REQUIRED_FIRST_BYTE);
        out.put_u8(marker_and_type);
        out.put_u16(sequence_number);
        out.put_u32(frame.rtp_timestamp.lower_32_bits());
        out.put_u32(self.ssrc);
        out.put_u8(cast_flags);
        out.put_u8(frame.frame_id.lower_8_bits());
        out.put_u16(packet_id);
        out.put_u16(max_packet_id);
        out.put_u8(frame.referenced_frame_id.lower_8_bits());
        if let Some(delay) = playout_delay {
            out.put_u16(
                (ADAPTIVE_LATENCY_EXTENSION_TYPE << RTP_EXTENSION_SIZE_BITS)
                    | ADAPTIVE_LATENCY_EXTENSION_SIZE as u16,
            );
            out.put_u16(delay.as_millis().min(u16::MAX as u128) as u16);
        }
        out.put_slice(payload);

        trace!(
            frame_id = %frame.frame_id,
            packet_id,
            max_packet_id,
            sequence_number,
            "generated RTP packet"
        );
        &buffer[..packet_size]
    }
}
