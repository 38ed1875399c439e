//! Compound RTCP Builder
//!
//! Receiver-side construction of the feedback packet sent back to a sender.
//! Every packet contains, in order:
//!
//! 1. a Receiver Report, with a report block if one was provided,
//! 2. an Extended Report carrying the receiver's reference time,
//! 3. the Cast Feedback message: checkpoint, playout delay, NACK loss fields
//!    and the CST2 ACK bit vector,
//! 4. a Picture Loss Indicator, while that flag is set.
//!
//! When the output buffer cannot hold everything, lower priority content is
//! dropped first: NACKs after ACKs, and the PLI last of all (it is sticky and
//! goes out with a later packet).

use crate::encoded_frame::{PacketNack, ALL_PACKETS_LOST};
use crate::frame_id::FrameId;
use crate::rtcp_common::*;
use crate::rtcp_session::RtcpSession;
use bytes::BufMut;
use std::time::{Duration, Instant};
use tracing::trace;

/// Minimum buffer size `build_packet` accepts
pub const RTCP_REQUIRED_BUFFER_SIZE: usize = 256;

/// Default target playout delay
pub const DEFAULT_PLAYOUT_DELAY: Duration = Duration::from_millis(400);

const RECEIVER_REPORT_PACKET_SIZE: usize = RTCP_COMMON_HEADER_SIZE + RTCP_RECEIVER_REPORT_SIZE;
const REFERENCE_TIME_PACKET_SIZE: usize = RTCP_COMMON_HEADER_SIZE
    + RTCP_EXTENDED_REPORT_HEADER_SIZE
    + RTCP_EXTENDED_REPORT_BLOCK_HEADER_SIZE
    + RTCP_RECEIVER_REFERENCE_TIME_REPORT_BLOCK_SIZE;
const FEEDBACK_PACKET_MIN_SIZE: usize = RTCP_COMMON_HEADER_SIZE + RTCP_FEEDBACK_HEADER_SIZE;
const PICTURE_LOSS_PACKET_SIZE: usize =
    RTCP_COMMON_HEADER_SIZE + RTCP_PICTURE_LOSS_INDICATOR_HEADER_SIZE;

const BITS_PER_OCTET: i64 = 8;
const ACK_BIT_VECTOR_INCREMENT: usize = 4;

#[derive(Debug)]
pub struct CompoundRtcpBuilder {
    session: RtcpSession,
    checkpoint_frame_id: FrameId,
    playout_delay: Duration,
    picture_loss_indicator: bool,
    receiver_report: Option<RtcpReportBlock>,
    nacks: Vec<PacketNack>,
    acks: Vec<FrameId>,
    feedback_count: u8,
}

impl CompoundRtcpBuilder {
    pub fn new(session: RtcpSession) -> Self {
        CompoundRtcpBuilder {
            session,
            checkpoint_frame_id: FrameId::first() - 1,
            playout_delay: DEFAULT_PLAYOUT_DELAY,
            picture_loss_indicator: false,
            receiver_report: None,
            nacks: Vec::new(),
            acks: Vec::new(),
            feedback_count: 0,
        }
    }

    pub fn session(&self) -> &RtcpSession {
        &self.session
    }

    pub fn checkpoint_frame(&self) -> FrameId {
        self.checkpoint_frame_id
    }

    /// Every frame up to and including `frame_id` is resolved; never moves
    /// backwards
    pub fn set_checkpoint_frame(&mut self, frame_id: FrameId) {
        debug_assert!(frame_id >= self.checkpoint_frame_id);
        self.checkpoint_frame_id = self.checkpoint_frame_id.max(frame_id);
    }

    pub fn playout_delay(&self) -> Duration {
        self.playout_delay
    }

    pub fn set_playout_delay(&mut self, delay: Duration) {
        self.playout_delay = delay;
    }

    pub fn is_picture_loss_indicator_set(&self) -> bool {
        self.picture_loss_indicator
    }

    /// Sticky until cleared
    pub fn set_picture_loss_indicator(&mut self, picture_is_lost: bool) {
        self.picture_loss_indicator = picture_is_lost;
    }

    /// Include `block` in the next packet only
    pub fn include_receiver_report_in_next_packet(&mut self, block: RtcpReportBlock) {
        self.receiver_report = Some(block);
    }

    /// Include NACKs and ACKs in the next packet only
    ///
    /// Entries at or before the checkpoint current at build time are dropped.
    pub fn include_feedback_in_next_packet(
        &mut self,
        frame_nacks: &[FrameId],
        packet_nacks: &[PacketNack],
        frame_acks: &[FrameId],
    ) {
        self.nacks.clear();
        self.nacks.extend_from_slice(packet_nacks);
        self.nacks
            .extend(frame_nacks.iter().map(|id| PacketNack::whole_frame(*id)));
        self.nacks.sort_unstable();
        self.nacks.dedup();

        self.acks.clear();
        self.acks.extend_from_slice(frame_acks);
        self.acks.sort_unstable();
        self.acks.dedup();
    }

    /// Serialize a compound packet into `buffer`, returning its length
    ///
    /// # Panics
    /// Panics if `buffer` is smaller than `RTCP_REQUIRED_BUFFER_SIZE`
    pub fn build_packet(&mut self, send_time: Instant, buffer: &mut [u8]) -> usize {
        assert!(
            buffer.len() >= RTCP_REQUIRED_BUFFER_SIZE,
            "RTCP buffer of {} bytes is smaller than the required {}",
            buffer.len(),
            RTCP_REQUIRED_BUFFER_SIZE
        );

        let report = self.receiver_report.take();
        let mut budget = buffer.len()
            - RECEIVER_REPORT_PACKET_SIZE
            - report.as_ref().map_or(0, |_| RTCP_REPORT_BLOCK_SIZE)
            - REFERENCE_TIME_PACKET_SIZE
            - FEEDBACK_PACKET_MIN_SIZE;

        let ack_bit_vector = if budget >= RTCP_FEEDBACK_ACK_HEADER_SIZE + RTCP_MIN_ACK_BIT_VECTOR_OCTETS {
            let octets = self.encode_ack_bit_vector(budget - RTCP_FEEDBACK_ACK_HEADER_SIZE);
            budget -= RTCP_FEEDBACK_ACK_HEADER_SIZE + octets.len();
            Some(octets)
        } else {
            None
        };

        let max_loss_fields = (budget / RTCP_FEEDBACK_LOSS_FIELD_SIZE).min(RTCP_MAX_FEEDBACK_LOSS_FIELDS);
        let loss_fields = self.encode_loss_fields(max_loss_fields);
        budget -= loss_fields.len() * RTCP_FEEDBACK_LOSS_FIELD_SIZE;

        let include_pli = self.picture_loss_indicator && budget >= PICTURE_LOSS_PACKET_SIZE;

        let receiver_ssrc = self.session.receiver_ssrc();
        let sender_ssrc = self.session.sender_ssrc();
        let capacity = buffer.len();
        let mut out = &mut buffer[..];

        // Receiver Report
        let report_size = RTCP_RECEIVER_REPORT_SIZE + report.as_ref().map_or(0, |_| RTCP_REPORT_BLOCK_SIZE);
        RtcpCommonHeader::new(
            RtcpPacketType::ReceiverReport,
            report.is_some() as u8,
            report_size,
        )
        .serialize(&mut out);
        out.put_u32(receiver_ssrc);
        if let Some(block) = &report {
            block.serialize(&mut out);
        }

        // Receiver Reference Time Report
        RtcpCommonHeader::new(
            RtcpPacketType::ExtendedReports,
            0,
            REFERENCE_TIME_PACKET_SIZE - RTCP_COMMON_HEADER_SIZE,
        )
        .serialize(&mut out);
        out.put_u32(receiver_ssrc);
        out.put_u8(RTCP_RECEIVER_REFERENCE_TIME_REPORT_BLOCK_TYPE);
        out.put_u8(0);
        out.put_u16((RTCP_RECEIVER_REFERENCE_TIME_REPORT_BLOCK_SIZE / 4) as u16);
        out.put_u64(self.session.ntp_converter().to_ntp_timestamp(send_time));

        // Cast Feedback
        let feedback_size = RTCP_FEEDBACK_HEADER_SIZE
            + loss_fields.len() * RTCP_FEEDBACK_LOSS_FIELD_SIZE
            + ack_bit_vector
                .as_ref()
                .map_or(0, |octets| RTCP_FEEDBACK_ACK_HEADER_SIZE + octets.len());
        RtcpCommonHeader::with_subtype(
            RtcpPacketType::PayloadSpecific,
            RtcpSubtype::Feedback,
            feedback_size,
        )
        .serialize(&mut out);
        out.put_u32(receiver_ssrc);
        out.put_u32(sender_ssrc);
        out.put_u32(RTCP_CAST_IDENTIFIER_WORD);
        out.put_u8(self.checkpoint_frame_id.lower_8_bits());
        out.put_u8(loss_fields.len() as u8);
        out.put_u16(self.playout_delay.as_millis().min(u16::MAX as u128) as u16);
        for field in &loss_fields {
            out.put_u32(*field);
        }
        if let Some(octets) = &ack_bit_vector {
            out.put_u32(RTCP_CST2_IDENTIFIER_WORD);
            out.put_u8(self.feedback_count);
            out.put_u8(octets.len() as u8);
            out.put_slice(octets);
        }

        // Picture Loss Indicator
        if include_pli {
            RtcpCommonHeader::with_subtype(
                RtcpPacketType::PayloadSpecific,
                RtcpSubtype::PictureLossIndicator,
                RTCP_PICTURE_LOSS_INDICATOR_HEADER_SIZE,
            )
            .serialize(&mut out);
            out.put_u32(receiver_ssrc);
            out.put_u32(sender_ssrc);
        }

        let written = capacity - out.remaining_mut();
        trace!(
            checkpoint = %self.checkpoint_frame_id,
            loss_fields = loss_fields.len(),
            picture_lost = include_pli,
            size = written,
            "built compound RTCP packet"
        );

        self.feedback_count = self.feedback_count.wrapping_add(1);
        self.nacks.clear();
        self.acks.clear();
        written
    }

    /// Pack NACKs into loss fields: 8-bit frame id, first packet id, and a
    /// bitmask of the following eight packet ids
    fn encode_loss_fields(&self, max_fields: usize) -> Vec<u32> {
        let mut fields = Vec::new();
        let mut iter = self
            .nacks
            .iter()
            .filter(|nack| nack.frame_id > self.checkpoint_frame_id)
            .peekable();
        while fields.len() < max_fields {
            let first = match iter.next() {
                Some(nack) => nack,
                None => break,
            };
            let mut field =
                ((first.frame_id.lower_8_bits() as u32) << 24) | ((first.packet_id as u32) << 8);
            if first.packet_id != ALL_PACKETS_LOST {
                while let Some(next) = iter.peek() {
                    if next.frame_id != first.frame_id || next.packet_id == ALL_PACKETS_LOST {
                        break;
                    }
                    let shift = next.packet_id as i64 - first.packet_id as i64 - 1;
                    if !(0..8).contains(&shift) {
                        break;
                    }
                    field |= 1 << shift;
                    iter.next();
                }
            }
            fields.push(field);
        }
        fields
    }

    /// Encode ACKs as a bit vector whose bit 0 is `checkpoint + 2`, the first
    /// frame that could possibly be ACKed individually
    fn encode_ack_bit_vector(&self, max_octets: usize) -> Vec<u8> {
        let max_octets = max_octets.min(RTCP_MAX_ACK_BIT_VECTOR_OCTETS);
        let mut octets = vec![0u8; RTCP_MIN_ACK_BIT_VECTOR_OCTETS];
        let first_frame_id = self.checkpoint_frame_id + 2;
        for frame_id in &self.acks {
            let bit_index = *frame_id - first_frame_id;
            if bit_index < 0 {
                continue;
            }
            let octet_index = (bit_index / BITS_PER_OCTET) as usize;
            if octet_index >= octets.len() {
                let needed = octet_index + 1 - octets.len();
                let grown = octets.len()
                    + (needed + ACK_BIT_VECTOR_INCREMENT - 1) / ACK_BIT_VECTOR_INCREMENT
                        * ACK_BIT_VECTOR_INCREMENT;
                if grown > max_octets {
                    break;
                }
                octets.resize(grown, 0);
            }
            octets[octet_index] |= 1 << (bit_index % BITS_PER_OCTET);
        }
        octets
    }
}
