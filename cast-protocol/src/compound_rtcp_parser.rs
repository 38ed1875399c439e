//! Compound RTCP Parser
//!
//! Sender-side consumption of receiver feedback. A compound packet is parsed
//! and validated in full into an `RtcpFeedback` before anything is reported
//! to a client, so a packet that turns out to be corrupt halfway through
//! never causes partial action.

use crate::encoded_frame::{PacketNack, ALL_PACKETS_LOST};
use crate::frame_id::FrameId;
use crate::rtcp_common::*;
use crate::rtcp_session::RtcpSession;
use bytes::Buf;
use std::time::{Duration, Instant};
use tracing::trace;

/// Receives the events found in a parsed compound packet
///
/// All methods default to doing nothing. Feedback may be semantically
/// implausible (for example a NACK for a frame never sent); implementations
/// must tolerate that.
pub trait CompoundRtcpParserClient {
    fn on_receiver_reference_time_advanced(&mut self, _reference_time: Instant) {}
    fn on_receiver_report(&mut self, _report: &RtcpReportBlock) {}
    fn on_receiver_indicates_picture_loss(&mut self) {}
    fn on_receiver_checkpoint(&mut self, _frame_id: FrameId, _playout_delay: Duration) {}
    /// Frames received ahead of the checkpoint, sorted
    fn on_receiver_has_frames(&mut self, _acks: &[FrameId]) {}
    /// Frames missing every packet, sorted
    fn on_receiver_is_missing_frames(&mut self, _frame_ids: &[FrameId]) {}
    /// Individual missing packets, sorted
    fn on_receiver_is_missing_packets(&mut self, _nacks: &[PacketNack]) {}
}

/// Everything of interest found in one well-formed compound packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtcpFeedback {
    /// Set only when it advances the latest reference time seen
    pub reference_time: Option<Instant>,
    pub receiver_report: Option<RtcpReportBlock>,
    pub picture_loss: bool,
    pub checkpoint: Option<(FrameId, Duration)>,
    pub received_frames: Vec<FrameId>,
    pub missing_frames: Vec<FrameId>,
    pub missing_packets: Vec<PacketNack>,
}

impl RtcpFeedback {
    pub fn is_empty(&self) -> bool {
        *self == RtcpFeedback::default()
    }

    /// Report each event to `client`
    pub fn dispatch<C>(&self, client: &mut C)
    where
        C: CompoundRtcpParserClient + ?Sized,
    {
        if let Some(reference_time) = self.reference_time {
            client.on_receiver_reference_time_advanced(reference_time);
        }
        if let Some(report) = &self.receiver_report {
            client.on_receiver_report(report);
        }
        if let Some((frame_id, playout_delay)) = self.checkpoint {
            client.on_receiver_checkpoint(frame_id, playout_delay);
        }
        if !self.received_frames.is_empty() {
            client.on_receiver_has_frames(&self.received_frames);
        }
        if !self.missing_frames.is_empty() {
            client.on_receiver_is_missing_frames(&self.missing_frames);
        }
        if !self.missing_packets.is_empty() {
            client.on_receiver_is_missing_packets(&self.missing_packets);
        }
        if self.picture_loss {
            client.on_receiver_indicates_picture_loss();
        }
    }
}

#[derive(Debug)]
pub struct CompoundRtcpParser {
    session: RtcpSession,
    latest_receiver_timestamp: Option<Instant>,
}

impl CompoundRtcpParser {
    pub fn new(session: RtcpSession) -> Self {
        CompoundRtcpParser {
            session,
            latest_receiver_timestamp: None,
        }
    }

    pub fn session(&self) -> &RtcpSession {
        &self.session
    }

    /// Parse a compound packet
    ///
    /// `max_feedback_frame_id` is the most recent frame the sender has sent;
    /// truncated frame ids are expanded relative to it.
    pub fn parse(
        &mut self,
        packet: &[u8],
        max_feedback_frame_id: FrameId,
    ) -> Result<RtcpFeedback, RtcpParseError> {
        let mut feedback = RtcpFeedback::default();
        let mut reference_time = None;
        let mut missing = Vec::new();

        let mut buf = packet;
        while let Some((header, payload)) = next_rtcp_packet(&mut buf)? {
            match (header.packet_type, header.subtype()) {
                (RtcpPacketType::ReceiverReport, _) => {
                    self.parse_receiver_report(payload, header.item_count(), &mut feedback)?
                }
                (RtcpPacketType::PayloadSpecific, Some(RtcpSubtype::PictureLossIndicator)) => {
                    self.parse_picture_loss_indicator(payload, &mut feedback)?
                }
                (RtcpPacketType::PayloadSpecific, Some(RtcpSubtype::Feedback)) => self
                    .parse_feedback(payload, max_feedback_frame_id, &mut feedback, &mut missing)?,
                (RtcpPacketType::ExtendedReports, _) => {
                    if let Some(time) = self.parse_extended_reports(payload)? {
                        reference_time = Some(time);
                    }
                }
                _ => {}
            }
        }

        // Stale (reordered) packets only lose their reference time; the rest
        // of their feedback is still current enough to act on.
        if let Some(time) = reference_time {
            match self.latest_receiver_timestamp {
                Some(latest) if time < latest => {
                    trace!("ignoring stale receiver reference time");
                }
                _ => {
                    self.latest_receiver_timestamp = Some(time);
                    feedback.reference_time = Some(time);
                }
            }
        }

        feedback.received_frames.sort_unstable();
        feedback.received_frames.dedup();
        scrub_missing_packets(&mut missing);
        for nack in missing {
            if nack.is_whole_frame() {
                feedback.missing_frames.push(nack.frame_id);
            } else {
                feedback.missing_packets.push(nack);
            }
        }

        Ok(feedback)
    }

    fn parse_receiver_report(
        &self,
        mut payload: &[u8],
        num_blocks: usize,
        feedback: &mut RtcpFeedback,
    ) -> Result<(), RtcpParseError> {
        if payload.len() < RTCP_RECEIVER_REPORT_SIZE {
            return Err(RtcpParseError::MalformedBlock("receiver report"));
        }
        if payload.get_u32() == self.session.receiver_ssrc() {
            if let Some(block) =
                RtcpReportBlock::parse_one(payload, num_blocks, self.session.sender_ssrc())?
            {
                feedback.receiver_report = Some(block);
            }
        }
        Ok(())
    }

    fn parse_picture_loss_indicator(
        &self,
        mut payload: &[u8],
        feedback: &mut RtcpFeedback,
    ) -> Result<(), RtcpParseError> {
        if payload.len() < RTCP_PICTURE_LOSS_INDICATOR_HEADER_SIZE {
            return Err(RtcpParseError::MalformedBlock("picture loss indicator"));
        }
        if payload.get_u32() == self.session.receiver_ssrc()
            && payload.get_u32() == self.session.sender_ssrc()
        {
            feedback.picture_loss = true;
        }
        Ok(())
    }

    fn parse_feedback(
        &self,
        mut payload: &[u8],
        max_feedback_frame_id: FrameId,
        feedback: &mut RtcpFeedback,
        missing: &mut Vec<PacketNack>,
    ) -> Result<(), RtcpParseError> {
        if payload.len() < RTCP_FEEDBACK_HEADER_SIZE {
            return Err(RtcpParseError::MalformedBlock("feedback"));
        }
        if payload.get_u32() != self.session.receiver_ssrc()
            || payload.get_u32() != self.session.sender_ssrc()
        {
            return Ok(());
        }
        let identifier = payload.get_u32();
        if identifier != RTCP_CAST_IDENTIFIER_WORD {
            return Err(RtcpParseError::BadIdentifier(identifier));
        }

        let checkpoint = max_feedback_frame_id.expand_less_than_or_equal(payload.get_u8());
        let loss_field_count = payload.get_u8() as usize;
        let playout_delay = Duration::from_millis(payload.get_u16() as u64);
        match feedback.checkpoint {
            Some((existing, _)) if existing > checkpoint => {}
            _ => feedback.checkpoint = Some((checkpoint, playout_delay)),
        }

        if payload.len() < loss_field_count * RTCP_FEEDBACK_LOSS_FIELD_SIZE {
            return Err(RtcpParseError::MalformedBlock("feedback loss fields"));
        }
        for _ in 0..loss_field_count {
            let frame_id = checkpoint.expand_greater_than(payload.get_u8());
            let packet_id = payload.get_u16();
            let mut bits = payload.get_u8();
            missing.push(PacketNack::new(frame_id, packet_id));
            if packet_id == ALL_PACKETS_LOST {
                continue;
            }
            let mut next_id = packet_id;
            while bits != 0 {
                next_id = match next_id.checked_add(1) {
                    Some(id) if id != ALL_PACKETS_LOST => id,
                    _ => break,
                };
                if bits & 1 != 0 {
                    missing.push(PacketNack::new(frame_id, next_id));
                }
                bits >>= 1;
            }
        }

        // Anything after the loss fields that is not CST2 is ignored rather
        // than treated as corrupt, for compatibility with older receivers.
        if payload.len() < RTCP_FEEDBACK_ACK_HEADER_SIZE || payload.get_u32() != RTCP_CST2_IDENTIFIER_WORD {
            return Ok(());
        }
        let _feedback_count = payload.get_u8();
        let octet_count = payload.get_u8() as usize;
        if payload.len() < octet_count {
            return Err(RtcpParseError::MalformedBlock("feedback ACK bit vector"));
        }
        let mut first_frame_id = checkpoint + 2;
        for octet in &payload[..octet_count] {
            let mut bits = *octet;
            let mut frame_id = first_frame_id;
            while bits != 0 {
                if bits & 1 != 0 {
                    feedback.received_frames.push(frame_id);
                }
                frame_id = frame_id.next();
                bits >>= 1;
            }
            first_frame_id += 8;
        }
        Ok(())
    }

    fn parse_extended_reports(&self, mut payload: &[u8]) -> Result<Option<Instant>, RtcpParseError> {
        if payload.len() < RTCP_EXTENDED_REPORT_HEADER_SIZE {
            return Err(RtcpParseError::MalformedBlock("extended report"));
        }
        if payload.get_u32() != self.session.receiver_ssrc() {
            return Ok(None);
        }
        let mut reference_time = None;
        while !payload.is_empty() {
            if payload.len() < RTCP_EXTENDED_REPORT_BLOCK_HEADER_SIZE {
                return Err(RtcpParseError::MalformedBlock("extended report block"));
            }
            let block_type = payload.get_u8();
            payload.advance(1);
            let block_size = payload.get_u16() as usize * 4;
            if payload.len() < block_size {
                return Err(RtcpParseError::MalformedBlock("extended report block"));
            }
            if block_type == RTCP_RECEIVER_REFERENCE_TIME_REPORT_BLOCK_TYPE {
                if block_size != RTCP_RECEIVER_REFERENCE_TIME_REPORT_BLOCK_SIZE {
                    return Err(RtcpParseError::MalformedBlock("reference time report"));
                }
                let ntp = (&payload[..block_size]).get_u64();
                reference_time = Some(self.session.ntp_converter().to_local_time(ntp));
            }
            payload.advance(block_size);
        }
        Ok(reference_time)
    }
}

/// Sort and de-duplicate NACKs, dropping packet NACKs made redundant by a
/// whole-frame NACK for the same frame
fn scrub_missing_packets(nacks: &mut Vec<PacketNack>) {
    // The sentinel sorts first within its frame, so one pass suffices.
    nacks.sort_unstable_by_key(|nack| (nack.frame_id, nack.packet_id.wrapping_add(1)));
    nacks.dedup_by(|current, kept| {
        current.frame_id == kept.frame_id
            && (kept.packet_id == ALL_PACKETS_LOST || current.packet_id == kept.packet_id)
    });
}
