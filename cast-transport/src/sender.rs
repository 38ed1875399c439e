//! Frame Sender
//!
//! A `Sender` owns one outbound stream. Enqueued frames are encrypted and
//! parked in a ring of pending slots until the receiver's feedback resolves
//! them. The `SenderTransport` pulls packets out of the sender at the paced
//! rate; receiver feedback sets packets up for retransmission, cancels
//! acknowledged frames and moves the checkpoint forward.
//!
//! Loss recovery is passive: NACKed packets are resent unless they went out
//! less than one round trip ago, and if the receiver goes quiet about frames
//! it may not know exist, the first packet of the oldest unacknowledged
//! frame is resent periodically (a "kickstart").

use cast_crypto::RandomSource;
use cast_protocol::compound_rtcp_parser::{CompoundRtcpParser, CompoundRtcpParserClient};
use cast_protocol::rtp_defines::RtpPayloadType;
use cast_protocol::{
    Dependency, EncodedFrame, EncryptedFrame, FrameCrypto, FrameId, PacketId, PacketNack,
    RtcpReportBlock, RtcpSenderReport, RtcpSession, RtpPacketizer, RtpTimeDelta, RtpTimeTicks,
    SenderReportBuilder, Ssrc, StatusReportId, ALL_PACKETS_LOST,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::{ConfigError, SessionConfig};
use crate::sender_transport::{SenderTransport, SenderTransportClient};

/// Ring size: frames that may be enqueued but not yet acknowledged
pub const MAX_UNACKED_FRAMES: usize = 120;

const SENDER_REPORT_HISTORY_SIZE: usize = 8;

/// Stand-in for measured round trips at or below zero (clock imprecision)
const NEAR_ZERO_ROUND_TRIP_TIME: Duration = Duration::from_micros(75);

const MIN_KICKSTART_INTERVAL: Duration = Duration::from_millis(20);

const RTT_INERTIA: u32 = 7;

/// Why a frame was not accepted
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("Frame payload too large to packetize")]
    PayloadTooLarge,

    #[error("Too many unacknowledged frames in flight")]
    MaxFramesInFlight,

    #[error("Too much media duration in flight")]
    MaxDurationInFlight,
}

/// Told about every frame the sender stops tracking, because the receiver
/// acknowledged it or moved its checkpoint past it
///
/// Called from within RTCP processing; must not call back into the `Sender`.
pub trait FrameCancelObserver {
    fn on_frame_canceled(&mut self, frame_id: FrameId);
}

impl<F: FnMut(FrameId)> FrameCancelObserver for F {
    fn on_frame_canceled(&mut self, frame_id: FrameId) {
        self(frame_id)
    }
}

/// Sender counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    pub frames_enqueued: u64,
    pub frames_canceled: u64,
    pub packets_sent: u64,
    pub packets_retransmitted: u64,
    pub kickstarts: u64,
    pub octets_sent: u64,
    pub round_trip_time: Duration,
}

#[derive(Debug, Default)]
struct PendingFrameSlot {
    frame: Option<EncryptedFrame>,
    /// Per packet: needs to be (re)sent
    send_flags: Vec<bool>,
    sent_times: Vec<Option<Instant>>,
}

impl PendingFrameSlot {
    fn is_active_for_frame(&self, frame_id: FrameId) -> bool {
        self.frame.as_ref().map_or(false, |f| f.frame_id == frame_id)
    }

    fn last_sent_time(&self) -> Option<Instant> {
        self.sent_times.iter().flatten().max().copied()
    }
}

fn to_slot_index(frame_id: FrameId) -> usize {
    (frame_id - FrameId::first()).rem_euclid(MAX_UNACKED_FRAMES as i64) as usize
}

/// Packet chosen for the next send
struct PacketChoice {
    frame_id: FrameId,
    packet_id: PacketId,
    is_kickstart: bool,
}

struct SenderState {
    transport: SenderTransport,
    ssrc: Ssrc,
    rtcp_parser: CompoundRtcpParser,
    sender_report_builder: SenderReportBuilder,
    packetizer: RtpPacketizer,
    rtp_timebase: u32,
    crypto: FrameCrypto,
    frame_cancel_observer: Option<Box<dyn FrameCancelObserver>>,

    pending_frames: Vec<PendingFrameSlot>,
    last_enqueued_frame_id: FrameId,
    checkpoint_frame_id: FrameId,
    /// Newest frame the receiver has shown it knows about
    latest_expected_frame_id: FrameId,
    picture_lost_at_frame_id: FrameId,
    last_enqueued_key_frame_id: FrameId,

    target_playout_delay: Duration,
    playout_delay_change_frame_id: FrameId,
    round_trip_time: Duration,

    /// Lip-sync pairing from the latest enqueued frame
    lip_sync: Option<(Instant, RtpTimeTicks)>,
    send_packet_count: u32,
    send_octet_count: u32,
    report_send_times: [Option<(StatusReportId, Instant)>; SENDER_REPORT_HISTORY_SIZE],
    report_send_times_tail: usize,

    stats: SenderStats,
}

/// One outbound stream
///
/// Dropping the sender deregisters it from its transport.
pub struct Sender {
    state: Rc<RefCell<SenderState>>,
    transport: SenderTransport,
    ssrc: Ssrc,
}

impl Sender {
    /// Create a sender for `config` and register it with `transport`
    ///
    /// The initial RTP sequence number is drawn from the secure random source.
    pub fn new(transport: &SenderTransport, config: &SessionConfig) -> Result<Self, ConfigError> {
        let initial_sequence_number = RandomSource::new().next_u16()?;
        Self::with_initial_sequence_number(transport, config, initial_sequence_number)
    }

    pub fn with_initial_sequence_number(
        transport: &SenderTransport,
        config: &SessionConfig,
        initial_sequence_number: u16,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let payload_type: RtpPayloadType = config.payload_type()?;
        let ssrc = config.sender_ssrc;
        let session = RtcpSession::new(ssrc, config.receiver_ssrc, transport.now());

        let state = Rc::new(RefCell::new(SenderState {
            transport: transport.clone(),
            ssrc,
            rtcp_parser: CompoundRtcpParser::new(session.clone()),
            sender_report_builder: SenderReportBuilder::new(session),
            packetizer: RtpPacketizer::new(payload_type, ssrc, initial_sequence_number),
            rtp_timebase: config.rtp_timebase,
            crypto: FrameCrypto::new(config.aes_key, config.aes_iv_mask),
            frame_cancel_observer: None,
            pending_frames: (0..MAX_UNACKED_FRAMES)
                .map(|_| PendingFrameSlot::default())
                .collect(),
            last_enqueued_frame_id: FrameId::first() - 1,
            checkpoint_frame_id: FrameId::first() - 1,
            latest_expected_frame_id: FrameId::first() - 1,
            picture_lost_at_frame_id: FrameId::first() - 1,
            last_enqueued_key_frame_id: FrameId::first() - 1,
            target_playout_delay: config.target_playout_delay(),
            playout_delay_change_frame_id: FrameId::first(),
            round_trip_time: Duration::ZERO,
            lip_sync: None,
            send_packet_count: 0,
            send_octet_count: 0,
            report_send_times: [None; SENDER_REPORT_HISTORY_SIZE],
            report_send_times_tail: 0,
            stats: SenderStats::default(),
        }));

        let client: Rc<RefCell<dyn SenderTransportClient>> = state.clone();
        transport.register_client(ssrc, config.receiver_ssrc, Rc::downgrade(&client));
        transport.request_rtcp_send(ssrc);
        debug!(ssrc, ?payload_type, "sender created");

        Ok(Sender {
            state,
            transport: transport.clone(),
            ssrc,
        })
    }

    pub fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    pub fn set_frame_cancel_observer(&self, observer: impl FrameCancelObserver + 'static) {
        self.state.borrow_mut().frame_cancel_observer = Some(Box::new(observer));
    }

    pub fn clear_frame_cancel_observer(&self) {
        self.state.borrow_mut().frame_cancel_observer = None;
    }

    /// Frames enqueued past the checkpoint, acknowledged or not
    pub fn in_flight_frame_count(&self) -> i64 {
        let state = self.state.borrow();
        state.last_enqueued_frame_id - state.checkpoint_frame_id
    }

    /// Media time from the oldest unacknowledged frame up to a frame with
    /// `next_rtp_timestamp`
    pub fn in_flight_media_duration(&self, next_rtp_timestamp: RtpTimeTicks) -> Duration {
        self.state.borrow().in_flight_media_duration(next_rtp_timestamp)
    }

    pub fn max_in_flight_media_duration(&self) -> Duration {
        self.state.borrow().max_in_flight_media_duration()
    }

    /// True until a key frame is enqueued after the receiver reported
    /// picture loss (and before the first key frame)
    pub fn needs_key_frame(&self) -> bool {
        let state = self.state.borrow();
        state.last_enqueued_key_frame_id <= state.picture_lost_at_frame_id
    }

    pub fn next_frame_id(&self) -> FrameId {
        self.state.borrow().last_enqueued_frame_id + 1
    }

    pub fn checkpoint_frame_id(&self) -> FrameId {
        self.state.borrow().checkpoint_frame_id
    }

    pub fn target_playout_delay(&self) -> Duration {
        self.state.borrow().target_playout_delay
    }

    pub fn current_round_trip_time(&self) -> Duration {
        self.state.borrow().round_trip_time
    }

    pub fn stats(&self) -> SenderStats {
        self.state.borrow().stats
    }

    /// Queue `frame` for sending
    ///
    /// `frame.frame_id` must be `next_frame_id()`.
    pub fn enqueue_frame(&self, frame: &EncodedFrame) -> Result<(), EnqueueError> {
        self.state.borrow_mut().enqueue_frame(frame)
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.transport.deregister_client(self.ssrc);
    }
}

impl SenderState {
    fn now(&self) -> Instant {
        self.transport.now()
    }

    fn kickstart_interval(&self) -> Duration {
        self.round_trip_time.max(MIN_KICKSTART_INTERVAL)
    }

    fn feedback_time_minus_rtt(&self) -> Instant {
        let now = self.now();
        now.checked_sub(self.round_trip_time).unwrap_or(now)
    }

    fn slot_for(&self, frame_id: FrameId) -> Option<&PendingFrameSlot> {
        if frame_id <= self.checkpoint_frame_id || frame_id > self.last_enqueued_frame_id {
            return None;
        }
        let slot = &self.pending_frames[to_slot_index(frame_id)];
        slot.is_active_for_frame(frame_id).then_some(slot)
    }

    fn oldest_active_frame(&self) -> Option<(FrameId, &PendingFrameSlot)> {
        let mut frame_id = self.checkpoint_frame_id + 1;
        while frame_id <= self.last_enqueued_frame_id {
            if let Some(slot) = self.slot_for(frame_id) {
                return Some((frame_id, slot));
            }
            frame_id += 1;
        }
        None
    }

    fn in_flight_media_duration(&self, next_rtp_timestamp: RtpTimeTicks) -> Duration {
        match self.oldest_active_frame() {
            Some((_, slot)) => match &slot.frame {
                Some(oldest) => (next_rtp_timestamp - oldest.rtp_timestamp).to_duration(self.rtp_timebase),
                None => Duration::ZERO,
            },
            None => Duration::ZERO,
        }
    }

    fn max_in_flight_media_duration(&self) -> Duration {
        // Everything that fits in the playout window, plus the time for an
        // ACK to come back.
        self.target_playout_delay + self.round_trip_time / 2
    }

    fn enqueue_frame(&mut self, frame: &EncodedFrame) -> Result<(), EnqueueError> {
        debug_assert_eq!(frame.frame_id, self.last_enqueued_frame_id + 1);

        let packet_count =
            RtpPacketizer::compute_number_of_packets(frame).ok_or(EnqueueError::PayloadTooLarge)?;

        let index = to_slot_index(frame.frame_id);
        if self.pending_frames[index].frame.is_some() {
            // Frame ids are consecutive, so every slot is occupied.
            return Err(EnqueueError::MaxFramesInFlight);
        }

        if self.in_flight_media_duration(frame.rtp_timestamp) > self.max_in_flight_media_duration() {
            return Err(EnqueueError::MaxDurationInFlight);
        }

        let now = self.now();
        let encrypted = self.crypto.encrypt(frame);
        let payload_size = encrypted.data.len();
        let slot = &mut self.pending_frames[index];
        slot.frame = Some(encrypted);
        slot.send_flags = vec![true; packet_count];
        slot.sent_times = vec![None; packet_count];

        self.last_enqueued_frame_id = frame.frame_id;
        if frame.dependency == Dependency::Key {
            self.last_enqueued_key_frame_id = frame.frame_id;
        }
        if let Some(delay) = frame.new_playout_delay.filter(|d| !d.is_zero()) {
            self.target_playout_delay = delay;
            self.playout_delay_change_frame_id = frame.frame_id;
        }
        let reference_time = frame.reference_time.unwrap_or(now);
        self.lip_sync = Some((reference_time, frame.rtp_timestamp));
        self.stats.frames_enqueued += 1;
        trace!(frame_id = %frame.frame_id, packet_count, payload_size, "enqueued frame");

        // Until a round trip has been measured the receiver may not have
        // seen a sender report yet; send one promptly.
        if self.round_trip_time.is_zero() {
            self.transport.request_rtcp_send(self.ssrc);
        }

        // The last packet must leave in time to cross the network and leave
        // the receiver some processing time before playout.
        let send_budget = self.target_playout_delay - self.target_playout_delay / 8;
        let travel_time = self.round_trip_time / 2;
        let departure_deadline = if send_budget >= travel_time {
            reference_time + (send_budget - travel_time)
        } else {
            reference_time
                .checked_sub(travel_time - send_budget)
                .unwrap_or(reference_time)
        };
        self.transport
            .record_flight_plan(payload_size, now, departure_deadline);

        self.transport.request_rtp_send(self.ssrc);
        Ok(())
    }

    fn choose_next_rtp_packet(&self, now: Instant) -> Option<PacketChoice> {
        let mut frame_id = self.checkpoint_frame_id + 1;
        while frame_id <= self.last_enqueued_frame_id {
            if let Some(slot) = self.slot_for(frame_id) {
                if let Some(packet_id) = slot.send_flags.iter().position(|f| *f) {
                    return Some(PacketChoice {
                        frame_id,
                        packet_id: packet_id as PacketId,
                        is_kickstart: false,
                    });
                }
            }
            frame_id += 1;
        }

        // Nothing flagged. The receiver may not know about the newest frames
        // if all their packets were lost; only a kickstart can tell it.
        let (frame_id, last_sent) = self.kickstart_candidate()?;
        match last_sent {
            Some(t) if now < t + self.kickstart_interval() => None,
            _ => Some(PacketChoice {
                frame_id,
                packet_id: 0,
                is_kickstart: true,
            }),
        }
    }

    /// Oldest unacknowledged frame, if the receiver is not yet known to be
    /// aware of every enqueued frame
    fn kickstart_candidate(&self) -> Option<(FrameId, Option<Instant>)> {
        if self.latest_expected_frame_id >= self.last_enqueued_frame_id {
            return None;
        }
        let (frame_id, slot) = self.oldest_active_frame()?;
        Some((frame_id, slot.last_sent_time()))
    }

    fn cancel_pending_frame(&mut self, frame_id: FrameId, feedback_time_minus_rtt: Instant) {
        let slot = &mut self.pending_frames[to_slot_index(frame_id)];
        if !slot.is_active_for_frame(frame_id) {
            return;
        }
        let payload_size = slot.frame.as_ref().map_or(0, |f| f.data.len());
        slot.frame = None;
        slot.send_flags.clear();
        slot.sent_times.clear();
        self.transport
            .record_feedback(payload_size, feedback_time_minus_rtt);
        self.stats.frames_canceled += 1;
        trace!(%frame_id, "frame canceled");
        if let Some(observer) = self.frame_cancel_observer.as_mut() {
            observer.on_frame_canceled(frame_id);
        }
    }

    fn note_receiver_aware_of(&mut self, frame_id: FrameId) {
        let frame_id = frame_id.min(self.last_enqueued_frame_id);
        if frame_id > self.latest_expected_frame_id {
            self.latest_expected_frame_id = frame_id;
        }
    }

    fn process_nacks(&mut self, nacks: impl Iterator<Item = PacketNack>) {
        // A NACK may have been issued while the packet was still in flight;
        // only resend packets that went out at least one round trip ago.
        let now = self.now();
        let too_recent = now.checked_sub(self.round_trip_time).unwrap_or(now);
        let eligible = |sent: &Option<Instant>| sent.map_or(true, |t| t < too_recent);

        let mut need_to_send = false;
        let mut invalid_frame: Option<FrameId> = None;
        let mut newest = None;
        for nack in nacks {
            newest = Some(nack.frame_id);
            if self.slot_for(nack.frame_id).is_none() {
                if invalid_frame != Some(nack.frame_id) {
                    warn!(frame_id = %nack.frame_id, "ignoring NACK for unknown frame");
                    invalid_frame = Some(nack.frame_id);
                }
                continue;
            }
            let slot = &mut self.pending_frames[to_slot_index(nack.frame_id)];
            if nack.packet_id == ALL_PACKETS_LOST {
                for (flag, sent) in slot.send_flags.iter_mut().zip(&slot.sent_times) {
                    if eligible(sent) {
                        *flag = true;
                        need_to_send = true;
                    }
                }
            } else if let Some(sent) = slot.sent_times.get(nack.packet_id as usize) {
                if eligible(sent) {
                    slot.send_flags[nack.packet_id as usize] = true;
                    need_to_send = true;
                }
            } else {
                warn!(
                    frame_id = %nack.frame_id,
                    packet_id = nack.packet_id,
                    "ignoring NACK for packet that does not exist"
                );
            }
        }

        if let Some(frame_id) = newest {
            self.note_receiver_aware_of(frame_id);
        }
        if need_to_send {
            self.transport.request_rtp_send(self.ssrc);
        }
    }
}

impl CompoundRtcpParserClient for SenderState {
    fn on_receiver_report(&mut self, report: &RtcpReportBlock) {
        let sent_at = self
            .report_send_times
            .iter()
            .flatten()
            .find(|(id, _)| *id == report.last_status_report_id)
            .map(|(_, when)| *when);
        let Some(sent_at) = sent_at else {
            trace!("receiver report refers to an unknown sender report");
            return;
        };

        // Time since the sender report went out, minus how long the receiver
        // held on to it.
        let measurement = self
            .now()
            .saturating_duration_since(sent_at)
            .saturating_sub(report.delay_since_last_report)
            .max(NEAR_ZERO_ROUND_TRIP_TIME);
        self.round_trip_time = if self.round_trip_time.is_zero() {
            measurement
        } else {
            (self.round_trip_time * RTT_INERTIA + measurement) / (RTT_INERTIA + 1)
        };
        self.stats.round_trip_time = self.round_trip_time;
        debug!(?measurement, rtt = ?self.round_trip_time, "round trip time updated");
    }

    fn on_receiver_indicates_picture_loss(&mut self) {
        // The receiver repeats the indication until it gets a key frame; one
        // already in flight will do.
        if self.checkpoint_frame_id < self.last_enqueued_key_frame_id {
            return;
        }
        self.picture_lost_at_frame_id = self.checkpoint_frame_id;
        debug!(at = %self.picture_lost_at_frame_id, "receiver reports picture loss");
    }

    fn on_receiver_checkpoint(&mut self, frame_id: FrameId, playout_delay: Duration) {
        let feedback_time = self.feedback_time_minus_rtt();
        self.transport.record_feedback(0, feedback_time);

        let target = if frame_id > self.last_enqueued_frame_id {
            warn!(%frame_id, last = %self.last_enqueued_frame_id, "checkpoint beyond last enqueued frame");
            self.last_enqueued_frame_id
        } else {
            frame_id
        };
        if target > self.checkpoint_frame_id {
            debug!(from = %self.checkpoint_frame_id, to = %target, "checkpoint advanced");
        }
        while self.checkpoint_frame_id < target {
            self.checkpoint_frame_id += 1;
            let id = self.checkpoint_frame_id;
            self.cancel_pending_frame(id, feedback_time);
        }
        self.note_receiver_aware_of(target);

        if playout_delay != self.target_playout_delay && frame_id >= self.playout_delay_change_frame_id {
            warn!(
                sender_ms = self.target_playout_delay.as_millis() as u64,
                receiver_ms = playout_delay.as_millis() as u64,
                "target playout delay disagrees with receiver"
            );
        }
    }

    fn on_receiver_has_frames(&mut self, acks: &[FrameId]) {
        let feedback_time = self.feedback_time_minus_rtt();
        self.transport.record_feedback(0, feedback_time);
        for &frame_id in acks {
            self.cancel_pending_frame(frame_id, feedback_time);
        }
        if let Some(&newest) = acks.last() {
            self.note_receiver_aware_of(newest);
        }
    }

    fn on_receiver_is_missing_frames(&mut self, frame_ids: &[FrameId]) {
        self.process_nacks(frame_ids.iter().map(|id| PacketNack::whole_frame(*id)));
    }

    fn on_receiver_is_missing_packets(&mut self, nacks: &[PacketNack]) {
        self.process_nacks(nacks.iter().copied());
    }
}

impl SenderTransportClient for SenderState {
    fn on_received_rtcp_packet(&mut self, _arrival_time: Instant, packet: &[u8]) {
        match self.rtcp_parser.parse(packet, self.last_enqueued_frame_id) {
            Ok(feedback) => feedback.dispatch(self),
            Err(e) => warn!("dropping corrupt RTCP packet: {}", e),
        }
    }

    fn get_rtcp_packet_for_immediate_send(&mut self, send_time: Instant, buffer: &mut [u8]) -> usize {
        // No lip-sync pairing before the first frame.
        let Some((reference_time, rtp_timestamp)) = self.lip_sync else {
            return 0;
        };

        // Move the pairing forward to the send time.
        let delta = if send_time >= reference_time {
            RtpTimeDelta::from_duration(send_time - reference_time, self.rtp_timebase)
        } else {
            let ahead = RtpTimeDelta::from_duration(reference_time - send_time, self.rtp_timebase);
            RtpTimeDelta::from_ticks(-ahead.ticks())
        };
        let report = RtcpSenderReport {
            reference_time: send_time,
            rtp_timestamp: rtp_timestamp + delta,
            send_packet_count: self.send_packet_count,
            send_octet_count: self.send_octet_count,
            report_block: None,
        };
        match self.sender_report_builder.build_packet(&report, buffer) {
            Some((len, report_id)) => {
                self.report_send_times[self.report_send_times_tail] = Some((report_id, send_time));
                self.report_send_times_tail = (self.report_send_times_tail + 1) % SENDER_REPORT_HISTORY_SIZE;
                trace!(report_id, "sender report");
                len
            }
            None => 0,
        }
    }

    fn get_rtp_packet_for_immediate_send(&mut self, send_time: Instant, buffer: &mut [u8]) -> usize {
        let Some(choice) = self.choose_next_rtp_packet(send_time) else {
            return 0;
        };
        let slot = &mut self.pending_frames[to_slot_index(choice.frame_id)];
        let Some(frame) = slot.frame.as_ref() else {
            return 0;
        };
        let len = self
            .packetizer
            .generate_packet(frame, choice.packet_id, buffer)
            .len();
        if len == 0 {
            warn!(frame_id = %choice.frame_id, "packet buffer too small");
            return 0;
        }

        let index = choice.packet_id as usize;
        if slot.sent_times[index].is_some() {
            self.stats.packets_retransmitted += 1;
        }
        slot.send_flags[index] = false;
        slot.sent_times[index] = Some(send_time);
        if choice.is_kickstart {
            self.stats.kickstarts += 1;
            debug!(frame_id = %choice.frame_id, "kickstart");
        }

        // The octet count includes headers; close enough for receivers.
        self.send_packet_count = self.send_packet_count.wrapping_add(1);
        self.send_octet_count = self.send_octet_count.wrapping_add(len as u32);
        self.stats.packets_sent += 1;
        self.stats.octets_sent += len as u64;
        len
    }

    fn get_rtp_resume_time(&mut self, now: Instant) -> Option<Instant> {
        let (_, last_sent) = self.kickstart_candidate()?;
        Some(last_sent.map_or(now, |t| t + self.kickstart_interval()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::FakeEnvironment;
    use bytes::Bytes;
    use cast_io::{Clock, ManualClock};
    use cast_protocol::rtp_defines::{MAX_PACKETS_PER_FRAME, MAX_PAYLOAD_PER_PACKET};
    use cast_protocol::{CompoundRtcpBuilder, SenderReportParser, RTCP_REQUIRED_BUFFER_SIZE};

    const SENDER_SSRC: Ssrc = 50_001;
    const RECEIVER_SSRC: Ssrc = 50_002;

    fn config() -> SessionConfig {
        SessionConfig {
            sender_ssrc: SENDER_SSRC,
            receiver_ssrc: RECEIVER_SSRC,
            rtp_payload_type: RtpPayloadType::VideoVp8.as_u8(),
            rtp_timebase: 90_000,
            aes_key: [3; 16],
            aes_iv_mask: [5; 16],
            target_playout_delay_ms: 400,
        }
    }

    struct Harness {
        clock: ManualClock,
        env: FakeEnvironment,
        transport: SenderTransport,
        sender: Sender,
        feedback: CompoundRtcpBuilder,
    }

    impl Harness {
        fn new() -> Self {
            let clock = ManualClock::new(Instant::now() + Duration::from_secs(10));
            let env = FakeEnvironment::new(clock.clone());
            let transport = SenderTransport::new(env.clone(), 24 << 20);
            let sender = Sender::with_initial_sequence_number(&transport, &config(), 1000).unwrap();
            let session = RtcpSession::new(SENDER_SSRC, RECEIVER_SSRC, clock.now());
            Harness {
                clock,
                env,
                transport,
                sender,
                feedback: CompoundRtcpBuilder::new(session),
            }
        }

        /// Run every burst due by now and collect what was sent
        fn run_bursts(&self) -> Vec<Bytes> {
            while let Some(when) = self.transport.next_burst_time() {
                if when > self.clock.now() {
                    break;
                }
                self.transport.handle_timeout(self.clock.now());
            }
            self.env.take_sent_packets()
        }

        fn enqueue(&self, dependency: Dependency, size: usize, rtp_ticks: i64) -> Result<(), EnqueueError> {
            let frame_id = self.sender.next_frame_id();
            let referenced = if dependency == Dependency::Key { frame_id } else { frame_id - 1 };
            let frame = EncodedFrame::new(
                dependency,
                frame_id,
                referenced,
                RtpTimeTicks::from_ticks(rtp_ticks),
                vec![0x5Au8; size],
            )
            .with_reference_time(self.clock.now());
            self.sender.enqueue_frame(&frame)
        }

        fn send_feedback(&mut self) {
            let mut buffer = [0u8; RTCP_REQUIRED_BUFFER_SIZE];
            let len = self.feedback.build_packet(self.clock.now(), &mut buffer);
            self.transport.on_received_packet(self.clock.now(), &buffer[..len]);
        }
    }

    fn rtp_packets(packets: &[Bytes]) -> Vec<(u8, u16)> {
        packets
            .iter()
            .filter(|p| p[1] & 0x7F == RtpPayloadType::VideoVp8.as_u8())
            .map(|p| (p[13], u16::from_be_bytes([p[14], p[15]])))
            .collect()
    }

    #[test]
    fn test_enqueue_sends_report_then_packets() {
        let h = Harness::new();
        assert!(h.sender.needs_key_frame());
        h.enqueue(Dependency::Key, 3000, 0).unwrap();
        assert!(!h.sender.needs_key_frame());

        let sent = h.run_bursts();
        assert_eq!(sent[0][1], 200);
        assert_eq!(rtp_packets(&sent), vec![(0, 0), (0, 1), (0, 2)]);
        assert_eq!(h.sender.stats().packets_sent, 3);
        assert_eq!(h.sender.in_flight_frame_count(), 1);
    }

    #[test]
    fn test_max_frames_in_flight() {
        let h = Harness::new();
        h.enqueue(Dependency::Key, 10, 0).unwrap();
        for _ in 1..MAX_UNACKED_FRAMES {
            h.enqueue(Dependency::Dependent, 10, 0).unwrap();
        }
        assert_eq!(h.enqueue(Dependency::Dependent, 10, 0), Err(EnqueueError::MaxFramesInFlight));
        assert_eq!(h.sender.in_flight_frame_count(), MAX_UNACKED_FRAMES as i64);
    }

    #[test]
    fn test_payload_too_large() {
        let h = Harness::new();
        let size = MAX_PAYLOAD_PER_PACKET * MAX_PACKETS_PER_FRAME + 1;
        let frame = EncodedFrame::new(
            Dependency::Key,
            FrameId::first(),
            FrameId::first(),
            RtpTimeTicks::default(),
            vec![0u8; size],
        );
        assert_eq!(h.sender.enqueue_frame(&frame), Err(EnqueueError::PayloadTooLarge));
        assert_eq!(h.sender.next_frame_id(), FrameId::first());
    }

    #[test]
    fn test_max_duration_in_flight() {
        let h = Harness::new();
        h.enqueue(Dependency::Key, 10, 0).unwrap();
        // 500 ms of 90 kHz media exceeds the 400 ms playout delay.
        assert_eq!(
            h.enqueue(Dependency::Dependent, 10, 45_000),
            Err(EnqueueError::MaxDurationInFlight)
        );
        h.enqueue(Dependency::Dependent, 10, 18_000).unwrap();
        assert_eq!(
            h.sender.in_flight_media_duration(RtpTimeTicks::from_ticks(36_000)),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn test_checkpoint_cancels_frames() {
        let mut h = Harness::new();
        let canceled = Rc::new(RefCell::new(Vec::new()));
        let sink = canceled.clone();
        h.sender
            .set_frame_cancel_observer(move |id: FrameId| sink.borrow_mut().push(id));

        h.enqueue(Dependency::Key, 10, 0).unwrap();
        h.enqueue(Dependency::Dependent, 10, 10).unwrap();
        h.enqueue(Dependency::Dependent, 10, 20).unwrap();
        h.enqueue(Dependency::Dependent, 10, 30).unwrap();
        h.run_bursts();

        h.feedback.set_checkpoint_frame(FrameId::new(1));
        h.feedback
            .include_feedback_in_next_packet(&[], &[], &[FrameId::new(3)]);
        h.send_feedback();

        assert_eq!(*canceled.borrow(), vec![FrameId::new(0), FrameId::new(1), FrameId::new(3)]);
        assert_eq!(h.sender.checkpoint_frame_id(), FrameId::new(1));
        assert_eq!(h.sender.in_flight_frame_count(), 2);
        assert_eq!(h.sender.stats().frames_canceled, 3);
    }

    #[test]
    fn test_nack_triggers_retransmit() {
        let mut h = Harness::new();
        h.enqueue(Dependency::Key, 3000, 0).unwrap();
        h.run_bursts();

        h.clock.advance(Duration::from_millis(50));
        h.feedback.include_feedback_in_next_packet(
            &[],
            &[PacketNack::new(FrameId::new(0), 1)],
            &[],
        );
        h.send_feedback();
        let sent = h.run_bursts();
        assert_eq!(rtp_packets(&sent), vec![(0, 1)]);
        assert_eq!(h.sender.stats().packets_retransmitted, 1);
    }

    #[test]
    fn test_whole_frame_nack() {
        let mut h = Harness::new();
        h.enqueue(Dependency::Key, 10, 0).unwrap();
        h.enqueue(Dependency::Dependent, 3000, 10).unwrap();
        h.run_bursts();

        h.clock.advance(Duration::from_millis(50));
        h.feedback.set_checkpoint_frame(FrameId::new(0));
        h.feedback
            .include_feedback_in_next_packet(&[FrameId::new(1)], &[], &[]);
        h.send_feedback();
        let sent = h.run_bursts();
        assert_eq!(rtp_packets(&sent), vec![(1, 0), (1, 1), (1, 2)]);
    }

    #[test]
    fn test_picture_loss_requests_key_frame() {
        let mut h = Harness::new();
        h.enqueue(Dependency::Key, 10, 0).unwrap();
        h.run_bursts();

        // Key frame still in flight: ignored.
        h.feedback.set_picture_loss_indicator(true);
        h.send_feedback();
        assert!(!h.sender.needs_key_frame());

        h.feedback.set_checkpoint_frame(FrameId::new(0));
        h.send_feedback();
        assert!(h.sender.needs_key_frame());

        h.enqueue(Dependency::Key, 10, 10).unwrap();
        assert!(!h.sender.needs_key_frame());
    }

    #[test]
    fn test_round_trip_time_from_receiver_report() {
        let mut h = Harness::new();
        h.enqueue(Dependency::Key, 10, 0).unwrap();
        let sent = h.run_bursts();

        let rx_session = RtcpSession::new(SENDER_SSRC, RECEIVER_SSRC, h.clock.now());
        let parsed = SenderReportParser::new(rx_session)
            .parse(&sent[0])
            .unwrap()
            .unwrap();

        h.clock.advance(Duration::from_millis(50));
        let mut block = RtcpReportBlock::new(SENDER_SSRC);
        block.last_status_report_id = parsed.report_id;
        block.delay_since_last_report = Duration::from_millis(10);
        h.feedback.include_receiver_report_in_next_packet(block);
        h.send_feedback();

        let rtt = h.sender.current_round_trip_time();
        assert!(rtt >= Duration::from_micros(39_900) && rtt <= Duration::from_micros(40_100), "{:?}", rtt);
        assert_eq!(h.sender.max_in_flight_media_duration(), Duration::from_millis(400) + rtt / 2);
    }

    #[test]
    fn test_kickstart_after_silence() {
        let h = Harness::new();
        h.enqueue(Dependency::Key, 3000, 0).unwrap();
        h.run_bursts();

        h.clock.advance(Duration::from_millis(19));
        assert!(rtp_packets(&h.run_bursts()).is_empty());

        h.clock.advance(Duration::from_millis(1));
        assert_eq!(rtp_packets(&h.run_bursts()), vec![(0, 0)]);
        assert_eq!(h.sender.stats().kickstarts, 1);
    }

    #[test]
    fn test_no_kickstart_once_receiver_knows() {
        let mut h = Harness::new();
        h.enqueue(Dependency::Key, 3000, 0).unwrap();
        h.run_bursts();

        h.feedback
            .include_feedback_in_next_packet(&[], &[PacketNack::new(FrameId::new(0), 2)], &[]);
        h.send_feedback();
        h.clock.advance(Duration::from_millis(100));
        assert!(rtp_packets(&h.run_bursts()).is_empty());
    }

    #[test]
    fn test_drop_deregisters() {
        let h = Harness::new();
        assert_eq!(h.transport.client_count(), 1);
        let Harness { transport, sender, .. } = h;
        drop(sender);
        assert_eq!(transport.client_count(), 0);
    }
}
