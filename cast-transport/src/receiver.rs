//! Frame Receiver
//!
//! Receiving end of one stream. RTP packets are reassembled into frames by a
//! ring of `FrameCollector`s; the receiver's checkpoint advances over every
//! contiguous run of complete frames, and frames are decrypted when the
//! application takes them, in frame id order.
//!
//! Feedback goes out as compound RTCP every report interval, and sooner when
//! the checkpoint moves or a sender report arrives. Each packet carries the
//! checkpoint, ACKs for complete frames beyond it, NACKs for everything still
//! missing, a report block with reception statistics and, after
//! `request_key_frame`, a picture loss indication.

use cast_io::Alarm;
use cast_protocol::expand::expand_nearest;
use cast_protocol::packet_util::{inspect_packet_for_routing, ApparentPacketType};
use cast_protocol::{
    CompoundRtcpBuilder, EncodedFrame, FrameCollector, FrameCrypto, FrameId, PacketNack,
    RtcpReportBlock, RtcpSession, RtpPacketParser, RtpTimeDelta, RtpTimeTicks, SenderReportParser,
    Ssrc, StatusReportId, RTCP_REQUIRED_BUFFER_SIZE,
};
use cast_protocol::rtp_parser::ParsedRtpPacket;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::{ConfigError, SessionConfig};
use crate::environment::Environment;
use crate::sender::MAX_UNACKED_FRAMES;
use crate::sender_transport::RTCP_REPORT_INTERVAL;

const SEQUENCE_NUMBER_BITS: u32 = 16;

/// Reception counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub packets_received: u64,
    pub packets_rejected: u64,
    pub frames_completed: u64,
    pub frames_consumed: u64,
    pub extended_high_sequence_number: u32,
    pub cumulative_packets_lost: i64,
    /// Interarrival jitter in RTP ticks
    pub jitter: RtpTimeDelta,
}

/// Sequence-number and timing statistics behind the RTCP report block
#[derive(Debug, Default)]
struct ReceiveStatsTracker {
    base_sequence_number: Option<i64>,
    highest_sequence_number: i64,
    packets_received: i64,
    expected_prior: i64,
    received_prior: i64,
    last_transit: Option<i64>,
    /// Jitter estimate scaled by 16
    jitter_q4: i64,
}

impl ReceiveStatsTracker {
    fn on_valid_packet(&mut self, sequence_number: u16, rtp_timestamp: RtpTimeTicks, arrival_ticks: i64) {
        match self.base_sequence_number {
            None => {
                self.base_sequence_number = Some(sequence_number as i64);
                self.highest_sequence_number = sequence_number as i64;
            }
            Some(_) => {
                let expanded =
                    expand_nearest(self.highest_sequence_number, sequence_number as u64, SEQUENCE_NUMBER_BITS);
                self.highest_sequence_number = self.highest_sequence_number.max(expanded);
            }
        }
        self.packets_received += 1;

        let transit = arrival_ticks - rtp_timestamp.ticks();
        if let Some(last) = self.last_transit {
            let d = (transit - last).abs();
            self.jitter_q4 += d - ((self.jitter_q4 + 8) >> 4);
        }
        self.last_transit = Some(transit);
    }

    fn expected(&self) -> i64 {
        match self.base_sequence_number {
            Some(base) => self.highest_sequence_number - base + 1,
            None => 0,
        }
    }

    fn jitter(&self) -> RtpTimeDelta {
        RtpTimeDelta::from_ticks(self.jitter_q4 >> 4)
    }

    /// Fill in `block` and start a new reporting interval
    fn populate_report_block(&mut self, block: &mut RtcpReportBlock) {
        let expected = self.expected();
        block.set_cumulative_packets_lost(expected - self.packets_received);
        let expected_interval = expected - self.expected_prior;
        let received_interval = self.packets_received - self.received_prior;
        block.set_packet_fraction_lost(expected_interval - received_interval, expected_interval);
        block.extended_high_sequence_number = self.highest_sequence_number as u32;
        block.jitter = self.jitter();
        self.expected_prior = expected;
        self.received_prior = self.packets_received;
    }
}

#[derive(Debug, Clone, Copy)]
struct LastSenderReport {
    report_id: StatusReportId,
    arrival_time: Instant,
    reference_time: Instant,
    rtp_timestamp: RtpTimeTicks,
}

/// One inbound stream
pub struct Receiver {
    environment: Box<dyn Environment>,
    sender_ssrc: Ssrc,
    rtp_timebase: u32,
    start_time: Instant,
    rtp_parser: RtpPacketParser,
    sender_report_parser: SenderReportParser,
    rtcp_builder: CompoundRtcpBuilder,
    rtcp_buffer: Vec<u8>,
    crypto: FrameCrypto,

    collectors: Vec<FrameCollector>,
    last_frame_consumed: FrameId,
    checkpoint_frame_id: FrameId,
    latest_frame_expected: FrameId,
    key_frame_requested: bool,

    last_sender_report: Option<LastSenderReport>,
    receive_stats: ReceiveStatsTracker,
    stats: ReceiverStats,
    rtcp_alarm: Alarm,
}

fn to_collector_index(frame_id: FrameId) -> usize {
    (frame_id - FrameId::first()).rem_euclid(MAX_UNACKED_FRAMES as i64) as usize
}

impl Receiver {
    pub fn new(environment: impl Environment + 'static, config: &SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let now = environment.now();
        let session = RtcpSession::new(config.sender_ssrc, config.receiver_ssrc, now);
        let mut rtcp_builder = CompoundRtcpBuilder::new(session.clone());
        rtcp_builder.set_playout_delay(config.target_playout_delay());
        debug!(sender_ssrc = config.sender_ssrc, receiver_ssrc = config.receiver_ssrc, "receiver created");

        Ok(Receiver {
            environment: Box::new(environment),
            sender_ssrc: config.sender_ssrc,
            rtp_timebase: config.rtp_timebase,
            start_time: now,
            rtp_parser: RtpPacketParser::new(config.sender_ssrc),
            sender_report_parser: SenderReportParser::new(session),
            rtcp_builder,
            rtcp_buffer: vec![0u8; RTCP_REQUIRED_BUFFER_SIZE],
            crypto: FrameCrypto::new(config.aes_key, config.aes_iv_mask),
            collectors: (0..MAX_UNACKED_FRAMES).map(|_| FrameCollector::new()).collect(),
            last_frame_consumed: FrameId::first() - 1,
            checkpoint_frame_id: FrameId::first() - 1,
            latest_frame_expected: FrameId::first() - 1,
            key_frame_requested: false,
            last_sender_report: None,
            receive_stats: ReceiveStatsTracker::default(),
            stats: ReceiverStats::default(),
            rtcp_alarm: Alarm::new(),
        })
    }

    pub fn checkpoint_frame_id(&self) -> FrameId {
        self.checkpoint_frame_id
    }

    pub fn last_frame_consumed(&self) -> FrameId {
        self.last_frame_consumed
    }

    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.environment.remote_endpoint()
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            extended_high_sequence_number: self.receive_stats.highest_sequence_number as u32,
            cumulative_packets_lost: self.receive_stats.expected() - self.receive_stats.packets_received,
            jitter: self.receive_stats.jitter(),
            ..self.stats
        }
    }

    /// Ask the sender for a key frame; repeated in every feedback packet
    /// until one arrives
    pub fn request_key_frame(&mut self) {
        if !self.key_frame_requested {
            debug!("requesting key frame");
        }
        self.key_frame_requested = true;
        self.rtcp_builder.set_picture_loss_indicator(true);
        let now = self.environment.now();
        self.rtcp_alarm.schedule_no_later_than(now);
    }

    /// When `handle_timeout` next needs to run, `None` before any packet has
    /// been received
    pub fn next_timeout(&self) -> Option<Instant> {
        self.rtcp_alarm.deadline()
    }

    /// Send feedback if it is due
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.rtcp_alarm.take_if_due(now) {
            self.send_rtcp(now);
            self.rtcp_alarm.schedule(now + RTCP_REPORT_INTERVAL);
        }
    }

    /// True if the next frame in order is ready to be taken
    pub fn has_frame_ready(&self) -> bool {
        let next = self.last_frame_consumed + 1;
        let collector = &self.collectors[to_collector_index(next)];
        collector.frame_id() == Some(next) && collector.has_all_parts()
    }

    /// Decrypt and return the next frame in order, once it is complete
    ///
    /// When the sender's lip-sync reports are known the frame's reference
    /// time is filled in from its RTP timestamp.
    pub fn take_frame(&mut self) -> Option<EncodedFrame> {
        if !self.has_frame_ready() {
            return None;
        }
        let next = self.last_frame_consumed + 1;
        let collector = &mut self.collectors[to_collector_index(next)];
        let mut frame = self.crypto.decrypt(collector.peek_at_assembled_frame()?);
        collector.reset();
        self.last_frame_consumed = next;
        self.stats.frames_consumed += 1;

        if let Some(sr) = self.last_sender_report {
            let delta = frame.rtp_timestamp - sr.rtp_timestamp;
            frame.reference_time = if delta.ticks() >= 0 {
                Some(sr.reference_time + delta.to_duration(self.rtp_timebase))
            } else {
                let behind = RtpTimeDelta::from_ticks(-delta.ticks()).to_duration(self.rtp_timebase);
                sr.reference_time.checked_sub(behind)
            };
        }
        trace!(frame_id = %next, size = frame.data.len(), "frame consumed");
        Some(frame)
    }

    /// Offer one inbound datagram
    ///
    /// Returns false if the datagram was not for this stream. The first
    /// accepted datagram fixes the remote endpoint; afterwards datagrams from
    /// other sources are rejected.
    pub fn on_received_packet(&mut self, source: SocketAddr, arrival_time: Instant, packet: &[u8]) -> bool {
        if let Some(remote) = self.environment.remote_endpoint() {
            if remote != source {
                trace!(%source, "ignoring packet from unexpected endpoint");
                return false;
            }
        }

        let (kind, ssrc) = inspect_packet_for_routing(packet);
        if ssrc != self.sender_ssrc {
            return false;
        }
        let accepted = match kind {
            ApparentPacketType::Rtp => self.on_rtp_packet(arrival_time, packet),
            ApparentPacketType::Rtcp => self.on_rtcp_packet(arrival_time, packet),
            ApparentPacketType::Unknown => false,
        };
        if !accepted {
            self.stats.packets_rejected += 1;
            return false;
        }

        if self.environment.remote_endpoint().is_none() {
            debug!(%source, "remote endpoint locked in");
            self.environment.set_remote_endpoint(source);
        }
        self.rtcp_alarm
            .schedule_no_later_than(arrival_time + RTCP_REPORT_INTERVAL);
        true
    }

    fn on_rtp_packet(&mut self, arrival_time: Instant, packet: &[u8]) -> bool {
        let part = match self.rtp_parser.parse(packet) {
            Ok(Some(part)) => part,
            Ok(None) => return false,
            Err(e) => {
                warn!("dropping malformed RTP packet: {}", e);
                return false;
            }
        };

        let arrival_ticks = RtpTimeDelta::from_duration(
            arrival_time.saturating_duration_since(self.start_time),
            self.rtp_timebase,
        )
        .ticks();
        self.receive_stats.on_valid_packet(
            part.header.sequence_number,
            part.header.rtp_timestamp,
            arrival_ticks,
        );
        self.stats.packets_received += 1;

        self.collect(arrival_time, &part);
        true
    }

    fn collect(&mut self, arrival_time: Instant, part: &ParsedRtpPacket<'_>) {
        let frame_id = part.header.frame_id;
        if frame_id <= self.last_frame_consumed {
            trace!(%frame_id, "packet for a frame already consumed");
            return;
        }
        if frame_id > self.last_frame_consumed + MAX_UNACKED_FRAMES as i64 {
            warn!(%frame_id, consumed = %self.last_frame_consumed, "packet too far ahead, dropped");
            return;
        }

        let collector = &mut self.collectors[to_collector_index(frame_id)];
        if collector.frame_id() != Some(frame_id) {
            collector.reset();
            collector.set_frame_id(frame_id);
        }
        let was_complete = collector.has_all_parts();
        if !collector.collect_part(part) {
            return;
        }
        if frame_id > self.latest_frame_expected {
            self.latest_frame_expected = frame_id;
        }
        if part.header.packet_id == 0 {
            if let Some(delay) = part.header.new_playout_delay {
                self.rtcp_builder.set_playout_delay(delay);
            }
        }
        if was_complete || !collector.has_all_parts() {
            return;
        }

        self.stats.frames_completed += 1;
        trace!(%frame_id, "frame complete");
        if part.header.is_key_frame && self.key_frame_requested {
            debug!(%frame_id, "key frame received");
            self.key_frame_requested = false;
            self.rtcp_builder.set_picture_loss_indicator(false);
        }

        let before = self.checkpoint_frame_id;
        self.advance_checkpoint();
        if self.checkpoint_frame_id != before {
            trace!(from = %before, to = %self.checkpoint_frame_id, "checkpoint advanced");
        }
        // Either the checkpoint moved or there is a new ACK to report.
        self.rtcp_alarm.schedule_no_later_than(arrival_time);
    }

    fn advance_checkpoint(&mut self) {
        loop {
            let next = self.checkpoint_frame_id + 1;
            let collector = &self.collectors[to_collector_index(next)];
            // Frames already taken count as complete.
            let complete = next <= self.last_frame_consumed
                || (collector.frame_id() == Some(next) && collector.has_all_parts());
            if !complete {
                break;
            }
            self.checkpoint_frame_id = next;
        }
    }

    fn on_rtcp_packet(&mut self, arrival_time: Instant, packet: &[u8]) -> bool {
        match self.sender_report_parser.parse(packet) {
            Ok(Some(parsed)) => {
                trace!(report_id = parsed.report_id, "sender report");
                self.last_sender_report = Some(LastSenderReport {
                    report_id: parsed.report_id,
                    arrival_time,
                    reference_time: parsed.report.reference_time,
                    rtp_timestamp: parsed.report.rtp_timestamp,
                });
                self.rtcp_alarm.schedule_no_later_than(arrival_time);
                true
            }
            Ok(None) => true,
            Err(e) => {
                warn!("dropping corrupt RTCP packet: {}", e);
                false
            }
        }
    }

    fn send_rtcp(&mut self, now: Instant) {
        self.rtcp_builder.set_checkpoint_frame(self.checkpoint_frame_id);

        if self.receive_stats.base_sequence_number.is_some() || self.last_sender_report.is_some() {
            let mut block = RtcpReportBlock::new(self.sender_ssrc);
            self.receive_stats.populate_report_block(&mut block);
            if let Some(sr) = self.last_sender_report {
                block.last_status_report_id = sr.report_id;
                block.delay_since_last_report = now.saturating_duration_since(sr.arrival_time);
            }
            self.rtcp_builder.include_receiver_report_in_next_packet(block);
        }

        let mut frame_nacks = Vec::new();
        let mut packet_nacks: Vec<PacketNack> = Vec::new();
        let mut acks = Vec::new();
        let mut frame_id = self.checkpoint_frame_id + 1;
        while frame_id <= self.latest_frame_expected {
            let collector = &self.collectors[to_collector_index(frame_id)];
            if collector.frame_id() != Some(frame_id) {
                frame_nacks.push(frame_id);
            } else if collector.has_all_parts() {
                acks.push(frame_id);
            } else {
                collector.append_missing_packets(&mut packet_nacks);
            }
            frame_id += 1;
        }
        self.rtcp_builder
            .include_feedback_in_next_packet(&frame_nacks, &packet_nacks, &acks);

        let len = self.rtcp_builder.build_packet(now, &mut self.rtcp_buffer);
        self.environment.send_packet(&self.rtcp_buffer[..len]);
        trace!(
            checkpoint = %self.checkpoint_frame_id,
            frame_nacks = frame_nacks.len(),
            packet_nacks = packet_nacks.len(),
            acks = acks.len(),
            "sent feedback"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::FakeEnvironment;
    use bytes::Bytes;
    use cast_io::{Clock, ManualClock};
    use cast_protocol::{
        CompoundRtcpParser, Dependency, EncryptedFrame, RtcpFeedback, RtcpSenderReport,
        RtpPacketizer, RtpPayloadType, SenderReportBuilder,
    };
    use std::time::Duration;

    const SENDER_SSRC: Ssrc = 50_001;
    const RECEIVER_SSRC: Ssrc = 50_002;

    fn config() -> SessionConfig {
        SessionConfig {
            sender_ssrc: SENDER_SSRC,
            receiver_ssrc: RECEIVER_SSRC,
            rtp_payload_type: RtpPayloadType::VideoVp8.as_u8(),
            rtp_timebase: 90_000,
            aes_key: [9; 16],
            aes_iv_mask: [4; 16],
            target_playout_delay_ms: 400,
        }
    }

    fn source() -> SocketAddr {
        "10.0.0.1:5000".parse().unwrap()
    }

    /// Sender-side half: encrypts and packetizes, and reads feedback
    struct Peer {
        clock: ManualClock,
        env: FakeEnvironment,
        receiver: Receiver,
        crypto: FrameCrypto,
        packetizer: RtpPacketizer,
        feedback_parser: CompoundRtcpParser,
    }

    impl Peer {
        fn new() -> Self {
            let clock = ManualClock::new(Instant::now() + Duration::from_secs(10));
            let env = FakeEnvironment::new(clock.clone());
            let receiver = Receiver::new(env.clone(), &config()).unwrap();
            let session = RtcpSession::new(SENDER_SSRC, RECEIVER_SSRC, clock.now());
            Peer {
                clock,
                env,
                receiver,
                crypto: FrameCrypto::new([9; 16], [4; 16]),
                packetizer: RtpPacketizer::new(RtpPayloadType::VideoVp8, SENDER_SSRC, 7),
                feedback_parser: CompoundRtcpParser::new(session),
            }
        }

        fn frame(&self, id: i64, size: usize) -> (EncodedFrame, EncryptedFrame) {
            let dependency = if id == 0 { Dependency::Key } else { Dependency::Dependent };
            let frame_id = FrameId::new(id);
            let referenced = if id == 0 { frame_id } else { frame_id - 1 };
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let frame = EncodedFrame::new(
                dependency,
                frame_id,
                referenced,
                RtpTimeTicks::from_ticks(id * 3000),
                payload,
            );
            let encrypted = self.crypto.encrypt(&frame);
            (frame, encrypted)
        }

        fn packet(&mut self, frame: &EncryptedFrame, packet_id: u16) -> Bytes {
            let mut buffer = vec![0u8; 1500];
            Bytes::copy_from_slice(self.packetizer.generate_packet(frame, packet_id, &mut buffer))
        }

        fn deliver(&mut self, packet: &[u8]) -> bool {
            let now = self.clock.now();
            self.receiver.on_received_packet(source(), now, packet)
        }

        fn deliver_frame(&mut self, frame: &EncryptedFrame, packet_ids: &[u16]) {
            for &packet_id in packet_ids {
                let packet = self.packet(frame, packet_id);
                assert!(self.deliver(&packet));
            }
        }

        /// Run the feedback alarm and parse what it sent
        fn feedback(&mut self, max_frame_id: i64) -> Option<RtcpFeedback> {
            let deadline = self.receiver.next_timeout()?;
            if deadline > self.clock.now() {
                self.clock.set(deadline);
            }
            self.receiver.handle_timeout(self.clock.now());
            let sent = self.env.take_sent_packets();
            let packet = sent.last()?;
            Some(
                self.feedback_parser
                    .parse(packet, FrameId::new(max_frame_id))
                    .unwrap(),
            )
        }
    }

    #[test]
    fn test_frame_reassembled_out_of_order() {
        let mut peer = Peer::new();
        let (original, encrypted) = peer.frame(0, 3000);
        peer.deliver_frame(&encrypted, &[2, 0, 1, 0]);

        assert_eq!(peer.receiver.checkpoint_frame_id(), FrameId::new(0));
        assert!(peer.receiver.has_frame_ready());
        let frame = peer.receiver.take_frame().unwrap();
        assert_eq!(frame.data, original.data);
        assert_eq!(frame.dependency, Dependency::Key);
        assert_eq!(frame.reference_time, None);
        assert!(peer.receiver.take_frame().is_none());
        assert_eq!(peer.receiver.stats().frames_consumed, 1);
        assert_eq!(peer.receiver.remote_endpoint(), Some(source()));
    }

    #[test]
    fn test_nack_for_missing_packet() {
        let mut peer = Peer::new();
        let (_, encrypted) = peer.frame(0, 3000);
        peer.deliver_frame(&encrypted, &[0, 2]);

        let feedback = peer.feedback(0).unwrap();
        assert_eq!(feedback.checkpoint.map(|(id, _)| id), Some(FrameId::first() - 1));
        assert_eq!(feedback.missing_packets, vec![PacketNack::new(FrameId::new(0), 1)]);
        assert!(feedback.received_frames.is_empty());
    }

    #[test]
    fn test_acks_and_whole_frame_nacks() {
        let mut peer = Peer::new();
        let (_, frame0) = peer.frame(0, 100);
        let (_, frame1) = peer.frame(1, 100);
        let (_, frame2) = peer.frame(2, 100);
        // Frame 0's only packet is lost on the way.
        let _ = peer.packet(&frame0, 0);
        peer.deliver_frame(&frame1, &[0]);
        peer.deliver_frame(&frame2, &[0]);

        let feedback = peer.feedback(2).unwrap();
        assert_eq!(feedback.missing_frames, vec![FrameId::new(0)]);
        assert_eq!(feedback.received_frames, vec![FrameId::new(1), FrameId::new(2)]);

        // The retransmission completes everything.
        peer.deliver_frame(&frame0, &[0]);
        assert_eq!(peer.receiver.checkpoint_frame_id(), FrameId::new(2));
        let feedback = peer.feedback(2).unwrap();
        assert_eq!(feedback.checkpoint.map(|(id, _)| id), Some(FrameId::new(2)));
        assert!(feedback.missing_frames.is_empty());
        assert!(feedback.received_frames.is_empty());
    }

    #[test]
    fn test_rejects_foreign_traffic() {
        let mut peer = Peer::new();
        let mut other = RtpPacketizer::new(RtpPayloadType::VideoVp8, 777, 0);
        let (_, encrypted) = peer.frame(0, 10);
        let mut buffer = vec![0u8; 1500];
        let foreign = other.generate_packet(&encrypted, 0, &mut buffer).to_vec();
        assert!(!peer.deliver(&foreign));
        assert_eq!(peer.receiver.remote_endpoint(), None);

        let packet = peer.packet(&encrypted, 0);
        let elsewhere: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        assert!(peer.deliver(&packet));
        let now = peer.clock.now();
        assert!(!peer.receiver.on_received_packet(elsewhere, now, &packet));
    }

    #[test]
    fn test_sender_report_answered() {
        let mut peer = Peer::new();
        let (_, encrypted) = peer.frame(0, 10);
        peer.deliver_frame(&encrypted, &[0]);

        let session = RtcpSession::new(SENDER_SSRC, RECEIVER_SSRC, peer.clock.now());
        let report = RtcpSenderReport {
            reference_time: peer.clock.now(),
            rtp_timestamp: RtpTimeTicks::from_ticks(900),
            send_packet_count: 1,
            send_octet_count: 10,
            report_block: None,
        };
        let mut buffer = [0u8; 64];
        let (len, report_id) = SenderReportBuilder::new(session)
            .build_packet(&report, &mut buffer)
            .unwrap();
        assert!(peer.deliver(&buffer[..len]));

        peer.clock.advance(Duration::from_millis(5));
        let feedback = peer.feedback(0).unwrap();
        let block = feedback.receiver_report.unwrap();
        assert_eq!(block.last_status_report_id, report_id);
        assert!(block.delay_since_last_report >= Duration::from_millis(4));
        assert!(block.delay_since_last_report <= Duration::from_millis(6));
        assert_eq!(block.extended_high_sequence_number, 7);

        let (_, frame1) = peer.frame(1, 10);
        peer.receiver.take_frame().unwrap();
        peer.deliver_frame(&frame1, &[0]);
        let taken = peer.receiver.take_frame().unwrap();
        // 2100 ticks at 90 kHz after the report; the NTP round trip costs
        // some precision.
        let expected = report.reference_time + Duration::from_nanos(23_333_333);
        let actual = taken.reference_time.unwrap();
        let error = if actual > expected { actual - expected } else { expected - actual };
        assert!(error < Duration::from_millis(1), "{:?}", error);
    }

    #[test]
    fn test_key_frame_request() {
        let mut peer = Peer::new();
        peer.receiver.request_key_frame();
        let feedback = peer.feedback(0).unwrap();
        assert!(feedback.picture_loss);

        let (_, key) = peer.frame(0, 10);
        peer.deliver_frame(&key, &[0]);
        let feedback = peer.feedback(0).unwrap();
        assert!(!feedback.picture_loss);
    }

    #[test]
    fn test_loss_statistics() {
        let mut peer = Peer::new();
        let (_, encrypted) = peer.frame(0, 5000);
        peer.deliver_frame(&encrypted, &[0]);
        let _ = peer.packet(&encrypted, 1);
        let _ = peer.packet(&encrypted, 2);
        peer.deliver_frame(&encrypted, &[3]);

        let stats = peer.receiver.stats();
        assert_eq!(stats.packets_received, 2);
        assert_eq!(stats.cumulative_packets_lost, 2);
        assert_eq!(stats.extended_high_sequence_number, 10);

        let block = peer.feedback(0).unwrap().receiver_report.unwrap();
        assert_eq!(block.cumulative_packets_lost, 2);
        assert_eq!(block.packet_fraction_lost, 128);
    }
}
