//! End-to-end streaming over a simulated lossy network
//!
//! Senders and receivers run on a shared manual clock. Datagrams travel
//! through in-memory links with a fixed delay and deterministic loss, so
//! every run takes exactly the same path.

use bytes::Bytes;
use cast_io::{Clock, ManualClock};
use cast::protocol::{inspect_packet_for_routing, ApparentPacketType};
use cast::transport::{EnqueueError, FakeEnvironment};
use cast::{
    Dependency, EncodedFrame, FrameId, Receiver, RtpPayloadType, RtpTimeTicks, Sender,
    SenderTransport, SessionConfig,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const STEP: Duration = Duration::from_millis(1);
const ONE_WAY_DELAY: Duration = Duration::from_millis(10);
const FRAME_INTERVAL_MS: u64 = 33;

fn sender_address() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], 5000))
}

fn session(sender_ssrc: u32, receiver_ssrc: u32, payload_type: RtpPayloadType, timebase: u32) -> SessionConfig {
    SessionConfig {
        sender_ssrc,
        receiver_ssrc,
        rtp_payload_type: payload_type.as_u8(),
        rtp_timebase: timebase,
        aes_key: [0x3C; 16],
        aes_iv_mask: [0xC3; 16],
        target_playout_delay_ms: 400,
    }
}

/// One direction of the simulated network
struct Link {
    in_flight: VecDeque<(Instant, Bytes)>,
    rtp_seen: u64,
    rtcp_seen: u64,
    drop_rtp_every: Option<u64>,
    drop_rtcp_every: Option<u64>,
    dropped: u64,
}

impl Link {
    fn new(drop_rtp_every: Option<u64>, drop_rtcp_every: Option<u64>) -> Self {
        Link {
            in_flight: VecDeque::new(),
            rtp_seen: 0,
            rtcp_seen: 0,
            drop_rtp_every,
            drop_rtcp_every,
            dropped: 0,
        }
    }

    fn lossless() -> Self {
        Self::new(None, None)
    }

    fn push(&mut self, now: Instant, packets: Vec<Bytes>) {
        for packet in packets {
            let (kind, _) = inspect_packet_for_routing(&packet);
            let lost = match kind {
                ApparentPacketType::Rtp => {
                    self.rtp_seen += 1;
                    self.drop_rtp_every.map_or(false, |n| self.rtp_seen % n == 3)
                }
                ApparentPacketType::Rtcp => {
                    self.rtcp_seen += 1;
                    self.drop_rtcp_every.map_or(false, |n| self.rtcp_seen % n == 2)
                }
                ApparentPacketType::Unknown => false,
            };
            if lost {
                self.dropped += 1;
            } else {
                self.in_flight.push_back((now + ONE_WAY_DELAY, packet));
            }
        }
    }

    fn pop_due(&mut self, now: Instant) -> Vec<Bytes> {
        let mut due = Vec::new();
        while self.in_flight.front().map_or(false, |(at, _)| *at <= now) {
            if let Some((_, packet)) = self.in_flight.pop_front() {
                due.push(packet);
            }
        }
        due
    }
}

fn payload_for(frame_index: u64) -> Vec<u8> {
    // Sizes from under one packet to a few packets.
    let size = 300 + (frame_index as usize * 977) % 4500;
    (0..size).map(|i| (i as u64 ^ frame_index) as u8).collect()
}

/// A stream source that produces one frame per interval and retries frames
/// the sender defers
struct Source {
    sender: Sender,
    timebase: u32,
    interval: Duration,
    total_frames: u64,
    produced: u64,
    pending: Option<EncodedFrame>,
    next_frame_time: Instant,
}

impl Source {
    fn new(sender: Sender, timebase: u32, interval: Duration, total_frames: u64, start: Instant) -> Self {
        Source {
            sender,
            timebase,
            interval,
            total_frames,
            produced: 0,
            pending: None,
            next_frame_time: start,
        }
    }

    fn is_done(&self) -> bool {
        self.produced == self.total_frames && self.pending.is_none()
    }

    fn tick(&mut self, now: Instant, start: Instant) {
        if now < self.next_frame_time || self.is_done() {
            return;
        }
        let frame = match self.pending.take() {
            Some(frame) => frame,
            None => {
                let index = self.produced;
                self.produced += 1;
                let frame_id = self.sender.next_frame_id();
                let (dependency, referenced) = if index == 0 || self.sender.needs_key_frame() {
                    (Dependency::Key, frame_id)
                } else {
                    (Dependency::Dependent, frame_id - 1)
                };
                let ticks = (now - start).as_nanos() as i64 * self.timebase as i64 / 1_000_000_000;
                EncodedFrame::new(
                    dependency,
                    frame_id,
                    referenced,
                    RtpTimeTicks::from_ticks(ticks),
                    payload_for(index),
                )
                .with_reference_time(now)
            }
        };
        match self.sender.enqueue_frame(&frame) {
            Ok(()) => {}
            Err(EnqueueError::PayloadTooLarge) => panic!("test frames always fit"),
            Err(_) => self.pending = Some(frame),
        }
        self.next_frame_time += self.interval;
    }
}

struct Sink {
    receiver: Receiver,
    env: FakeEnvironment,
    frames: Vec<EncodedFrame>,
}

impl Sink {
    fn new(clock: &ManualClock, config: &SessionConfig) -> Self {
        let env = FakeEnvironment::new(clock.clone());
        let receiver = Receiver::new(env.clone(), config).unwrap();
        Sink {
            receiver,
            env,
            frames: Vec::new(),
        }
    }

    fn deliver(&mut self, now: Instant, packets: &[Bytes]) {
        for packet in packets {
            self.receiver.on_received_packet(sender_address(), now, packet);
        }
    }

    fn service(&mut self, now: Instant) {
        if self.receiver.next_timeout().map_or(false, |t| t <= now) {
            self.receiver.handle_timeout(now);
        }
        while let Some(frame) = self.receiver.take_frame() {
            self.frames.push(frame);
        }
    }
}

/// Everything on the sending host plus the two directions of the network
struct Network {
    clock: ManualClock,
    start: Instant,
    sender_env: FakeEnvironment,
    transport: SenderTransport,
    forward: Link,
    backward: Link,
}

impl Network {
    fn new(max_bitrate: i64, forward: Link, backward: Link) -> Self {
        let start = Instant::now() + Duration::from_secs(10);
        let clock = ManualClock::new(start);
        let sender_env = FakeEnvironment::new(clock.clone());
        let transport = SenderTransport::new(sender_env.clone(), max_bitrate);
        Network {
            clock,
            start,
            sender_env,
            transport,
            forward,
            backward,
        }
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }

    fn elapsed(&self) -> Duration {
        self.now() - self.start
    }

    /// Run one step: pace the sender, move packets, let every receiver
    /// respond, then advance the clock
    fn step(&mut self, sinks: &mut [&mut Sink]) {
        let now = self.now();
        if self.transport.next_burst_time().map_or(false, |t| t <= now) {
            self.transport.handle_timeout(now);
        }
        self.forward.push(now, self.sender_env.take_sent_packets());

        let arriving = self.forward.pop_due(now);
        for sink in sinks.iter_mut() {
            sink.deliver(now, &arriving);
            sink.service(now);
            self.backward.push(now, sink.env.take_sent_packets());
        }

        for packet in self.backward.pop_due(now) {
            self.transport.on_received_packet(now, &packet);
        }
        self.clock.advance(STEP);
    }
}

fn assert_stream_intact(frames: &[EncodedFrame], count: u64) {
    assert_eq!(frames.len() as u64, count);
    for (index, frame) in frames.iter().enumerate() {
        assert_eq!(frame.frame_id, FrameId::new(index as i64));
        assert_eq!(frame.data.as_ref(), payload_for(index as u64).as_slice());
    }
}

#[test]
fn test_lossy_stream_delivered_in_order() {
    const FRAMES: u64 = 60;
    let config = session(50_001, 50_002, RtpPayloadType::VideoVp8, 90_000);
    let mut net = Network::new(24 << 20, Link::new(Some(7), None), Link::new(None, Some(5)));
    let sender = Sender::with_initial_sequence_number(&net.transport, &config, 0xFFF0).unwrap();
    let mut source = Source::new(
        sender,
        config.rtp_timebase,
        Duration::from_millis(FRAME_INTERVAL_MS),
        FRAMES,
        net.now(),
    );
    let mut sink = Sink::new(&net.clock, &config);

    let deadline = Duration::from_secs(15);
    while net.elapsed() < deadline {
        let now = net.now();
        source.tick(now, net.start);
        net.step(&mut [&mut sink]);
        if source.is_done() && source.sender.in_flight_frame_count() == 0 && sink.frames.len() as u64 == FRAMES {
            break;
        }
    }

    assert_stream_intact(&sink.frames, FRAMES);
    assert_eq!(source.sender.in_flight_frame_count(), 0);
    assert!(net.forward.dropped > 0);
    assert!(net.backward.dropped > 0);

    let stats = source.sender.stats();
    assert_eq!(stats.frames_enqueued, FRAMES);
    assert!(stats.packets_retransmitted > 0);
    assert!(stats.round_trip_time >= Duration::from_millis(15));
    assert!(stats.round_trip_time <= Duration::from_millis(60));

    let receiver_stats = sink.receiver.stats();
    assert_eq!(receiver_stats.frames_consumed, FRAMES);
    assert!(receiver_stats.packets_received > 0);
}

#[test]
fn test_audio_and_video_share_a_transport() {
    const VIDEO_FRAMES: u64 = 30;
    const AUDIO_FRAMES: u64 = 50;
    let video_config = session(60_001, 60_002, RtpPayloadType::VideoVp8, 90_000);
    let mut audio_config = session(1_001, 1_002, RtpPayloadType::AudioOpus, 48_000);
    audio_config.aes_key = [0x77; 16];

    let mut net = Network::new(24 << 20, Link::lossless(), Link::lossless());
    let video = Sender::new(&net.transport, &video_config).unwrap();
    let audio = Sender::new(&net.transport, &audio_config).unwrap();
    assert_eq!(net.transport.client_count(), 2);

    let mut video_source = Source::new(
        video,
        video_config.rtp_timebase,
        Duration::from_millis(FRAME_INTERVAL_MS),
        VIDEO_FRAMES,
        net.now(),
    );
    let mut audio_source = Source::new(
        audio,
        audio_config.rtp_timebase,
        Duration::from_millis(20),
        AUDIO_FRAMES,
        net.now(),
    );
    let mut video_sink = Sink::new(&net.clock, &video_config);
    let mut audio_sink = Sink::new(&net.clock, &audio_config);

    while net.elapsed() < Duration::from_secs(5) {
        let now = net.now();
        video_source.tick(now, net.start);
        audio_source.tick(now, net.start);
        net.step(&mut [&mut video_sink, &mut audio_sink]);
        if video_source.is_done()
            && audio_source.is_done()
            && video_source.sender.in_flight_frame_count() == 0
            && audio_source.sender.in_flight_frame_count() == 0
        {
            break;
        }
    }

    assert_stream_intact(&video_sink.frames, VIDEO_FRAMES);
    assert_stream_intact(&audio_sink.frames, AUDIO_FRAMES);
    assert_eq!(video_source.sender.stats().frames_canceled, VIDEO_FRAMES);
    assert_eq!(audio_source.sender.stats().frames_canceled, AUDIO_FRAMES);

    drop(audio_source);
    assert_eq!(net.transport.client_count(), 1);
}

#[test]
fn test_effective_bitrate_measured() {
    let config = session(70_001, 70_002, RtpPayloadType::VideoVp8, 90_000);
    let mut net = Network::new(24 << 20, Link::lossless(), Link::lossless());
    let sender = Sender::new(&net.transport, &config).unwrap();
    let mut source = Source::new(
        sender,
        config.rtp_timebase,
        Duration::from_millis(FRAME_INTERVAL_MS),
        150,
        net.now(),
    );
    let mut sink = Sink::new(&net.clock, &config);

    assert!(net.transport.compute_effective_bitrate().is_none());
    while net.elapsed() < Duration::from_secs(3) {
        let now = net.now();
        source.tick(now, net.start);
        net.step(&mut [&mut sink]);
    }

    let effective = net.transport.compute_effective_bitrate().unwrap();
    assert!(effective > 0);
    assert!(effective <= net.transport.max_bitrate());

    let now = net.now();
    let available = net
        .transport
        .predict_available_bitrate(now, now + Duration::from_millis(100));
    assert!(available.is_some());
    assert!(!sink.frames.is_empty());
}
