//! Sender Transport
//!
//! Paces outbound packets for every sender of a session. Work happens in
//! bursts, at most one per pacing interval. A burst first sends the RTCP
//! packets that are due, then fills the rest of a fixed packet budget with
//! RTP packets, visiting senders in priority order and taking one packet from
//! each per turn.
//!
//! The transport owns its burst alarm. A driver loop asks for
//! `next_burst_time()`, sleeps or polls until then, and calls
//! `handle_timeout(now)`; inbound datagrams are passed to
//! `on_received_packet`.

use cast_io::Alarm;
use cast_protocol::bandwidth_estimator::BandwidthEstimator;
use cast_protocol::packet_util::{inspect_packet_for_routing, ApparentPacketType};
use cast_protocol::ssrc::compare_priority;
use cast_protocol::Ssrc;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::environment::Environment;

/// Minimum time between bursts
pub const PACING_INTERVAL: Duration = Duration::from_millis(10);

/// Time between RTCP reports from one sender
pub const RTCP_REPORT_INTERVAL: Duration = Duration::from_millis(500);

const BITS_PER_BYTE: i64 = 8;

/// A packet source registered with the transport
///
/// The `get_*` methods are called during a burst and must not call back
/// into the transport. `on_received_rtcp_packet` may.
pub trait SenderTransportClient {
    fn on_received_rtcp_packet(&mut self, arrival_time: Instant, packet: &[u8]);

    /// Write an RTCP packet into `buffer` if one should go out now; returns
    /// its length, zero for none
    fn get_rtcp_packet_for_immediate_send(&mut self, send_time: Instant, buffer: &mut [u8]) -> usize;

    /// Write the next RTP packet into `buffer`; returns its length, zero when
    /// there is nothing to send right now
    fn get_rtp_packet_for_immediate_send(&mut self, send_time: Instant, buffer: &mut [u8]) -> usize;

    /// When RTP sending should resume after the client ran dry, `None` for
    /// "not until explicitly requested"
    fn get_rtp_resume_time(&mut self, now: Instant) -> Option<Instant>;
}

struct ClientEntry {
    ssrc: Ssrc,
    /// Inbound RTCP carries the receiver's SSRC
    receiver_ssrc: Ssrc,
    client: Weak<RefCell<dyn SenderTransportClient>>,
    /// `None` is never
    next_rtcp_send_time: Option<Instant>,
    next_rtp_send_time: Option<Instant>,
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn is_due(time: Option<Instant>, now: Instant) -> bool {
    time.map_or(false, |t| t <= now)
}

struct TransportState {
    environment: Box<dyn Environment>,
    packet_buffer: Vec<u8>,
    max_bitrate: i64,
    max_packets_per_burst: usize,
    clients: Vec<ClientEntry>,
    estimator: BandwidthEstimator,
    last_burst_time: Option<Instant>,
    burst_alarm: Alarm,
}

/// Shared handle to a session's sender transport
///
/// Clones refer to the same transport.
#[derive(Clone)]
pub struct SenderTransport {
    state: Rc<RefCell<TransportState>>,
}

impl SenderTransport {
    pub fn new(environment: impl Environment + 'static, max_bitrate: i64) -> Self {
        let packet_size = environment.max_packet_size();
        let max_bitrate = max_bitrate.max(1);
        let max_packets_per_burst = Self::compute_max_packets_per_burst(packet_size, max_bitrate);
        debug!(max_bitrate, max_packets_per_burst, "sender transport created");
        SenderTransport {
            state: Rc::new(RefCell::new(TransportState {
                environment: Box::new(environment),
                packet_buffer: vec![0u8; packet_size],
                max_bitrate,
                max_packets_per_burst,
                clients: Vec::new(),
                estimator: BandwidthEstimator::new(),
                last_burst_time: None,
                burst_alarm: Alarm::new(),
            })),
        }
    }

    /// Packets that fit in one pacing interval at `max_bitrate`, at least one
    pub fn compute_max_packets_per_burst(packet_size: usize, max_bitrate: i64) -> usize {
        let bits_per_packet = (packet_size.max(1) as i64) * BITS_PER_BYTE;
        let packets_per_second = max_bitrate / bits_per_packet;
        let per_interval = packets_per_second * PACING_INTERVAL.as_millis() as i64 / 1000;
        per_interval.max(1) as usize
    }

    pub fn now(&self) -> Instant {
        self.state.borrow().environment.now()
    }

    pub fn max_packet_size(&self) -> usize {
        self.state.borrow().packet_buffer.len()
    }

    pub fn max_bitrate(&self) -> i64 {
        self.state.borrow().max_bitrate
    }

    pub fn max_packets_per_burst(&self) -> usize {
        self.state.borrow().max_packets_per_burst
    }

    /// Register `client` sending as `ssrc` to `receiver_ssrc`; the transport
    /// holds it weakly
    pub fn register_client(
        &self,
        ssrc: Ssrc,
        receiver_ssrc: Ssrc,
        client: Weak<RefCell<dyn SenderTransportClient>>,
    ) {
        let mut state = self.state.borrow_mut();
        debug_assert!(state.clients.iter().all(|e| e.ssrc != ssrc), "duplicate ssrc");
        state.clients.retain(|e| e.ssrc != ssrc);
        state.clients.push(ClientEntry {
            ssrc,
            receiver_ssrc,
            client,
            next_rtcp_send_time: None,
            next_rtp_send_time: None,
        });
        state
            .clients
            .sort_by(|a, b| compare_priority(a.ssrc, b.ssrc));
    }

    pub fn deregister_client(&self, ssrc: Ssrc) {
        // May run while the transport is mid-burst (from a client's Drop).
        if let Ok(mut state) = self.state.try_borrow_mut() {
            state.clients.retain(|e| e.ssrc != ssrc);
            state.schedule_next_burst();
        }
    }

    pub fn client_count(&self) -> usize {
        self.state.borrow().clients.len()
    }

    /// Send an RTCP packet for `ssrc` as soon as pacing allows
    pub fn request_rtcp_send(&self, ssrc: Ssrc) {
        let mut state = self.state.borrow_mut();
        let now = state.environment.now();
        if let Some(entry) = state.clients.iter_mut().find(|e| e.ssrc == ssrc) {
            entry.next_rtcp_send_time = Some(now);
        }
        state.schedule_next_burst();
    }

    /// Resume RTP sending for `ssrc` as soon as pacing allows
    pub fn request_rtp_send(&self, ssrc: Ssrc) {
        let mut state = self.state.borrow_mut();
        let now = state.environment.now();
        if let Some(entry) = state.clients.iter_mut().find(|e| e.ssrc == ssrc) {
            entry.next_rtp_send_time = Some(now);
        }
        state.schedule_next_burst();
    }

    pub fn record_flight_plan(&self, payload_bytes: usize, begin: Instant, end: Instant) {
        self.state
            .borrow_mut()
            .estimator
            .record_flight_plan(payload_bytes, begin, end);
    }

    pub fn record_feedback(&self, payload_bytes_acknowledged: usize, feedback_time_minus_rtt: Instant) {
        self.state
            .borrow_mut()
            .estimator
            .record_feedback(payload_bytes_acknowledged, feedback_time_minus_rtt);
    }

    /// Bits per second still available in `[begin, end)`, capped at the max
    /// bitrate
    pub fn predict_available_bitrate(&self, begin: Instant, end: Instant) -> Option<i64> {
        let state = self.state.borrow();
        state
            .estimator
            .predict_available_bitrate(begin, end)
            .map(|rate| rate.min(state.max_bitrate))
    }

    pub fn compute_effective_bitrate(&self) -> Option<i64> {
        let state = self.state.borrow();
        state
            .estimator
            .compute_effective_bitrate()
            .map(|rate| rate.min(state.max_bitrate))
    }

    /// Route an inbound datagram to the sender whose receiver sent it
    ///
    /// Senders only consume RTCP; anything else is ignored.
    pub fn on_received_packet(&self, arrival_time: Instant, packet: &[u8]) {
        let (kind, from_ssrc) = inspect_packet_for_routing(packet);
        if kind != ApparentPacketType::Rtcp {
            trace!(?kind, "sender transport ignoring non-RTCP packet");
            return;
        }
        let client = {
            let state = self.state.borrow();
            state
                .clients
                .iter()
                .find(|e| e.receiver_ssrc == from_ssrc)
                .and_then(|e| e.client.upgrade())
        };
        match client {
            // The transport is not borrowed here: the client may call back in.
            Some(client) => client
                .borrow_mut()
                .on_received_rtcp_packet(arrival_time, packet),
            None => trace!(from_ssrc, "no sender registered for RTCP packet"),
        }
    }

    /// When `handle_timeout` next needs to run, `None` if idle
    pub fn next_burst_time(&self) -> Option<Instant> {
        self.state.borrow().burst_alarm.deadline()
    }

    /// Run the burst if it is due
    pub fn handle_timeout(&self, now: Instant) {
        let mut state = self.state.borrow_mut();
        if state.burst_alarm.take_if_due(now) {
            state.send_burst_of_packets(now);
        }
    }
}

impl TransportState {
    fn schedule_next_burst(&mut self) {
        // Earliest of the clients' next send times, but no sooner than one
        // pacing interval after the last burst.
        let earliest_allowed = self
            .last_burst_time
            .map(|t| t + PACING_INTERVAL)
            .unwrap_or_else(|| self.environment.now());
        let mut next_burst_time: Option<Instant> = None;
        for entry in &self.clients {
            let Some(next_send_time) =
                earliest(entry.next_rtcp_send_time, entry.next_rtp_send_time)
            else {
                continue;
            };
            if next_burst_time.map_or(false, |t| next_send_time >= t) {
                continue;
            }
            if next_send_time <= earliest_allowed {
                next_burst_time = Some(earliest_allowed);
                break;
            }
            next_burst_time = Some(next_send_time);
        }

        match next_burst_time {
            Some(when) => self.burst_alarm.schedule(when),
            None => self.burst_alarm.cancel(),
        }
    }

    fn send_burst_of_packets(&mut self, burst_time: Instant) {
        self.clients.retain(|e| e.client.strong_count() > 0);

        let num_rtcp_sent = self.send_just_the_rtcp_packets(burst_time);
        let budget = self.max_packets_per_burst.saturating_sub(num_rtcp_sent);
        let num_rtp_sent = self.send_just_the_rtp_packets(burst_time, budget);
        self.last_burst_time = Some(burst_time);

        if num_rtp_sent > 0 {
            self.estimator.record_active_burst_time(burst_time);
        } else {
            self.estimator.record_inactive_burst_time(burst_time);
        }
        trace!(num_rtcp_sent, num_rtp_sent, "burst");

        self.schedule_next_burst();
    }

    fn send_just_the_rtcp_packets(&mut self, send_time: Instant) -> usize {
        let mut num_sent = 0;
        for index in 0..self.clients.len() {
            if !is_due(self.clients[index].next_rtcp_send_time, send_time) {
                continue;
            }
            let Some(client) = self.clients[index].client.upgrade() else {
                continue;
            };
            let len = client
                .borrow_mut()
                .get_rtcp_packet_for_immediate_send(send_time, &mut self.packet_buffer);
            if len > 0 {
                self.environment.send_packet(&self.packet_buffer[..len]);
                num_sent += 1;
            }
            self.clients[index].next_rtcp_send_time = Some(send_time + RTCP_REPORT_INTERVAL);
        }
        num_sent
    }

    fn send_just_the_rtp_packets(&mut self, send_time: Instant, budget: usize) -> usize {
        if budget == 0 {
            return 0;
        }
        let mut active: Vec<usize> = (0..self.clients.len())
            .filter(|&i| is_due(self.clients[i].next_rtp_send_time, send_time))
            .collect();

        let mut num_sent = 0;
        while !active.is_empty() {
            let mut still_active = Vec::with_capacity(active.len());
            for &index in &active {
                let Some(client) = self.clients[index].client.upgrade() else {
                    continue;
                };
                let mut client = client.borrow_mut();
                let len = client.get_rtp_packet_for_immediate_send(send_time, &mut self.packet_buffer);
                if len == 0 {
                    self.clients[index].next_rtp_send_time = client.get_rtp_resume_time(send_time);
                    continue;
                }
                self.environment.send_packet(&self.packet_buffer[..len]);
                num_sent += 1;
                if num_sent >= budget {
                    return num_sent;
                }
                still_active.push(index);
            }
            active = still_active;
        }
        num_sent
    }
}

impl Drop for TransportState {
    fn drop(&mut self) {
        let live = self.clients.iter().filter(|e| e.client.strong_count() > 0).count();
        if live > 0 {
            warn!(live, "sender transport dropped with senders still registered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::FakeEnvironment;
    use cast_io::{Clock, ManualClock};

    /// Emits `rtp_remaining` RTP packets and an RTCP packet whenever asked
    struct ScriptedClient {
        ssrc: Ssrc,
        receiver_ssrc: Ssrc,
        rtp_remaining: usize,
        rtcp_received: usize,
        resume_time: Option<Instant>,
    }

    impl ScriptedClient {
        fn new(ssrc: Ssrc, rtp_remaining: usize) -> Rc<RefCell<Self>> {
            Rc::new(RefCell::new(ScriptedClient {
                ssrc,
                receiver_ssrc: ssrc + 1,
                rtp_remaining,
                rtcp_received: 0,
                resume_time: None,
            }))
        }
    }

    impl SenderTransportClient for ScriptedClient {
        fn on_received_rtcp_packet(&mut self, _arrival_time: Instant, _packet: &[u8]) {
            self.rtcp_received += 1;
        }

        fn get_rtcp_packet_for_immediate_send(&mut self, _send_time: Instant, buffer: &mut [u8]) -> usize {
            // Sender report header with our SSRC.
            buffer[..8].copy_from_slice(&[0x80, 200, 0, 1, 0, 0, 0, 0]);
            buffer[4..8].copy_from_slice(&self.ssrc.to_be_bytes());
            8
        }

        fn get_rtp_packet_for_immediate_send(&mut self, _send_time: Instant, buffer: &mut [u8]) -> usize {
            if self.rtp_remaining == 0 {
                return 0;
            }
            self.rtp_remaining -= 1;
            buffer[0] = 0x80;
            buffer[1] = 96;
            buffer[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
            12
        }

        fn get_rtp_resume_time(&mut self, _now: Instant) -> Option<Instant> {
            self.resume_time
        }
    }

    fn register(transport: &SenderTransport, client: &Rc<RefCell<ScriptedClient>>) {
        let (ssrc, receiver_ssrc) = {
            let client = client.borrow();
            (client.ssrc, client.receiver_ssrc)
        };
        let as_dyn: Rc<RefCell<dyn SenderTransportClient>> = client.clone();
        transport.register_client(ssrc, receiver_ssrc, Rc::downgrade(&as_dyn));
    }

    fn setup(max_bitrate: i64) -> (SenderTransport, FakeEnvironment, ManualClock) {
        let clock = ManualClock::new(Instant::now());
        let env = FakeEnvironment::new(clock.clone());
        let transport = SenderTransport::new(env.clone(), max_bitrate);
        (transport, env, clock)
    }

    #[test]
    fn test_max_packets_per_burst() {
        assert_eq!(SenderTransport::compute_max_packets_per_burst(1472, 24 << 20), 21);
        assert_eq!(SenderTransport::compute_max_packets_per_burst(1472, 1), 1);
    }

    #[test]
    fn test_idle_until_requested() {
        let (transport, env, _clock) = setup(24 << 20);
        let client = ScriptedClient::new(50_001, 3);
        register(&transport, &client);
        assert_eq!(transport.next_burst_time(), None);

        transport.request_rtp_send(50_001);
        let when = transport.next_burst_time().unwrap();
        transport.handle_timeout(when);
        assert_eq!(env.take_sent_packets().len(), 3);
        // Ran dry with no resume time: idle again.
        assert_eq!(transport.next_burst_time(), None);
    }

    #[test]
    fn test_rtcp_first_then_budget() {
        let (transport, env, _clock) = setup(24 << 20);
        let client = ScriptedClient::new(50_001, 100);
        register(&transport, &client);
        transport.request_rtcp_send(50_001);
        transport.request_rtp_send(50_001);

        let when = transport.next_burst_time().unwrap();
        transport.handle_timeout(when);
        let sent = env.take_sent_packets();
        assert_eq!(sent.len(), transport.max_packets_per_burst());
        assert_eq!(sent[0][1], 200);
        assert!(sent[1..].iter().all(|p| p[1] == 96));

        // Next burst waits a full pacing interval.
        assert_eq!(transport.next_burst_time(), Some(when + PACING_INTERVAL));
        transport.handle_timeout(when + Duration::from_millis(1));
        assert_eq!(env.sent_packet_count(), 0);
    }

    #[test]
    fn test_round_robin_in_priority_order() {
        let (transport, env, _clock) = setup(24 << 20);
        let video = ScriptedClient::new(60_000, 2);
        let audio = ScriptedClient::new(10, 2);
        register(&transport, &video);
        register(&transport, &audio);
        transport.request_rtp_send(60_000);
        transport.request_rtp_send(10);

        let when = transport.next_burst_time().unwrap();
        transport.handle_timeout(when);
        let ssrcs: Vec<u32> = env
            .take_sent_packets()
            .iter()
            .map(|p| u32::from_be_bytes([p[8], p[9], p[10], p[11]]))
            .collect();
        assert_eq!(ssrcs, vec![10, 60_000, 10, 60_000]);
    }

    #[test]
    fn test_resume_time_reschedules() {
        let (transport, env, _clock) = setup(24 << 20);
        let client = ScriptedClient::new(50_001, 1);
        register(&transport, &client);
        transport.request_rtp_send(50_001);

        let when = transport.next_burst_time().unwrap();
        let resume = when + Duration::from_millis(100);
        client.borrow_mut().resume_time = Some(resume);
        transport.handle_timeout(when);
        assert_eq!(env.take_sent_packets().len(), 1);
        assert_eq!(transport.next_burst_time(), Some(resume));
    }

    #[test]
    fn test_routes_rtcp_by_ssrc() {
        let (transport, _env, clock) = setup(24 << 20);
        let client = ScriptedClient::new(50_001, 0);
        register(&transport, &client);

        // Receiver report from our receiver, then one from a stranger.
        let mut rtcp = vec![0x80, 201, 0, 1];
        rtcp.extend_from_slice(&50_002u32.to_be_bytes());
        transport.on_received_packet(clock.now(), &rtcp);
        rtcp[4..8].copy_from_slice(&77u32.to_be_bytes());
        transport.on_received_packet(clock.now(), &rtcp);

        // RTP is never routed to senders.
        let mut rtp = vec![0x80, 96, 0, 0, 0, 0, 0, 0];
        rtp.extend_from_slice(&50_001u32.to_be_bytes());
        rtp.extend_from_slice(&[0u8; 8]);
        transport.on_received_packet(clock.now(), &rtp);

        assert_eq!(client.borrow().rtcp_received, 1);
    }

    #[test]
    fn test_dropped_client_is_forgotten() {
        let (transport, env, _clock) = setup(24 << 20);
        let client = ScriptedClient::new(50_001, 5);
        register(&transport, &client);
        transport.request_rtp_send(50_001);
        drop(client);

        let when = transport.next_burst_time().unwrap();
        transport.handle_timeout(when);
        assert_eq!(env.sent_packet_count(), 0);
        assert_eq!(transport.client_count(), 0);
    }

    #[test]
    fn test_prediction_capped_at_max_bitrate() {
        let (transport, _env, clock) = setup(1_000_000);
        let mut now = clock.now() + Duration::from_secs(5);
        for _ in 0..256 {
            {
                let mut state = transport.state.borrow_mut();
                state.estimator.record_active_burst_time(now);
            }
            // Far more than the max bitrate is acknowledged.
            transport.record_feedback(100_000, now);
            now += Duration::from_millis(10);
        }
        let rate = transport
            .predict_available_bitrate(now - Duration::from_millis(100), now)
            .unwrap();
        assert_eq!(rate, 1_000_000);
    }
}
