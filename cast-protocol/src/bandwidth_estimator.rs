//! Bandwidth Estimation
//!
//! Tracks three rolling histories over the same fixed window:
//!
//! - the *flight plan*: payload bytes the sender has scheduled, spread over
//!   the time range in which they are expected to go out,
//! - *feedback*: payload bytes the receiver acknowledged, placed at the
//!   estimated time they arrived (feedback time minus one round trip),
//! - *burst activity*: which time buckets saw any transmission at all.
//!
//! The effective bitrate is acknowledged bytes over transmission-active time;
//! the available bitrate for a future range is that minus what the flight
//! plan already commits to it. The estimate is deliberately simple.

use std::time::{Duration, Instant};

/// Number of buckets in every history
pub const NUM_BUCKETS: usize = 256;

/// Time covered by one bucket
pub const BUCKET_PERIOD: Duration = Duration::from_millis(10);

/// Time covered by a full history
pub const HISTORY_DURATION: Duration = Duration::from_millis(10 * NUM_BUCKETS as u64);

const BITS_PER_BYTE: i64 = 8;
const NANOS_PER_SECOND: i128 = 1_000_000_000;

/// Signed `to - from` in nanoseconds
fn signed_nanos(from: Instant, to: Instant) -> i64 {
    if to >= from {
        (to - from).as_nanos().min(i64::MAX as u128) as i64
    } else {
        -((from - to).as_nanos().min(i64::MAX as u128) as i64)
    }
}

fn to_bits_per_second(bytes: i64, window: Duration) -> i64 {
    debug_assert!(window > Duration::ZERO);
    let bits = bytes as i128 * BITS_PER_BYTE as i128;
    let rate = bits * NANOS_PER_SECOND / window.as_nanos().max(1) as i128;
    rate.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Fixed ring of time buckets covering `[begin_time, begin_time + HISTORY_DURATION)`
#[derive(Debug, Clone)]
struct BucketRing<T> {
    buckets: Vec<T>,
    /// Ring index of the oldest bucket
    tail: usize,
    /// Unset until the first data point arrives
    begin_time: Option<Instant>,
}

impl<T: Copy + Default> BucketRing<T> {
    fn new() -> Self {
        BucketRing {
            buckets: vec![T::default(); NUM_BUCKETS],
            tail: 0,
            begin_time: None,
        }
    }

    fn begin_time(&self) -> Option<Instant> {
        self.begin_time
    }

    fn end_time(&self) -> Option<Instant> {
        self.begin_time.map(|begin| begin + HISTORY_DURATION)
    }

    /// Slide the window forward, discarding old buckets, so that `until`
    /// falls inside it
    fn advance_to_include(&mut self, until: Instant) {
        let begin = match self.begin_time {
            Some(begin) => begin,
            None => {
                // Start with `until` in the newest bucket.
                let lookback = BUCKET_PERIOD * (NUM_BUCKETS as u32 - 1);
                self.begin_time = Some(until.checked_sub(lookback).unwrap_or(until));
                return;
            }
        };
        let end = begin + HISTORY_DURATION;
        if until < end {
            return;
        }
        let num_new = 1 + ((until - end).as_nanos() / BUCKET_PERIOD.as_nanos()) as u64;
        if num_new < NUM_BUCKETS as u64 {
            for _ in 0..num_new {
                self.buckets[self.tail] = T::default();
                self.tail = (self.tail + 1) % NUM_BUCKETS;
            }
        } else {
            self.buckets.iter_mut().for_each(|b| *b = T::default());
        }
        let period_nanos = BUCKET_PERIOD.as_nanos() as u64;
        self.begin_time = Some(begin + Duration::from_nanos(period_nanos.saturating_mul(num_new)));
    }

    /// Offset of the bucket holding `when`, if inside the window
    fn offset_of(&self, when: Instant) -> Option<usize> {
        let begin = self.begin_time?;
        if when < begin {
            return None;
        }
        let offset = ((when - begin).as_nanos() / BUCKET_PERIOD.as_nanos()) as usize;
        (offset < NUM_BUCKETS).then_some(offset)
    }

    /// Bucket offsets representing `[begin, end)`, rounded to the nearest
    /// bucket boundary; may fall outside `[0, NUM_BUCKETS]`
    fn relative_index_range(&self, begin: Instant, end: Instant) -> Option<(i64, i64)> {
        let origin = self.begin_time?;
        let period = BUCKET_PERIOD.as_nanos() as i64;
        let index = |t: Instant| (signed_nanos(origin, t) + period / 2).div_euclid(period);
        Some((index(begin), index(end)))
    }

    fn get_mut(&mut self, offset: usize) -> &mut T {
        let index = (self.tail + offset) % NUM_BUCKETS;
        &mut self.buckets[index]
    }

    fn iter_offsets(&self, begin: usize, end: usize) -> impl Iterator<Item = &T> + '_ {
        (begin..end).map(move |offset| &self.buckets[(self.tail + offset) % NUM_BUCKETS])
    }
}

/// Byte counts per bucket
#[derive(Debug, Clone)]
struct FlowTracker {
    ring: BucketRing<i32>,
}

impl FlowTracker {
    fn new() -> Self {
        FlowTracker {
            ring: BucketRing::new(),
        }
    }

    fn add_to(&mut self, offset: usize, amount: i64) {
        let bucket = self.ring.get_mut(offset);
        *bucket = (*bucket as i64 + amount).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    }

    fn accumulate(&mut self, amount: i64, when: Instant) {
        self.ring.advance_to_include(when);
        if let Some(offset) = self.ring.offset_of(when) {
            self.add_to(offset, amount);
        }
    }

    /// Spread `amount` evenly across the buckets representing `[begin, end)`;
    /// any remainder goes to the last one
    fn accumulate_over_range(&mut self, amount: i64, begin: Instant, end: Instant) {
        debug_assert!(begin < end);
        self.ring
            .advance_to_include(end.checked_sub(Duration::from_nanos(1)).unwrap_or(end));
        match self.ring.begin_time() {
            Some(window_begin) if end > window_begin => {}
            _ => return,
        }
        let (first, second) = match self.ring.relative_index_range(begin, end) {
            Some(range) => range,
            None => return,
        };
        let offset_begin = first.max(0);
        let offset_end = second.min(NUM_BUCKETS as i64);
        if offset_end <= offset_begin {
            // Range is narrower than a bucket.
            self.accumulate(amount, begin);
            return;
        }
        let spread = (second - first).max(1);
        let per_bucket = amount / spread;
        let leftover = amount % spread;
        for offset in offset_begin..offset_end - 1 {
            self.add_to(offset as usize, per_bucket);
        }
        self.add_to((offset_end - 1) as usize, per_bucket + leftover);
    }

    fn sum(&self) -> i64 {
        self.ring.buckets.iter().map(|b| *b as i64).sum()
    }

    fn sum_over_range(&self, begin: Instant, end: Instant) -> i64 {
        let (first, second) = match self.ring.relative_index_range(begin, end) {
            Some(range) => range,
            None => return 0,
        };
        let offset_begin = first.max(0);
        let offset_end = second.min(NUM_BUCKETS as i64);
        if offset_end <= offset_begin {
            return 0;
        }
        self.ring
            .iter_offsets(offset_begin as usize, offset_end as usize)
            .map(|b| *b as i64)
            .sum()
    }
}

/// Transmission-active flag per bucket
#[derive(Debug, Clone)]
struct ActivityTracker {
    ring: BucketRing<bool>,
}

impl ActivityTracker {
    fn new() -> Self {
        ActivityTracker {
            ring: BucketRing::new(),
        }
    }

    fn mark_active(&mut self, when: Instant) {
        self.ring.advance_to_include(when);
        if let Some(offset) = self.ring.offset_of(when) {
            *self.ring.get_mut(offset) = true;
        }
    }

    fn sum_active_time(&self) -> Duration {
        let active = self.ring.buckets.iter().filter(|b| **b).count();
        BUCKET_PERIOD * active as u32
    }
}

#[derive(Debug, Clone)]
pub struct BandwidthEstimator {
    flight_plan: FlowTracker,
    burst_history: ActivityTracker,
    feedback_history: FlowTracker,
}

impl BandwidthEstimator {
    pub fn new() -> Self {
        BandwidthEstimator {
            flight_plan: FlowTracker::new(),
            burst_history: ActivityTracker::new(),
            feedback_history: FlowTracker::new(),
        }
    }

    /// Record that `payload_bytes` are planned to be sent within `[begin, end)`
    ///
    /// A plan that is already late (`begin >= end`) counts as sent all at
    /// once at `begin`.
    pub fn record_flight_plan(&mut self, payload_bytes: usize, begin: Instant, end: Instant) {
        let amount = payload_bytes as i64;
        if begin < end {
            self.flight_plan.accumulate_over_range(amount, begin, end);
        } else {
            self.flight_plan.accumulate(amount, begin);
        }
    }

    /// A burst at `when` sent at least one packet
    pub fn record_active_burst_time(&mut self, when: Instant) {
        self.burst_history.mark_active(when);
    }

    /// A burst at `when` had nothing to send; still advances the window
    pub fn record_inactive_burst_time(&mut self, when: Instant) {
        self.burst_history.ring.advance_to_include(when);
    }

    /// Record acknowledged bytes at the estimated arrival time
    ///
    /// Call for every feedback event, including ones acknowledging nothing,
    /// so quiet periods are reflected in the history.
    pub fn record_feedback(&mut self, payload_bytes_acknowledged: usize, feedback_time_minus_rtt: Instant) {
        self.feedback_history
            .accumulate(payload_bytes_acknowledged as i64, feedback_time_minus_rtt);
    }

    /// Acknowledged bits per second of transmission-active time, or `None`
    /// without enough recent history
    pub fn compute_effective_bitrate(&self) -> Option<i64> {
        let overlap_begin = self
            .burst_history
            .ring
            .begin_time()?
            .max(self.feedback_history.ring.begin_time()?);
        let overlap_end = self
            .burst_history
            .ring
            .end_time()?
            .min(self.feedback_history.ring.end_time()?);
        if overlap_end < overlap_begin + HISTORY_DURATION / 2 {
            return None;
        }
        let transmit_duration = self.burst_history.sum_active_time();
        if transmit_duration.is_zero() {
            return None;
        }
        Some(to_bits_per_second(self.feedback_history.sum(), transmit_duration))
    }

    /// Bits per second still available in `[begin, end)` after what is
    /// already planned, or `None` without enough history
    ///
    /// The result may be negative when the plan exceeds the effective rate.
    pub fn predict_available_bitrate(&self, begin: Instant, end: Instant) -> Option<i64> {
        if end <= begin {
            return None;
        }
        let effective = self.compute_effective_bitrate()?;
        let planned = to_bits_per_second(self.flight_plan.sum_over_range(begin, end), end - begin);
        Some(effective - planned)
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}
