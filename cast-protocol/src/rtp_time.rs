//! RTP Media Time
//!
//! RTP timestamps count media clock ticks at a stream-specific timebase (for
//! example 90 kHz for video, the sample rate for audio). Only 32 bits are
//! carried on the wire; internally we keep a 64-bit expanded value.

use crate::expand::expand_nearest;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

const NANOS_PER_SECOND: i128 = 1_000_000_000;

/// Signed difference between two RTP timestamps, in ticks
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct RtpTimeDelta(i64);

impl RtpTimeDelta {
    #[inline]
    pub const fn from_ticks(ticks: i64) -> Self {
        RtpTimeDelta(ticks)
    }

    #[inline]
    pub fn ticks(self) -> i64 {
        self.0
    }

    /// Convert a wall duration to ticks at `timebase`, rounding to nearest
    pub fn from_duration(duration: Duration, timebase: u32) -> Self {
        let nanos = duration.as_nanos() as i128;
        let ticks = (nanos * timebase as i128 + NANOS_PER_SECOND / 2) / NANOS_PER_SECOND;
        RtpTimeDelta(ticks.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }

    /// Convert to a wall duration at `timebase`
    ///
    /// Negative deltas convert to zero.
    pub fn to_duration(self, timebase: u32) -> Duration {
        if self.0 <= 0 || timebase == 0 {
            return Duration::ZERO;
        }
        let nanos = self.0 as i128 * NANOS_PER_SECOND / timebase as i128;
        Duration::from_nanos(nanos.min(u64::MAX as i128) as u64)
    }
}

impl fmt::Debug for RtpTimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RtpTimeDelta({})", self.0)
    }
}

impl Add for RtpTimeDelta {
    type Output = RtpTimeDelta;

    fn add(self, rhs: RtpTimeDelta) -> RtpTimeDelta {
        RtpTimeDelta(self.0 + rhs.0)
    }
}

/// Expanded RTP timestamp
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct RtpTimeTicks(i64);

impl RtpTimeTicks {
    #[inline]
    pub const fn from_ticks(ticks: i64) -> Self {
        RtpTimeTicks(ticks)
    }

    #[inline]
    pub fn ticks(self) -> i64 {
        self.0
    }

    /// Truncated wire representation
    #[inline]
    pub fn lower_32_bits(self) -> u32 {
        self.0 as u32
    }

    /// Expand a truncated wire timestamp to the value nearest `self`
    pub fn expand(self, lower_32_bits: u32) -> RtpTimeTicks {
        RtpTimeTicks(expand_nearest(self.0, lower_32_bits as u64, 32))
    }
}

impl fmt::Debug for RtpTimeTicks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RtpTimeTicks({})", self.0)
    }
}

impl Add<RtpTimeDelta> for RtpTimeTicks {
    type Output = RtpTimeTicks;

    fn add(self, rhs: RtpTimeDelta) -> RtpTimeTicks {
        RtpTimeTicks(self.0 + rhs.0)
    }
}

impl AddAssign<RtpTimeDelta> for RtpTimeTicks {
    fn add_assign(&mut self, rhs: RtpTimeDelta) {
        self.0 += rhs.0;
    }
}

impl Sub for RtpTimeTicks {
    type Output = RtpTimeDelta;

    fn sub(self, rhs: RtpTimeTicks) -> RtpTimeDelta {
        RtpTimeDelta(self.0 - rhs.0)
    }
}
