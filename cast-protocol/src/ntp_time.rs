//! NTP Timestamps
//!
//! RTCP expresses reference times as 64-bit NTP timestamps: 32 bits of seconds
//! since 1900-01-01 followed by 32 bits of fractional seconds.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub type NtpTimestamp = u64;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970)
pub const NTP_EPOCH_OFFSET_SECS: u64 = 2_208_988_800;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

#[inline]
pub fn ntp_seconds(timestamp: NtpTimestamp) -> u32 {
    (timestamp >> 32) as u32
}

#[inline]
pub fn ntp_fraction(timestamp: NtpTimestamp) -> u32 {
    timestamp as u32
}

/// Encode a duration since the NTP epoch
pub fn to_ntp_timestamp(since_epoch: Duration) -> NtpTimestamp {
    let seconds = since_epoch.as_secs() & 0xFFFF_FFFF;
    let fraction = ((since_epoch.subsec_nanos() as u128) << 32) / NANOS_PER_SECOND;
    (seconds << 32) | fraction as u64
}

/// Decode a timestamp into a duration since the NTP epoch
pub fn from_ntp_timestamp(timestamp: NtpTimestamp) -> Duration {
    let nanos = (ntp_fraction(timestamp) as u128 * NANOS_PER_SECOND) >> 32;
    Duration::new(ntp_seconds(timestamp) as u64, nanos as u32)
}

/// Maps between monotonic `Instant`s and NTP wall-clock timestamps
///
/// The mapping is fixed at construction, so clock adjustments after that
/// point do not disturb the monotonic ordering of converted values.
#[derive(Debug, Clone, Copy)]
pub struct NtpTimeConverter {
    start_time: Instant,
    since_ntp_epoch: Duration,
}

impl NtpTimeConverter {
    /// Anchor `now` to the current system wall clock
    pub fn new(now: Instant) -> Self {
        let since_unix_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::with_wall_clock(now, since_unix_epoch)
    }

    /// Anchor `now` to an explicit wall-clock time (since the Unix epoch)
    pub fn with_wall_clock(now: Instant, since_unix_epoch: Duration) -> Self {
        NtpTimeConverter {
            start_time: now,
            since_ntp_epoch: since_unix_epoch + Duration::from_secs(NTP_EPOCH_OFFSET_SECS),
        }
    }

    pub fn to_ntp_timestamp(&self, time: Instant) -> NtpTimestamp {
        let since_epoch = if time >= self.start_time {
            self.since_ntp_epoch + (time - self.start_time)
        } else {
            self.since_ntp_epoch
                .saturating_sub(self.start_time - time)
        };
        to_ntp_timestamp(since_epoch)
    }

    pub fn to_local_time(&self, timestamp: NtpTimestamp) -> Instant {
        let since_epoch = from_ntp_timestamp(timestamp);
        if since_epoch >= self.since_ntp_epoch {
            self.start_time + (since_epoch - self.since_ntp_epoch)
        } else {
            let before = self.since_ntp_epoch - since_epoch;
            self.start_time.checked_sub(before).unwrap_or(self.start_time)
        }
    }
}
