//! Stream identifiers (SSRC)
//!
//! SSRC values double as a priority: lower values are serviced first by the
//! sender transport. Audio streams draw from the higher-priority range.

use std::cmp::Ordering;

pub type Ssrc = u32;

pub const HIGHER_PRIORITY_SSRC_MIN: Ssrc = 1;
pub const HIGHER_PRIORITY_SSRC_MAX: Ssrc = 50_000;
pub const NORMAL_PRIORITY_SSRC_MIN: Ssrc = 50_001;
pub const NORMAL_PRIORITY_SSRC_MAX: Ssrc = 100_000;

/// Map a random value into the SSRC range for the requested priority
pub fn ssrc_from_random(random: u32, higher_priority: bool) -> Ssrc {
    let (min, max) = if higher_priority {
        (HIGHER_PRIORITY_SSRC_MIN, HIGHER_PRIORITY_SSRC_MAX)
    } else {
        (NORMAL_PRIORITY_SSRC_MIN, NORMAL_PRIORITY_SSRC_MAX)
    };
    min + random % (max - min + 1)
}

/// Order two SSRCs by service priority; `Less` means `a` goes first
#[inline]
pub fn compare_priority(a: Ssrc, b: Ssrc) -> Ordering {
    a.cmp(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges() {
        for random in [0, 1, 49_999, 50_000, u32::MAX] {
            let high = ssrc_from_random(random, true);
            assert!((HIGHER_PRIORITY_SSRC_MIN..=HIGHER_PRIORITY_SSRC_MAX).contains(&high));
            let normal = ssrc_from_random(random, false);
            assert!((NORMAL_PRIORITY_SSRC_MIN..=NORMAL_PRIORITY_SSRC_MAX).contains(&normal));
        }
    }

    #[test]
    fn test_priority_order() {
        let audio = ssrc_from_random(7, true);
        let video = ssrc_from_random(7, false);
        assert_eq!(compare_priority(audio, video), Ordering::Less);
        assert_eq!(compare_priority(video, video), Ordering::Equal);
    }
}
