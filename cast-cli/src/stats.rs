//! Statistics formatting

use cast_transport::{ReceiverStats, SenderStats};
use std::time::Duration;

/// Scale `value` by `step` until it fits under the next unit
fn scaled(value: u64, step: f64, units: &[&str]) -> String {
    if value < step as u64 {
        return format!("{} {}", value, units[0]);
    }
    let mut amount = value as f64;
    let mut unit = 0;
    while amount >= step && unit + 1 < units.len() {
        amount /= step;
        unit += 1;
    }
    format!("{:.2} {}", amount, units[unit])
}

/// Bytes in binary units
pub fn format_bytes(bytes: u64) -> String {
    scaled(bytes, 1024.0, &["B", "KB", "MB", "GB"])
}

/// Bits per second in decimal units
pub fn format_bandwidth(bps: u64) -> String {
    scaled(bps, 1000.0, &["bps", "Kbps", "Mbps", "Gbps"])
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, 0, s) => format!("{}s", s),
        (0, m, s) => format!("{}m {:02}s", m, s),
        (h, m, s) => format!("{}h {:02}m {:02}s", h, m, s),
    }
}

fn rate(bytes: u64, elapsed: Duration) -> u64 {
    let millis = elapsed.as_millis() as u64;
    if millis == 0 {
        0
    } else {
        bytes * 8 * 1000 / millis
    }
}

/// One-line sender summary
pub fn sender_stats_line(stats: &SenderStats, elapsed: Duration) -> String {
    format!(
        "[{}] frames {} enqueued / {} acked | packets {} ({} resent, {} kickstarts) | {} at {} | rtt {:.1}ms",
        format_duration(elapsed),
        stats.frames_enqueued,
        stats.frames_canceled,
        stats.packets_sent,
        stats.packets_retransmitted,
        stats.kickstarts,
        format_bytes(stats.octets_sent),
        format_bandwidth(rate(stats.octets_sent, elapsed)),
        stats.round_trip_time.as_secs_f64() * 1000.0,
    )
}

/// One-line receiver summary
pub fn receiver_stats_line(stats: &ReceiverStats, elapsed: Duration) -> String {
    format!(
        "[{}] frames {} complete / {} delivered | packets {} received, {} lost, {} rejected | jitter {} ticks",
        format_duration(elapsed),
        stats.frames_completed,
        stats.frames_consumed,
        stats.packets_received,
        stats.cumulative_packets_lost,
        stats.packets_rejected,
        stats.jitter.ticks(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_format_bandwidth() {
        assert_eq!(format_bandwidth(999), "999 bps");
        assert_eq!(format_bandwidth(24_000), "24.00 Kbps");
        assert_eq!(format_bandwidth(2_500_000_000), "2.50 Gbps");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 05s");
        assert_eq!(format_duration(Duration::from_secs(7322)), "2h 02m 02s");
    }

    #[test]
    fn test_sender_line() {
        let stats = SenderStats {
            frames_enqueued: 30,
            frames_canceled: 29,
            packets_sent: 60,
            octets_sent: 125_000,
            round_trip_time: Duration::from_millis(12),
            ..SenderStats::default()
        };
        let line = sender_stats_line(&stats, Duration::from_secs(1));
        assert!(line.contains("30 enqueued / 29 acked"));
        assert!(line.contains("1.00 Mbps"));
        assert!(line.contains("rtt 12.0ms"));
    }

    #[test]
    fn test_receiver_line() {
        let stats = ReceiverStats {
            packets_received: 10,
            cumulative_packets_lost: 1,
            ..ReceiverStats::default()
        };
        let line = receiver_stats_line(&stats, Duration::ZERO);
        assert!(line.contains("10 received, 1 lost"));
    }
}
