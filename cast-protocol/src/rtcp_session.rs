//! Per-session RTCP context shared by builders and parsers

use crate::ntp_time::NtpTimeConverter;
use crate::ssrc::Ssrc;
use std::time::Instant;

/// Identifies both ends of a stream and anchors NTP time conversion
#[derive(Debug, Clone)]
pub struct RtcpSession {
    sender_ssrc: Ssrc,
    receiver_ssrc: Ssrc,
    ntp_converter: NtpTimeConverter,
}

impl RtcpSession {
    pub fn new(sender_ssrc: Ssrc, receiver_ssrc: Ssrc, start_time: Instant) -> Self {
        Self::with_converter(sender_ssrc, receiver_ssrc, NtpTimeConverter::new(start_time))
    }

    pub fn with_converter(
        sender_ssrc: Ssrc,
        receiver_ssrc: Ssrc,
        ntp_converter: NtpTimeConverter,
    ) -> Self {
        debug_assert_ne!(sender_ssrc, receiver_ssrc);
        RtcpSession {
            sender_ssrc,
            receiver_ssrc,
            ntp_converter,
        }
    }

    pub fn sender_ssrc(&self) -> Ssrc {
        self.sender_ssrc
    }

    pub fn receiver_ssrc(&self) -> Ssrc {
        self.receiver_ssrc
    }

    pub fn ntp_converter(&self) -> &NtpTimeConverter {
        &self.ntp_converter
    }
}
