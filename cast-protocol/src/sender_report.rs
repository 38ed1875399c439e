//! Sender Reports
//!
//! A sender periodically pairs a reference (wall-clock) time with the RTP
//! timestamp of the same instant, letting the receiver synchronize streams.
//! The receiver echoes the report's id and the time it held the report back
//! in its next report block, from which the sender derives round-trip time.

use crate::ntp_time::NtpTimestamp;
use crate::rtcp_common::*;
use crate::rtcp_session::RtcpSession;
use crate::rtp_time::RtpTimeTicks;
use bytes::{Buf, BufMut};

#[derive(Debug)]
pub struct SenderReportBuilder {
    session: RtcpSession,
}

impl SenderReportBuilder {
    pub fn new(session: RtcpSession) -> Self {
        SenderReportBuilder { session }
    }

    pub fn session(&self) -> &RtcpSession {
        &self.session
    }

    /// Serialize `report` into `buffer`
    ///
    /// Returns the packet length and the id the receiver will echo back, or
    /// `None` if `buffer` is too small.
    pub fn build_packet(
        &self,
        report: &RtcpSenderReport,
        buffer: &mut [u8],
    ) -> Option<(usize, StatusReportId)> {
        let payload_size = RTCP_SENDER_REPORT_SIZE
            + report
                .report_block
                .as_ref()
                .map_or(0, |_| RTCP_REPORT_BLOCK_SIZE);
        let packet_size = RTCP_COMMON_HEADER_SIZE + payload_size;
        if buffer.len() < packet_size {
            return None;
        }

        let ntp_timestamp = self
            .session
            .ntp_converter()
            .to_ntp_timestamp(report.reference_time);
        let mut out = &mut buffer[..packet_size];
        RtcpCommonHeader::new(
            RtcpPacketType::SenderReport,
            report.report_block.is_some() as u8,
            payload_size,
        )
        .serialize(&mut out);
        out.put_u32(self.session.sender_ssrc());
        out.put_u64(ntp_timestamp);
        out.put_u32(report.rtp_timestamp.lower_32_bits());
        out.put_u32(report.send_packet_count);
        out.put_u32(report.send_octet_count);
        if let Some(block) = &report.report_block {
            block.serialize(&mut out);
        }
        Some((packet_size, to_status_report_id(ntp_timestamp)))
    }

    /// Id a report with this reference time would carry
    pub fn status_report_id(&self, report: &RtcpSenderReport) -> StatusReportId {
        to_status_report_id(
            self.session
                .ntp_converter()
                .to_ntp_timestamp(report.reference_time),
        )
    }
}

/// A sender report as seen by the receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSenderReport {
    pub report: RtcpSenderReport,
    pub report_id: StatusReportId,
}

#[derive(Debug)]
pub struct SenderReportParser {
    session: RtcpSession,
    last_parsed_rtp_timestamp: RtpTimeTicks,
}

impl SenderReportParser {
    pub fn new(session: RtcpSession) -> Self {
        SenderReportParser {
            session,
            last_parsed_rtp_timestamp: RtpTimeTicks::default(),
        }
    }

    /// Find the sender report from our sender in a compound packet
    ///
    /// Returns `Ok(None)` if the packet is well-formed but carries none.
    pub fn parse(&mut self, packet: &[u8]) -> Result<Option<ParsedSenderReport>, RtcpParseError> {
        let mut result = None;
        let mut buf = packet;
        while let Some((header, mut payload)) = next_rtcp_packet(&mut buf)? {
            if header.packet_type != RtcpPacketType::SenderReport {
                continue;
            }
            if payload.len() < RTCP_SENDER_REPORT_SIZE {
                return Err(RtcpParseError::MalformedBlock("sender report"));
            }
            if payload.get_u32() != self.session.sender_ssrc() {
                continue;
            }
            let ntp_timestamp: NtpTimestamp = payload.get_u64();
            let rtp_timestamp = self.last_parsed_rtp_timestamp.expand(payload.get_u32());
            let send_packet_count = payload.get_u32();
            let send_octet_count = payload.get_u32();
            let report_block =
                RtcpReportBlock::parse_one(payload, header.item_count(), self.session.receiver_ssrc())?;
            result = Some(ParsedSenderReport {
                report: RtcpSenderReport {
                    reference_time: self.session.ntp_converter().to_local_time(ntp_timestamp),
                    rtp_timestamp,
                    send_packet_count,
                    send_octet_count,
                    report_block,
                },
                report_id: to_status_report_id(ntp_timestamp),
            });
        }
        if let Some(parsed) = &result {
            self.last_parsed_rtp_timestamp = parsed.report.rtp_timestamp;
        }
        Ok(result)
    }
}
