//! RTCP Common Structures
//!
//! Wire-format primitives shared by the compound feedback builder/parser and
//! the sender report builder/parser: the 4-byte common header, the 24-byte
//! report block, and the sender report payload.

use crate::ntp_time::NtpTimestamp;
use crate::rtp_time::{RtpTimeDelta, RtpTimeTicks};
use crate::ssrc::Ssrc;
use bytes::{Buf, BufMut};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

pub const RTCP_COMMON_HEADER_SIZE: usize = 4;
pub const RTCP_REPORT_BLOCK_SIZE: usize = 24;
/// Reporter SSRC preceding the report blocks of an RR
pub const RTCP_RECEIVER_REPORT_SIZE: usize = 4;
/// Reporter SSRC, NTP time, RTP time and the two counters of an SR
pub const RTCP_SENDER_REPORT_SIZE: usize = 24;

/// Reporter SSRC preceding the blocks of an XR packet
pub const RTCP_EXTENDED_REPORT_HEADER_SIZE: usize = 4;
pub const RTCP_EXTENDED_REPORT_BLOCK_HEADER_SIZE: usize = 4;
pub const RTCP_RECEIVER_REFERENCE_TIME_REPORT_BLOCK_TYPE: u8 = 4;
pub const RTCP_RECEIVER_REFERENCE_TIME_REPORT_BLOCK_SIZE: usize = 8;

/// Receiver SSRC and sender SSRC of a payload-specific feedback packet
pub const RTCP_PICTURE_LOSS_INDICATOR_HEADER_SIZE: usize = 8;

/// "CAST"
pub const RTCP_CAST_IDENTIFIER_WORD: u32 = 0x4341_5354;
/// Both SSRCs, the identifier word, checkpoint, loss count and delay
pub const RTCP_FEEDBACK_HEADER_SIZE: usize = 16;
pub const RTCP_FEEDBACK_LOSS_FIELD_SIZE: usize = 4;
pub const RTCP_MAX_FEEDBACK_LOSS_FIELDS: usize = u8::MAX as usize;

/// "CST2", introduces the ACK bit vector extension of a feedback packet
pub const RTCP_CST2_IDENTIFIER_WORD: u32 = 0x4353_5432;
/// Identifier word, feedback count and bit vector octet count
pub const RTCP_FEEDBACK_ACK_HEADER_SIZE: usize = 6;
pub const RTCP_MIN_ACK_BIT_VECTOR_OCTETS: usize = 2;
pub const RTCP_MAX_ACK_BIT_VECTOR_OCTETS: usize = 254;

/// Version 2, no padding
const RTCP_REQUIRED_VERSION_AND_PADDING_BITS: u8 = 0b100;
const RTCP_ITEM_COUNT_FIELD_NUM_BITS: u32 = 5;
const RTCP_ITEM_COUNT_MASK: u8 = (1 << RTCP_ITEM_COUNT_FIELD_NUM_BITS) - 1;
const RTCP_CUMULATIVE_PACKETS_FIELD_NUM_BITS: u32 = 24;
const RTCP_CUMULATIVE_PACKETS_MASK: u32 = (1 << RTCP_CUMULATIVE_PACKETS_FIELD_NUM_BITS) - 1;

/// Units of the report block delay field per second
const DELAY_UNITS_PER_SECOND: u128 = 65_536;
const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// RTCP packet types (RFC 3550, RFC 4585, RFC 3611)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RtcpPacketType {
    SenderReport = 200,
    ReceiverReport = 201,
    SourceDescription = 202,
    Goodbye = 203,
    ApplicationDefined = 204,
    TransportSpecific = 205,
    PayloadSpecific = 206,
    ExtendedReports = 207,
}

impl RtcpPacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            200 => Some(RtcpPacketType::SenderReport),
            201 => Some(RtcpPacketType::ReceiverReport),
            202 => Some(RtcpPacketType::SourceDescription),
            203 => Some(RtcpPacketType::Goodbye),
            204 => Some(RtcpPacketType::ApplicationDefined),
            205 => Some(RtcpPacketType::TransportSpecific),
            206 => Some(RtcpPacketType::PayloadSpecific),
            207 => Some(RtcpPacketType::ExtendedReports),
            _ => None,
        }
    }
}

/// Subtypes carried in the item-count field of APP and PSFB packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RtcpSubtype {
    PictureLossIndicator = 1,
    ReceiverLog = 2,
    Feedback = 15,
}

impl RtcpSubtype {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RtcpSubtype::PictureLossIndicator),
            2 => Some(RtcpSubtype::ReceiverLog),
            15 => Some(RtcpSubtype::Feedback),
            _ => None,
        }
    }
}

/// RTCP parse errors
///
/// Any of these means the compound packet is structurally corrupt and is
/// dropped whole.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtcpParseError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Invalid version bits in first byte {0:#04x}")]
    InvalidVersion(u8),

    #[error("Unknown RTCP packet type: {0}")]
    UnknownPacketType(u8),

    #[error("Malformed {0} block")]
    MalformedBlock(&'static str),

    #[error("Bad identifier word: {0:#010x}")]
    BadIdentifier(u32),
}

/// First four bytes of every RTCP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpCommonHeader {
    pub packet_type: RtcpPacketType,
    /// Report count for SR/RR, subtype for APP/PSFB, zero otherwise
    pub item_count_or_subtype: u8,
    /// Payload size in bytes, excluding this header; a multiple of 4
    pub payload_size: usize,
}

impl RtcpCommonHeader {
    pub fn new(packet_type: RtcpPacketType, item_count_or_subtype: u8, payload_size: usize) -> Self {
        debug_assert!(item_count_or_subtype <= RTCP_ITEM_COUNT_MASK);
        debug_assert_eq!(payload_size % 4, 0);
        RtcpCommonHeader {
            packet_type,
            item_count_or_subtype,
            payload_size,
        }
    }

    pub fn with_subtype(packet_type: RtcpPacketType, subtype: RtcpSubtype, payload_size: usize) -> Self {
        Self::new(packet_type, subtype as u8, payload_size)
    }

    /// Report count, meaningful for SR/RR packets
    pub fn item_count(&self) -> usize {
        match self.packet_type {
            RtcpPacketType::SenderReport | RtcpPacketType::ReceiverReport => {
                self.item_count_or_subtype as usize
            }
            _ => 0,
        }
    }

    /// Subtype, meaningful for APP/PSFB packets
    pub fn subtype(&self) -> Option<RtcpSubtype> {
        match self.packet_type {
            RtcpPacketType::ApplicationDefined | RtcpPacketType::PayloadSpecific => {
                RtcpSubtype::from_u8(self.item_count_or_subtype)
            }
            _ => None,
        }
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u8(
            (RTCP_REQUIRED_VERSION_AND_PADDING_BITS << RTCP_ITEM_COUNT_FIELD_NUM_BITS)
                | (self.item_count_or_subtype & RTCP_ITEM_COUNT_MASK),
        );
        buf.put_u8(self.packet_type as u8);
        buf.put_u16((self.payload_size / 4) as u16);
    }

    /// Parse a header from the front of `buf`, advancing past it
    pub fn parse(buf: &mut &[u8]) -> Result<Self, RtcpParseError> {
        if buf.remaining() < RTCP_COMMON_HEADER_SIZE {
            return Err(RtcpParseError::InsufficientData {
                expected: RTCP_COMMON_HEADER_SIZE,
                actual: buf.remaining(),
            });
        }
        let byte0 = buf.get_u8();
        if byte0 >> RTCP_ITEM_COUNT_FIELD_NUM_BITS != RTCP_REQUIRED_VERSION_AND_PADDING_BITS {
            return Err(RtcpParseError::InvalidVersion(byte0));
        }
        let raw_type = buf.get_u8();
        let packet_type =
            RtcpPacketType::from_u8(raw_type).ok_or(RtcpParseError::UnknownPacketType(raw_type))?;
        let payload_size = buf.get_u16() as usize * 4;
        Ok(RtcpCommonHeader {
            packet_type,
            item_count_or_subtype: byte0 & RTCP_ITEM_COUNT_MASK,
            payload_size,
        })
    }
}

/// Whether `value` falls in the block of packet type numbers reserved for RTCP
pub fn is_rtcp_packet_type_number(value: u8) -> bool {
    (192..=223).contains(&value)
}

/// Split the next RTCP packet off the front of a compound packet
///
/// Returns the header and payload of the next packet of a known type,
/// advancing `buf` past both. Packets carrying any other RTCP type number are
/// skipped by their length field. Returns `None` once `buf` is used up.
pub fn next_rtcp_packet<'a>(
    buf: &mut &'a [u8],
) -> Result<Option<(RtcpCommonHeader, &'a [u8])>, RtcpParseError> {
    while buf.len() >= RTCP_COMMON_HEADER_SIZE
        && RtcpPacketType::from_u8(buf[1]).is_none()
        && is_rtcp_packet_type_number(buf[1])
    {
        if buf[0] >> RTCP_ITEM_COUNT_FIELD_NUM_BITS != RTCP_REQUIRED_VERSION_AND_PADDING_BITS {
            return Err(RtcpParseError::InvalidVersion(buf[0]));
        }
        let packet_type = buf[1];
        let payload_size = u16::from_be_bytes([buf[2], buf[3]]) as usize * 4;
        buf.advance(RTCP_COMMON_HEADER_SIZE);
        split_payload(buf, payload_size)?;
        trace!(packet_type, payload_size, "skipping unhandled RTCP packet");
    }
    if buf.is_empty() {
        return Ok(None);
    }
    let header = RtcpCommonHeader::parse(buf)?;
    let payload = split_payload(buf, header.payload_size)?;
    Ok(Some((header, payload)))
}

fn split_payload<'a>(buf: &mut &'a [u8], size: usize) -> Result<&'a [u8], RtcpParseError> {
    if buf.len() < size {
        return Err(RtcpParseError::InsufficientData {
            expected: size,
            actual: buf.len(),
        });
    }
    let (payload, rest) = buf.split_at(size);
    *buf = rest;
    Ok(payload)
}

/// Middle 32 bits of an NTP timestamp, identifying one sender report
pub type StatusReportId = u32;

pub fn to_status_report_id(ntp_timestamp: NtpTimestamp) -> StatusReportId {
    (ntp_timestamp >> 16) as u32
}

/// Reception statistics about one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpReportBlock {
    pub recipient_ssrc: Ssrc,
    /// Fraction of packets lost since the previous report, in 1/256 units
    pub packet_fraction_lost: u8,
    /// 24-bit count of packets lost since the start of the stream
    pub cumulative_packets_lost: u32,
    pub extended_high_sequence_number: u32,
    pub jitter: RtpTimeDelta,
    /// Id of the last sender report received, zero if none
    pub last_status_report_id: StatusReportId,
    /// Time between receiving that sender report and sending this block
    pub delay_since_last_report: Duration,
}

impl RtcpReportBlock {
    pub fn new(recipient_ssrc: Ssrc) -> Self {
        RtcpReportBlock {
            recipient_ssrc,
            packet_fraction_lost: 0,
            cumulative_packets_lost: 0,
            extended_high_sequence_number: 0,
            jitter: RtpTimeDelta::default(),
            last_status_report_id: 0,
            delay_since_last_report: Duration::ZERO,
        }
    }

    /// Set the loss fields from raw counts
    pub fn set_packet_fraction_lost(&mut self, num_lost: i64, num_expected: i64) {
        self.packet_fraction_lost = if num_expected <= 0 || num_lost <= 0 {
            0
        } else if num_lost >= num_expected {
            u8::MAX
        } else {
            ((num_lost * 256) / num_expected).min(u8::MAX as i64) as u8
        };
    }

    pub fn set_cumulative_packets_lost(&mut self, num_lost: i64) {
        self.cumulative_packets_lost = num_lost.clamp(0, RTCP_CUMULATIVE_PACKETS_MASK as i64) as u32;
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.recipient_ssrc);
        buf.put_u32(
            ((self.packet_fraction_lost as u32) << RTCP_CUMULATIVE_PACKETS_FIELD_NUM_BITS)
                | (self.cumulative_packets_lost & RTCP_CUMULATIVE_PACKETS_MASK),
        );
        buf.put_u32(self.extended_high_sequence_number);
        buf.put_u32(self.jitter.ticks().clamp(0, u32::MAX as i64) as u32);
        buf.put_u32(self.last_status_report_id);
        let delay = self.delay_since_last_report.as_nanos() * DELAY_UNITS_PER_SECOND / NANOS_PER_SECOND;
        buf.put_u32(delay.min(u32::MAX as u128) as u32);
    }

    /// Find the block addressed to `recipient_ssrc` among `num_blocks` blocks
    ///
    /// Errors if `buf` is too short for `num_blocks`; returns `None` if no
    /// block names the recipient.
    pub fn parse_one(
        mut buf: &[u8],
        num_blocks: usize,
        recipient_ssrc: Ssrc,
    ) -> Result<Option<Self>, RtcpParseError> {
        let expected = RTCP_REPORT_BLOCK_SIZE * num_blocks;
        if buf.len() < expected {
            return Err(RtcpParseError::InsufficientData {
                expected,
                actual: buf.len(),
            });
        }
        let mut result = None;
        for _ in 0..num_blocks {
            if buf.get_u32() != recipient_ssrc {
                buf.advance(RTCP_REPORT_BLOCK_SIZE - 4);
                continue;
            }
            let loss_word = buf.get_u32();
            let extended_high_sequence_number = buf.get_u32();
            let jitter = RtpTimeDelta::from_ticks(buf.get_u32() as i64);
            let last_status_report_id = buf.get_u32();
            let delay_units = buf.get_u32() as u128;
            result = Some(RtcpReportBlock {
                recipient_ssrc,
                packet_fraction_lost: (loss_word >> RTCP_CUMULATIVE_PACKETS_FIELD_NUM_BITS) as u8,
                cumulative_packets_lost: loss_word & RTCP_CUMULATIVE_PACKETS_MASK,
                extended_high_sequence_number,
                jitter,
                last_status_report_id,
                delay_since_last_report: Duration::from_nanos(
                    (delay_units * NANOS_PER_SECOND / DELAY_UNITS_PER_SECOND) as u64,
                ),
            });
        }
        Ok(result)
    }
}

/// Lip-sync pairing of a reference time and an RTP timestamp, plus the
/// sender's running counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpSenderReport {
    pub reference_time: Instant,
    pub rtp_timestamp: RtpTimeTicks,
    pub send_packet_count: u32,
    pub send_octet_count: u32,
    pub report_block: Option<RtcpReportBlock>,
}
