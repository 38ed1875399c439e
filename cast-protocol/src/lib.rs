//! Cast Streaming Protocol Core
//!
//! This crate implements the sans-I/O core of Cast Streaming frame transport:
//! per-frame encryption, RTP packetization and reassembly, compound RTCP
//! construction and parsing, sender reports, and bandwidth estimation.
//! Nothing here touches a socket or a clock; callers pass in time and bytes.

pub mod bandwidth_estimator;
pub mod compound_rtcp_builder;
pub mod compound_rtcp_parser;
pub mod encoded_frame;
pub mod expand;
pub mod frame_collector;
pub mod frame_crypto;
pub mod frame_id;
pub mod ntp_time;
pub mod packet_util;
pub mod rtcp_common;
pub mod rtcp_session;
pub mod rtp_defines;
pub mod rtp_packetizer;
pub mod rtp_parser;
pub mod rtp_time;
pub mod sender_report;
pub mod ssrc;

pub use bandwidth_estimator::BandwidthEstimator;
pub use compound_rtcp_builder::{CompoundRtcpBuilder, RTCP_REQUIRED_BUFFER_SIZE};
pub use compound_rtcp_parser::{CompoundRtcpParser, CompoundRtcpParserClient, RtcpFeedback};
pub use encoded_frame::{Dependency, EncodedFrame, EncryptedFrame, PacketId, PacketNack, ALL_PACKETS_LOST};
pub use frame_collector::FrameCollector;
pub use frame_crypto::FrameCrypto;
pub use frame_id::FrameId;
pub use ntp_time::{NtpTimeConverter, NtpTimestamp};
pub use packet_util::{inspect_packet_for_routing, ApparentPacketType};
pub use rtcp_common::{RtcpParseError, RtcpReportBlock, RtcpSenderReport, StatusReportId};
pub use rtcp_session::RtcpSession;
pub use rtp_defines::{PacketError, RtpPayloadType, MAX_RTP_PACKET_SIZE};
pub use rtp_packetizer::RtpPacketizer;
pub use rtp_parser::{ParsedRtpPacket, RtpPacketParser};
pub use rtp_time::{RtpTimeDelta, RtpTimeTicks};
pub use sender_report::{ParsedSenderReport, SenderReportBuilder, SenderReportParser};
pub use ssrc::Ssrc;
