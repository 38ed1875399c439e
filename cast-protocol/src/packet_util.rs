//! Inbound packet routing helpers

use crate::rtcp_common::RtcpPacketType;
use crate::rtp_defines::{is_rtp_payload_type, RTP_PAYLOAD_TYPE_MASK};
use crate::ssrc::Ssrc;

/// Packet kind as judged from its first bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApparentPacketType {
    Unknown,
    Rtp,
    Rtcp,
}

/// Classify a datagram and extract the SSRC of the stream that sent it
///
/// Cheap enough to run on every inbound datagram before handing it to a
/// full parser. The SSRC is zero for `Unknown` packets.
pub fn inspect_packet_for_routing(packet: &[u8]) -> (ApparentPacketType, Ssrc) {
    if packet.len() < 2 {
        return (ApparentPacketType::Unknown, 0);
    }
    if is_rtp_payload_type(packet[1] & RTP_PAYLOAD_TYPE_MASK) {
        if packet.len() >= 12 {
            return (ApparentPacketType::Rtp, read_ssrc(&packet[8..12]));
        }
    } else if RtcpPacketType::from_u8(packet[1]).is_some() && packet.len() >= 8 {
        return (ApparentPacketType::Rtcp, read_ssrc(&packet[4..8]));
    }
    (ApparentPacketType::Unknown, 0)
}

fn read_ssrc(bytes: &[u8]) -> Ssrc {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
