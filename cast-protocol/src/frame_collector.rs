//! Frame Collector
//!
//! Reassembles the packets of one frame. Payloads are appended to a staging
//! buffer in arrival order; they are put back into packet-id order only when
//! the assembled frame is first requested, and only if they arrived out of
//! order.

use crate::encoded_frame::{
    Dependency, EncodedFrame, EncryptedFrame, PacketId, PacketNack, ALL_PACKETS_LOST,
};
use crate::frame_id::FrameId;
use crate::rtp_parser::ParsedRtpPacket;
use crate::rtp_time::RtpTimeTicks;
use bytes::Bytes;
use std::time::Duration;
use tracing::warn;

/// Location of one packet's payload within the staging buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DataChunk {
    offset: usize,
    len: usize,
}

#[derive(Debug, Default)]
pub struct FrameCollector {
    frame_id: Option<FrameId>,
    dependency: Option<Dependency>,
    referenced_frame_id: FrameId,
    rtp_timestamp: RtpTimeTicks,
    new_playout_delay: Option<Duration>,
    /// One entry per packet once the packet count is known
    chunks: Vec<Option<DataChunk>>,
    num_missing_packets: Option<usize>,
    staging: Vec<u8>,
    assembled: Option<EncryptedFrame>,
}

impl FrameCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame currently being collected, `None` after `reset`
    pub fn frame_id(&self) -> Option<FrameId> {
        self.frame_id
    }

    pub fn set_frame_id(&mut self, frame_id: FrameId) {
        debug_assert!(self.frame_id.is_none(), "collector must be reset first");
        self.frame_id = Some(frame_id);
    }

    /// Add one packet to the frame
    ///
    /// Returns false, changing nothing, if the packet does not belong to this
    /// frame. Duplicates are accepted and ignored.
    pub fn collect_part(&mut self, part: &ParsedRtpPacket<'_>) -> bool {
        let header = &part.header;
        let frame_id = match self.frame_id {
            Some(id) => id,
            None => return false,
        };
        let packet_count = header.max_packet_id as usize + 1;
        if header.frame_id != frame_id {
            warn!(expected = %frame_id, got = %header.frame_id, "ignoring packet with frame id mismatch");
            return false;
        }
        match self.num_missing_packets {
            None => {
                self.num_missing_packets = Some(packet_count);
                self.chunks = vec![None; packet_count];
            }
            Some(_) if packet_count != self.chunks.len() => {
                warn!(
                    frame_id = %frame_id,
                    expected = self.chunks.len(),
                    got = packet_count,
                    "ignoring packet with packet count mismatch"
                );
                return false;
            }
            Some(_) => {}
        }

        let index = header.packet_id as usize;
        if index >= self.chunks.len() {
            return false;
        }
        if self.chunks[index].is_some() {
            return true;
        }

        if header.packet_id == 0 {
            self.dependency = Some(if header.is_key_frame {
                Dependency::Key
            } else if header.frame_id == header.referenced_frame_id {
                Dependency::Independent
            } else {
                Dependency::Dependent
            });
            self.referenced_frame_id = header.referenced_frame_id;
            self.rtp_timestamp = header.rtp_timestamp;
            self.new_playout_delay = header.new_playout_delay;
        }

        self.chunks[index] = Some(DataChunk {
            offset: self.staging.len(),
            len: part.payload.len(),
        });
        self.staging.extend_from_slice(part.payload);
        if let Some(missing) = self.num_missing_packets.as_mut() {
            *missing -= 1;
        }
        true
    }

    pub fn has_all_parts(&self) -> bool {
        self.num_missing_packets == Some(0)
    }

    /// Append NACKs for every packet not yet collected
    pub fn append_missing_packets(&self, nacks: &mut Vec<PacketNack>) {
        let frame_id = match self.frame_id {
            Some(id) => id,
            None => return,
        };
        match self.num_missing_packets {
            Some(0) => {}
            Some(missing) if missing < self.chunks.len() => {
                nacks.extend(
                    self.chunks
                        .iter()
                        .enumerate()
                        .filter(|(_, chunk)| chunk.is_none())
                        .map(|(packet_id, _)| PacketNack::new(frame_id, packet_id as PacketId)),
                );
            }
            _ => nacks.push(PacketNack::new(frame_id, ALL_PACKETS_LOST)),
        }
    }

    /// The reassembled frame, once every part has been collected
    pub fn peek_at_assembled_frame(&mut self) -> Option<&EncryptedFrame> {
        if !self.has_all_parts() {
            return None;
        }
        if self.assembled.is_none() {
            let frame_id = self.frame_id?;
            let chunks: Vec<DataChunk> = self.chunks.iter().flatten().copied().collect();
            let in_order = chunks.windows(2).all(|w| w[0] <= w[1]);
            let data = if in_order {
                std::mem::take(&mut self.staging)
            } else {
                let mut data = Vec::with_capacity(self.staging.len());
                for chunk in &chunks {
                    data.extend_from_slice(&self.staging[chunk.offset..chunk.offset + chunk.len]);
                }
                self.staging = Vec::new();
                data
            };
            self.assembled = Some(EncryptedFrame::from_encrypted_parts(EncodedFrame {
                dependency: self.dependency.unwrap_or(Dependency::Dependent),
                frame_id,
                referenced_frame_id: self.referenced_frame_id,
                rtp_timestamp: self.rtp_timestamp,
                reference_time: None,
                new_playout_delay: self.new_playout_delay,
                data: Bytes::from(data),
            }));
        }
        self.assembled.as_ref()
    }

    /// Forget the current frame and release its storage
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
