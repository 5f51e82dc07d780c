use std::collections::BTreeMap;

use crate::config::WINDOW_SIZE;
use crate::packet::Packet;

/// Staging area for segments that arrive ahead of the in-order cursor, keyed
/// by sequence number. Capacity matches the send window: the peer can have at
/// most [`WINDOW_SIZE`] segments in flight, so more slots would never fill.
pub struct ReassemblyBuffer {
    segments: BTreeMap<u32, Packet>,
}

impl ReassemblyBuffer {
    pub fn new() -> ReassemblyBuffer {
        ReassemblyBuffer {
            segments: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Stage a segment. Returns false when every slot is taken - the segment
    /// is discarded and the peer's retransmission has to deliver it again. A
    /// duplicate of an already-staged segment replaces it instead of taking a
    /// second slot.
    pub fn insert(&mut self, packet: Packet) -> bool {
        if self.segments.len() >= WINDOW_SIZE && !self.segments.contains_key(&packet.header.seq) {
            return false;
        }
        self.segments.insert(packet.header.seq, packet);
        true
    }

    /// Remove and return the segment starting exactly at `seq`, if staged.
    pub fn take(&mut self, seq: u32) -> Option<Packet> {
        self.segments.remove(&seq)
    }
}
