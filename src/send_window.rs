use std::time::{Duration, Instant};

use crate::config::{MAX_RETRIES, WINDOW_SIZE};
use crate::packet::{seq_le, Packet};

/// One unacknowledged segment, with the bookkeeping the retransmission scan
/// needs.
struct WindowEntry {
    packet: Packet,
    sent_at: Instant,
    retries: u32,
}

/// The sliding send window: a fixed ring of up to [`WINDOW_SIZE`] in-flight
/// segments, oldest first. Acknowledged segments are retired from the front
/// (cumulative-ACK semantics), so the populated range is exactly
/// `[start, start + count) mod WINDOW_SIZE`.
pub struct SendWindow {
    entries: [Option<WindowEntry>; WINDOW_SIZE],
    start: usize,
    count: usize,
}

impl SendWindow {
    pub fn new() -> SendWindow {
        SendWindow {
            entries: std::array::from_fn(|_| None),
            start: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == WINDOW_SIZE
    }

    /// Insert a freshly transmitted segment at the back of the window.
    pub fn push(&mut self, packet: Packet, now: Instant) {
        debug_assert!(!self.is_full());
        let idx = (self.start + self.count) % WINDOW_SIZE;
        debug_assert!(self.entries[idx].is_none());
        self.entries[idx] = Some(WindowEntry {
            packet,
            sent_at: now,
            retries: 0,
        });
        self.count += 1;
    }

    /// Cumulative acknowledgment: retire every leading entry whose payload is
    /// fully covered by `ack`, stopping at the first that is not. Returns the
    /// new send base (the retired prefix's end sequence) if anything was
    /// retired; an ACK at or below the current base is a no-op.
    pub fn ack_through(&mut self, ack: u32) -> Option<u32> {
        let mut new_base = None;
        while self.count > 0 {
            let end = match &self.entries[self.start] {
                Some(entry) => entry.packet.end_seq(),
                None => break,
            };
            if !seq_le(end, ack) {
                break;
            }
            self.entries[self.start] = None;
            self.start = (self.start + 1) % WINDOW_SIZE;
            self.count -= 1;
            new_base = Some(end);
        }
        new_base
    }

    /// Scan the window for segments whose last transmission is at least `rto`
    /// old. Each one gets its retry counter bumped and its timestamp reset,
    /// and a copy is returned for the wire. A segment that is out of retries
    /// fails the scan with its sequence number.
    pub fn take_expired(&mut self, now: Instant, rto: Duration) -> Result<Vec<Packet>, u32> {
        let mut expired = Vec::new();
        for i in 0..self.count {
            let idx = (self.start + i) % WINDOW_SIZE;
            let entry = match self.entries[idx].as_mut() {
                Some(entry) => entry,
                None => continue,
            };
            if now.duration_since(entry.sent_at) < rto {
                continue;
            }
            if entry.retries >= MAX_RETRIES {
                return Err(entry.packet.header.seq);
            }
            entry.retries += 1;
            entry.sent_at = now;
            expired.push(entry.packet.clone());
        }
        Ok(expired)
    }
}
