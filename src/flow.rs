use tracing::trace;

use crate::config::DEFAULT_ADVERTISED_WINDOW;
use crate::packet::MAX_DATA_LEN;

/// Receive-buffer accounting on the inbound side and the in-flight budget on
/// the outbound side. All stream counters are in sequence-number units.
pub struct FlowControl {
    recv_buffer_size: u32,
    recv_buffer_used: u32,

    /// Most recent window advertisement observed from the peer, in bytes.
    peer_window: u32,

    last_byte_sent: u32,
    last_byte_acked: u32,

    /// Advertised value at the time of the last "window update" event, used
    /// to suppress events for small movements.
    last_reported_window: u16,
}

impl FlowControl {
    pub fn new(recv_buffer_size: u32, initial_seq: u32) -> FlowControl {
        FlowControl {
            recv_buffer_size,
            recv_buffer_used: 0,
            peer_window: DEFAULT_ADVERTISED_WINDOW as u32,
            last_byte_sent: initial_seq,
            last_byte_acked: initial_seq,
            last_reported_window: 0,
        }
    }

    /// The window to advertise on an outgoing segment: free buffer space,
    /// floored at one maximum segment. The floor is mandatory - there is no
    /// window-probe mechanism, so a zero advertisement would deadlock the
    /// peer.
    ///
    /// The second component is a "window update" observability event, present
    /// when the advertisement moved by more than one segment since the last
    /// reported value.
    pub fn advertise(&mut self) -> (u16, Option<u16>) {
        let free = self.recv_buffer_size.saturating_sub(self.recv_buffer_used);
        let window = free.clamp(MAX_DATA_LEN as u32, u16::MAX as u32) as u16;

        let update = if self.last_reported_window.abs_diff(window) as usize > MAX_DATA_LEN {
            self.last_reported_window = window;
            Some(window)
        } else {
            None
        };
        (window, update)
    }

    /// Charge an arriving segment to the receive buffer.
    pub fn charge(&mut self, len: u32) {
        self.recv_buffer_used = self
            .recv_buffer_used
            .saturating_add(len)
            .min(self.recv_buffer_size);
        trace!(
            "receive buffer: {}/{} used",
            self.recv_buffer_used,
            self.recv_buffer_size
        );
    }

    /// Release bytes that were handed to the application. Never underflows.
    pub fn discharge(&mut self, len: u32) {
        self.recv_buffer_used = self.recv_buffer_used.saturating_sub(len);
        trace!(
            "receive buffer: {}/{} used",
            self.recv_buffer_used,
            self.recv_buffer_size
        );
    }

    /// Re-anchor the stream counters once the handshake fixed the first data
    /// sequence number.
    pub fn align(&mut self, seq: u32) {
        self.last_byte_sent = seq;
        self.last_byte_acked = seq;
    }

    pub fn on_bytes_sent(&mut self, len: u32) {
        self.last_byte_sent = self.last_byte_sent.wrapping_add(len);
    }

    /// Record a cumulative acknowledgment and the window advertised with it.
    /// The acked counter only ever moves forward, so stale ACKs are no-ops.
    pub fn on_ack(&mut self, ack: u32, peer_window: u16) {
        self.update_peer_window(peer_window);
        if crate::packet::seq_lt(self.last_byte_acked, ack) {
            self.last_byte_acked = ack;
        }
    }

    pub fn update_peer_window(&mut self, peer_window: u16) {
        self.peer_window = peer_window as u32;
    }

    pub fn peer_window(&self) -> u32 {
        self.peer_window
    }

    /// Bytes sent but not yet cumulatively acknowledged. Clamped at zero in
    /// case reordered ACKs pushed the acked counter past the sent counter.
    pub fn bytes_in_flight(&self) -> u32 {
        let delta = self.last_byte_sent.wrapping_sub(self.last_byte_acked) as i32;
        delta.max(0) as u32
    }

    /// The sender-side gate: a segment of `len` bytes may go out only if it
    /// fits into the peer's advertised window next to what is already in
    /// flight.
    pub fn may_send(&self, len: usize) -> bool {
        len as u32 <= self.peer_window.saturating_sub(self.bytes_in_flight())
    }
}
