use std::time::Duration;

use anyhow::bail;

use crate::packet::MAX_DATA_LEN;

/// Number of segments the sender may keep in flight, and equally the number
/// of out-of-order segments the receiver will stage.
pub const WINDOW_SIZE: usize = 10;

/// Per-segment retransmission timeout. Fixed; there is no RTT estimator.
pub const RTO: Duration = Duration::from_millis(500);

/// Retransmission attempts per segment before the connection is given up.
pub const MAX_RETRIES: u32 = 5;

/// Receive-buffer capacity used for flow-control accounting.
pub const DEFAULT_RECV_BUFFER_SIZE: u32 = 32 * 1024;

/// Peer window assumed until the first advertisement is observed.
pub const DEFAULT_ADVERTISED_WINDOW: u16 = 16 * 1024;

/// Per-connection tuning knobs. The protocol constants above are not
/// negotiable; these are the pieces the demonstrators configure.
#[derive(Clone, Debug)]
pub struct RudpConfig {
    /// Probability in [0, 1] of discarding each received datagram, for loss
    /// testing. Applied to ingress only; egress losses are the peer's to
    /// simulate.
    pub loss_rate: f64,

    /// Receive-buffer capacity in bytes. The advertised window is the free
    /// part of this, floored at one maximum segment.
    pub recv_buffer_size: u32,
}

impl Default for RudpConfig {
    fn default() -> RudpConfig {
        RudpConfig {
            loss_rate: 0.0,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }
}

impl RudpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.loss_rate) {
            bail!("loss rate {} is outside [0, 1]", self.loss_rate);
        }
        if self.recv_buffer_size < MAX_DATA_LEN as u32 {
            bail!("receive buffer must hold at least one segment ({} bytes)", MAX_DATA_LEN);
        }
        Ok(())
    }
}
