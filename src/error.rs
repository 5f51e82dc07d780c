use std::io;
use thiserror::Error;

use crate::connection::State;

pub type Result<T> = std::result::Result<T, RudpError>;

/// Error kinds produced by the protocol engine.
///
/// Transient conditions (`Timeout`, `Dropped`, `Malformed`, `Oversize`) are
/// absorbed by the engine's receive loops and drive retransmission; callers
/// only ever see `WrongState`, `HandshakeFailed`, `Unrecoverable`,
/// `ResolveFailed` and fatal `Io` errors.
#[derive(Debug, Error)]
pub enum RudpError {
    #[error("operation not allowed in state {0:?}")]
    WrongState(State),

    #[error("handshake failed: {0}")]
    HandshakeFailed(&'static str),

    /// Datagram shorter than a packet header.
    #[error("malformed datagram")]
    Malformed,

    /// Datagram payload longer than the maximum segment size.
    #[error("oversize datagram payload of {0} bytes")]
    Oversize(usize),

    /// Ingress loss simulation discarded the datagram. Equivalent to no
    /// packet having arrived.
    #[error("datagram discarded by loss simulation")]
    Dropped,

    #[error("timed wait elapsed")]
    Timeout,

    /// A segment exceeded its retransmission budget; the connection is dead.
    #[error("segment {seq} exceeded the retransmission limit")]
    Unrecoverable { seq: u32 },

    #[error("could not resolve host {0:?}")]
    ResolveFailed(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RudpError {
    pub(crate) fn is_transient(&self) -> bool {
        matches!(
            self,
            RudpError::Timeout | RudpError::Dropped | RudpError::Malformed | RudpError::Oversize(_)
        )
    }
}
