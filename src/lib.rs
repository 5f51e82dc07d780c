//! A reliable, connection-oriented, bidirectional byte-stream transport
//! layered over UDP. The underlying datagram channel may reorder, duplicate,
//! or drop packets; a connection presents an ordered, loss-free stream.
//!
//! ## Design
//!
//! * Connection-oriented with a TCP-style three-way open handshake and a
//!   simplified four-way close. One UDP endpoint per connection; a listener
//!   shares its endpoint with the connection it accepts, so it serves one
//!   peer at a time.
//! * The abstraction is a byte *stream*: [`Connection::send`] chunks into
//!   segments of up to one MSS (1024 bytes), [`Connection::recv`] delivers
//!   bytes strictly in sender order.
//! * Reliability through a sliding send window of up to 10 in-flight
//!   segments, each with its own retransmission timer (RTO 500 ms, at most
//!   5 retries) against cumulative acknowledgments. The receiver stages
//!   out-of-order arrivals and pulls them forward once the gap fills.
//! * Flow control through a window advertised on every outgoing segment:
//!   the free share of the receive buffer, floored at one MSS so a stalled
//!   receiver can never advertise the deadlock-prone zero window. The sender
//!   keeps `bytes in flight <= peer window`.
//! * A connection is exclusively owned and single-threaded; all progress,
//!   timers included, happens during `send`/`recv` calls. Run each
//!   connection on its own task for concurrency.
//! * Ingress loss simulation for testing: each received datagram is dropped
//!   with the configured probability, observable in the wire trace.
//!
//! Congestion control, selective acknowledgments, and cryptography are out
//! of scope.
//!
//! ## Wire format
//!
//! Every datagram is a 12-byte header followed by up to 1024 payload bytes,
//! all numbers in network byte order (BE):
//!
//! ```ascii
//! 0:  seq    (u32): stream offset of the first payload byte; SYN and FIN
//!             consume one sequence number
//! 4:  ack    (u32): cumulative - every byte below this arrived in order
//! 8:  flags  (u16): SYN=0x1 ACK=0x2 FIN=0x4, other bits zero
//! 10: window (u16): advertised receive window in bytes
//! 12: payload
//! ```
//!
//! ## Observability
//!
//! Diagnostics go through `tracing`. Separately, `RUDP_LOG=1` writes a
//! wire-event trace (`SND DATA SEQ=.. LEN=..`, `RETX DATA ..`,
//! `DROP DATA ..`, `FLOW WIN UPDATE=..`) to `client_log.txt` /
//! `server_log.txt` for external assertion harnesses.

mod channel;
pub mod config;
pub mod connection;
pub mod error;
mod event_log;
pub mod file_transfer;
mod flow;
pub mod packet;
mod reassembly;
mod send_window;

pub use config::RudpConfig;
pub use connection::{Connection, Listener, State};
pub use error::{Result, RudpError};
