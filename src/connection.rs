use std::cmp::min;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::RngCore;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, trace, warn};

use crate::channel::{DatagramChannel, Wait};
use crate::config::{RudpConfig, MAX_RETRIES, RTO};
use crate::error::RudpError;
use crate::event_log::EventLog;
use crate::flow::FlowControl;
use crate::packet::{self, Packet, MAX_DATA_LEN};
use crate::reassembly::ReassemblyBuffer;
use crate::send_window::SendWindow;

/// Brief yield while the send window is at capacity.
const WINDOW_FULL_YIELD: Duration = Duration::from_millis(1);

/// Longer yield while the peer's advertised window is exhausted.
const FLOW_BLOCKED_YIELD: Duration = Duration::from_millis(10);

/// Connection states. The full TCP-style set is tracked; the paths this
/// implementation drives are CLOSED -> SYN_SENT / SYN_RECEIVED -> ESTABLISHED
/// -> FIN_WAIT_1 -> FIN_WAIT_2 -> CLOSED and the symmetric responder path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// A bound endpoint waiting for peers. Accepted connections share the
/// listener's socket, so only one peer can be served at a time.
pub struct Listener {
    channel: DatagramChannel,
    config: RudpConfig,
    events: EventLog,
}

impl Listener {
    /// Bind a UDP endpoint and enter LISTEN. Port 0 picks an ephemeral port;
    /// see [`Listener::local_addr`].
    pub async fn bind(port: u16, config: RudpConfig) -> crate::Result<Listener> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        info!("listening on {:?}", socket.local_addr()?);

        let events = EventLog::for_role("server");
        let channel = DatagramChannel::new(Arc::new(socket), None, config.loss_rate, events.clone());
        Ok(Listener {
            channel,
            config,
            events,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.channel.local_addr()
    }

    /// Wait for a SYN and drive the responder side of the three-way
    /// handshake. Half-open attempts (missing or invalid final ACK) are
    /// discarded and the wait continues; only a dead socket fails the accept.
    pub async fn accept(&mut self) -> crate::Result<Connection> {
        loop {
            if self.channel.is_dead() {
                return Err(RudpError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "listening socket failed",
                )));
            }

            // each accept adopts a fresh peer from the next SYN's source
            self.channel.clear_peer();
            let syn = match self.channel.recv_packet(Wait::Indefinite).await {
                Ok(packet) => packet,
                Err(e) if e.is_transient() => continue,
                Err(e) => return Err(e),
            };
            if !syn.header.has_syn() {
                debug!("expected SYN, got flags {:#x} - ignoring", syn.header.flags);
                continue;
            }
            let Some(peer) = self.channel.peer() else {
                continue;
            };

            debug!("SYN from {:?} (seq {})", peer, syn.header.seq);
            self.events.emit(format_args!("RCV SYN SEQ={}", syn.header.seq));

            let child_channel = DatagramChannel::new(
                self.channel.socket(),
                Some(peer),
                self.config.loss_rate,
                self.events.clone(),
            );
            let mut conn = Connection::with_channel(child_channel, &self.config, self.events.clone());
            conn.recv_seq = syn.header.seq.wrapping_add(1);
            conn.state = State::SynReceived;
            conn.flow.update_peer_window(syn.header.window);

            let window = conn.advertised_window();
            let syn_ack = Packet::control(conn.send_seq, conn.recv_seq, packet::SYN | packet::ACK, window);
            conn.channel.send_packet(&syn_ack).await?;
            self.events.emit(format_args!(
                "SND SYN-ACK SEQ={} ACK={}",
                conn.send_seq, conn.recv_seq
            ));
            conn.send_seq = conn.send_seq.wrapping_add(1);

            // the final ACK has one retransmission timeout to arrive
            match conn.channel.recv_packet(Wait::Timeout(RTO)).await {
                Ok(ack) if ack.header.has_ack() && ack.header.ack == conn.send_seq => {
                    self.events.emit(format_args!("RCV ACK FOR SYN"));
                    conn.state = State::Established;
                    conn.send_base = conn.send_seq;
                    conn.flow.align(conn.send_seq);
                    conn.flow.update_peer_window(ack.header.window);
                    info!("accepted connection from {:?}", peer);
                    return Ok(conn);
                }
                Ok(_) => {
                    debug!("invalid final ACK from {:?} - discarding half-open connection", peer);
                }
                Err(e) if e.is_transient() => {
                    debug!("no final ACK from {:?} within RTO - discarding half-open connection", peer);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// One reliable byte-stream connection over UDP. Exclusively owned: all
/// progress (timers included) happens inside calls to [`Connection::send`]
/// and [`Connection::recv`], so no locking is involved. Dropping the
/// connection releases the endpoint.
pub struct Connection {
    channel: DatagramChannel,
    state: State,

    /// Next sequence number to stamp on an outgoing segment.
    send_seq: u32,
    /// Oldest unacknowledged sequence number; `[send_base, send_seq)` is the
    /// unacknowledged range.
    send_base: u32,
    /// Next in-order sequence number expected from the peer.
    recv_seq: u32,

    send_window: SendWindow,
    reassembly: ReassemblyBuffer,
    flow: FlowControl,
    events: EventLog,

    retransmit_count: u64,
}

impl Connection {
    fn with_channel(channel: DatagramChannel, config: &RudpConfig, events: EventLog) -> Connection {
        let isn = rand::thread_rng().next_u32();
        trace!("initial sequence number {}", isn);
        Connection {
            channel,
            state: State::Closed,
            send_seq: isn,
            send_base: isn,
            recv_seq: 0,
            send_window: SendWindow::new(),
            reassembly: ReassemblyBuffer::new(),
            flow: FlowControl::new(config.recv_buffer_size, isn),
            events,
            retransmit_count: 0,
        }
    }

    /// Resolve `host` and drive the initiator side of the three-way
    /// handshake. Returns an ESTABLISHED connection, or `HandshakeFailed`
    /// when the SYN-ACK does not arrive (or does not match) within one
    /// retransmission timeout.
    pub async fn connect(host: &str, port: u16, config: RudpConfig) -> crate::Result<Connection> {
        let mut addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|_| RudpError::ResolveFailed(host.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(RudpError::ResolveFailed(host.to_string()));
        }
        // prefer IPv4, like the original tooling this interoperates with
        let peer = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .copied()
            .unwrap_or_else(|| addrs.remove(0));

        let bind_addr: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        let events = EventLog::for_role("client");
        let channel =
            DatagramChannel::new(Arc::new(socket), Some(peer), config.loss_rate, events.clone());
        let mut conn = Connection::with_channel(channel, &config, events);

        let window = conn.advertised_window();
        let syn = Packet::control(conn.send_seq, 0, packet::SYN, window);
        conn.channel.send_packet(&syn).await?;
        conn.events.emit(format_args!("SND SYN SEQ={}", conn.send_seq));
        conn.state = State::SynSent;
        debug!("SYN sent to {:?} (seq {}), awaiting SYN-ACK", peer, conn.send_seq);

        let syn_ack = match conn.channel.recv_packet(Wait::Timeout(RTO)).await {
            Ok(packet) => packet,
            Err(e) if e.is_transient() => {
                conn.state = State::Closed;
                return Err(RudpError::HandshakeFailed(
                    "no SYN-ACK within the retransmission timeout",
                ));
            }
            Err(e) => {
                conn.state = State::Closed;
                return Err(e);
            }
        };

        if !(syn_ack.header.has_syn() && syn_ack.header.has_ack())
            || syn_ack.header.ack != conn.send_seq.wrapping_add(1)
        {
            conn.state = State::Closed;
            return Err(RudpError::HandshakeFailed(
                "SYN-ACK flags or acknowledgment mismatch",
            ));
        }
        conn.events.emit(format_args!(
            "RCV SYN-ACK SEQ={} ACK={}",
            syn_ack.header.seq, syn_ack.header.ack
        ));

        conn.recv_seq = syn_ack.header.seq.wrapping_add(1);
        conn.send_seq = conn.send_seq.wrapping_add(1);
        conn.flow.update_peer_window(syn_ack.header.window);

        let window = conn.advertised_window();
        let ack = Packet::control(conn.send_seq, conn.recv_seq, packet::ACK, window);
        conn.channel.send_packet(&ack).await?;
        conn.events.emit(format_args!("SND ACK={}", conn.recv_seq));

        conn.state = State::Established;
        conn.send_base = conn.send_seq;
        conn.flow.align(conn.send_seq);
        info!("connected to {:?}", peer);
        Ok(conn)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.channel.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.channel.peer()
    }

    /// Number of segment retransmissions performed over the connection's
    /// lifetime. Diagnostic.
    pub fn retransmits(&self) -> u64 {
        self.retransmit_count
    }

    /// Send `data` reliably: chunk into segments of up to one MSS, gate on
    /// the send window and the peer's advertised window, retransmit on
    /// timeout, and return once every byte is acknowledged.
    pub async fn send(&mut self, data: &[u8]) -> crate::Result<usize> {
        if self.state != State::Established {
            return Err(RudpError::WrongState(self.state));
        }

        let mut offset = 0;
        while offset < data.len() {
            self.drain_acks().await?;
            self.retransmit_expired().await?;

            if self.send_window.is_full() {
                sleep(WINDOW_FULL_YIELD).await;
                continue;
            }

            let chunk = min(MAX_DATA_LEN, data.len() - offset);
            if !self.flow.may_send(chunk) {
                trace!(
                    "flow control: {} bytes in flight against peer window {} - waiting",
                    self.flow.bytes_in_flight(),
                    self.flow.peer_window()
                );
                sleep(FLOW_BLOCKED_YIELD).await;
                continue;
            }

            let window = self.advertised_window();
            let seq = self.send_seq;
            let segment = Packet::data(seq, self.recv_seq, window, &data[offset..offset + chunk]);
            self.channel.send_packet(&segment).await?;
            self.send_window.push(segment, Instant::now());
            self.flow.on_bytes_sent(chunk as u32);
            debug_assert!(self.flow.bytes_in_flight() <= self.flow.peer_window());

            self.send_seq = self.send_seq.wrapping_add(chunk as u32);
            offset += chunk;

            self.events.emit(format_args!("SND DATA SEQ={seq} LEN={chunk}"));
            trace!("segment {} sent ({} bytes, {} in window)", seq, chunk, self.send_window.len());
        }

        // drain: every emitted segment must be acknowledged before returning
        while !self.send_window.is_empty() {
            match self.channel.recv_packet(Wait::Timeout(RTO)).await {
                Ok(packet) if packet.header.has_ack() => self.process_ack(&packet),
                Ok(_) => {}
                Err(e) if e.is_transient() => {}
                Err(e) => return Err(e),
            }
            self.retransmit_expired().await?;
        }

        debug!("{} bytes sent and acknowledged", data.len());
        Ok(data.len())
    }

    /// Receive into `buf`, delivering bytes strictly in stream order and
    /// staging anything that arrives ahead of the cursor. Returns the bytes
    /// delivered by this call, which may be fewer than `buf.len()` - the call
    /// ends after one retransmission timeout without an arrival.
    pub async fn recv(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        if self.state != State::Established {
            return Err(RudpError::WrongState(self.state));
        }

        let mut received = 0;
        while received < buf.len() {
            let segment = match self.channel.recv_packet(Wait::Timeout(RTO)).await {
                Ok(packet) => packet,
                Err(e) if e.is_transient() => break,
                Err(e) => return Err(e),
            };

            let len = segment.data_len();
            if len == 0 {
                // zero-length segments are control traffic, not data
                trace!("control segment (flags {:#x}) ignored by the data path", segment.header.flags);
                continue;
            }

            let seq = segment.header.seq;
            if seq == self.recv_seq {
                let copy_len = min(len, buf.len() - received);
                buf[received..received + copy_len].copy_from_slice(&segment.payload[..copy_len]);
                received += copy_len;
                // the cursor advances by the full segment length even when
                // the copy was truncated; receive buffers must hold at least
                // one full segment
                self.recv_seq = self.recv_seq.wrapping_add(len as u32);
                self.flow.charge(len as u32);
                self.events.emit(format_args!("RCV DATA SEQ={seq} LEN={len}"));
                trace!("in-order segment {} ({} bytes)", seq, len);

                // pull staged successors forward while they connect
                let mut delivered = copy_len;
                while let Some(staged) = self.reassembly.take(self.recv_seq) {
                    let staged_len = staged.data_len();
                    let copy_len = min(staged_len, buf.len() - received);
                    buf[received..received + copy_len]
                        .copy_from_slice(&staged.payload[..copy_len]);
                    received += copy_len;
                    delivered += copy_len;
                    self.recv_seq = self.recv_seq.wrapping_add(staged_len as u32);
                    debug!("staged segment {} delivered ({} bytes)", staged.header.seq, staged_len);
                }
                self.flow.discharge(delivered as u32);
            } else if packet::seq_lt(self.recv_seq, seq) {
                if self.reassembly.insert(segment) {
                    self.flow.charge(len as u32);
                    debug!("segment {} staged ahead of cursor {}", seq, self.recv_seq);
                } else {
                    debug!("out-of-order buffer full - segment {} dropped", seq);
                }
            } else {
                trace!("duplicate segment {} behind cursor {} - ignored", seq, self.recv_seq);
            }

            // every data arrival is answered with a cumulative ACK
            let window = self.advertised_window();
            let ack = Packet::control(self.send_seq, self.recv_seq, packet::ACK, window);
            self.channel.send_packet(&ack).await?;
            self.events.emit(format_args!("SND ACK={} WIN={}", self.recv_seq, window));
        }

        Ok(received)
    }

    /// Initiate the close handshake: send a FIN, then wait for both the ACK
    /// of our FIN and the peer's FIN (which is acknowledged in turn). The FIN
    /// is not retransmitted; instead the whole wait is bounded, after which
    /// the connection is closed hard.
    pub async fn close(&mut self) -> crate::Result<()> {
        if self.state != State::Established {
            return Err(RudpError::WrongState(self.state));
        }
        info!("initiating close handshake");

        let window = self.advertised_window();
        let fin = Packet::control(self.send_seq, self.recv_seq, packet::FIN, window);
        self.channel.send_packet(&fin).await?;
        self.events.emit(format_args!("SND FIN SEQ={}", self.send_seq));
        self.send_seq = self.send_seq.wrapping_add(1);
        self.state = State::FinWait1;

        let deadline = Instant::now() + RTO * MAX_RETRIES;
        let mut ack_seen = false;
        let mut fin_seen = false;
        while !(ack_seen && fin_seen) && self.state != State::Closed {
            if Instant::now() >= deadline {
                warn!("close handshake incomplete after {:?} - closing hard", RTO * MAX_RETRIES);
                break;
            }

            let packet = match self.channel.recv_packet(Wait::Timeout(RTO)).await {
                Ok(packet) => packet,
                Err(e) if e.is_transient() => continue,
                // a dead socket ends the handshake; there is nothing left to wait for
                Err(_) => break,
            };

            if packet.header.has_ack() && !ack_seen {
                ack_seen = true;
                self.state = State::FinWait2;
                debug!("ACK for our FIN received");
            }
            if packet.header.has_fin() && !fin_seen {
                fin_seen = true;
                self.recv_seq = packet.header.seq.wrapping_add(1);
                self.events.emit(format_args!("RCV FIN SEQ={}", packet.header.seq));

                let window = self.advertised_window();
                let ack = Packet::control(self.send_seq, self.recv_seq, packet::ACK, window);
                self.channel.send_packet(&ack).await?;
                self.events.emit(format_args!("SND ACK FOR FIN"));
                self.state = State::Closed;
                debug!("peer FIN acknowledged - connection closed");
            }
        }

        self.state = State::Closed;
        info!("connection closed");
        Ok(())
    }

    /// Drain every ACK currently queued on the socket without blocking.
    async fn drain_acks(&mut self) -> crate::Result<()> {
        loop {
            match self.channel.recv_packet(Wait::Poll).await {
                Ok(packet) if packet.header.has_ack() => self.process_ack(&packet),
                Ok(_) => {}
                Err(e) if e.is_transient() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn process_ack(&mut self, packet: &Packet) {
        self.events.emit(format_args!("RCV ACK={}", packet.header.ack));
        self.flow.on_ack(packet.header.ack, packet.header.window);

        if let Some(base) = self.send_window.ack_through(packet.header.ack) {
            self.send_base = base;
            trace!(
                "cumulative ACK {} advanced send base to {} ({} in window)",
                packet.header.ack,
                base,
                self.send_window.len()
            );
        }
        debug_assert!(packet::seq_le(self.send_base, self.send_seq));
    }

    /// Retransmit every segment whose timer expired; give the connection up
    /// once a segment runs out of retries.
    async fn retransmit_expired(&mut self) -> crate::Result<()> {
        match self.send_window.take_expired(Instant::now(), RTO) {
            Ok(expired) => {
                for segment in expired {
                    self.events.emit(format_args!("TIMEOUT SEQ={}", segment.header.seq));
                    self.channel.send_packet(&segment).await?;
                    self.retransmit_count += 1;
                    self.events.emit(format_args!(
                        "RETX DATA SEQ={} LEN={}",
                        segment.header.seq,
                        segment.data_len()
                    ));
                    debug!("retransmitted segment {} ({} bytes)", segment.header.seq, segment.data_len());
                }
                Ok(())
            }
            Err(seq) => {
                warn!("segment {} exhausted its retransmission budget - connection is dead", seq);
                self.state = State::Closed;
                Err(RudpError::Unrecoverable { seq })
            }
        }
    }

    fn advertised_window(&mut self) -> u16 {
        let (window, update) = self.flow.advertise();
        if let Some(w) = update {
            self.events.emit(format_args!("FLOW WIN UPDATE={w}"));
        }
        window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ACK, SYN};
    use bytes::BytesMut;

    async fn establish() -> (Connection, Connection) {
        let mut listener = Listener::bind(0, RudpConfig::default()).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client = Connection::connect("127.0.0.1", port, RudpConfig::default())
            .await
            .unwrap();
        let server = accept.await.unwrap();
        (client, server)
    }

    fn encode(packet: &Packet) -> Vec<u8> {
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        buf.to_vec()
    }

    /// Handshake responder for tests that need to hand-craft segments.
    /// Returns the connection's address and the first data sequence numbers
    /// of both directions.
    async fn fake_accept(socket: &UdpSocket, isn: u32) -> (SocketAddr, u32, u32) {
        let mut buf = [0u8; 2048];

        let (n, from) = socket.recv_from(&mut buf).await.unwrap();
        let syn = Packet::deser(&buf[..n]).unwrap();
        assert!(syn.header.has_syn());

        let syn_ack = Packet::control(isn, syn.header.seq.wrapping_add(1), SYN | ACK, 16 * 1024);
        socket.send_to(&encode(&syn_ack), from).await.unwrap();

        let (n, _) = socket.recv_from(&mut buf).await.unwrap();
        let ack = Packet::deser(&buf[..n]).unwrap();
        assert!(ack.header.has_ack());
        assert_eq!(ack.header.ack, isn.wrapping_add(1));

        (from, syn.header.seq.wrapping_add(1), isn.wrapping_add(1))
    }

    #[tokio::test]
    async fn test_handshake_establishes_both_sides() {
        let (client, server) = establish().await;
        assert_eq!(client.state(), State::Established);
        assert_eq!(server.state(), State::Established);
        assert_eq!(
            server.peer_addr().unwrap().port(),
            client.local_addr().unwrap().port()
        );
    }

    #[tokio::test]
    async fn test_connect_to_silent_peer_fails_within_rto() {
        // a bound socket that never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let started = Instant::now();
        let result = Connection::connect("127.0.0.1", port, RudpConfig::default()).await;
        assert!(matches!(result, Err(RudpError::HandshakeFailed(_))));
        assert!(started.elapsed() < RTO + Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_connect_resolve_failure() {
        let result =
            Connection::connect("host.does-not-exist.invalid", 1, RudpConfig::default()).await;
        assert!(matches!(result, Err(RudpError::ResolveFailed(_))));
    }

    #[tokio::test]
    async fn test_mismatched_syn_ack_fails_handshake() {
        let fake = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let port = fake.local_addr().unwrap().port();

        let responder = tokio::spawn({
            let fake = fake.clone();
            async move {
                let mut buf = [0u8; 2048];
                let (n, from) = fake.recv_from(&mut buf).await.unwrap();
                let syn = Packet::deser(&buf[..n]).unwrap();
                // wrong acknowledgment number
                let syn_ack = Packet::control(77, syn.header.seq.wrapping_add(2), SYN | ACK, 1024);
                fake.send_to(&encode(&syn_ack), from).await.unwrap();
            }
        });

        let result = Connection::connect("127.0.0.1", port, RudpConfig::default()).await;
        assert!(matches!(result, Err(RudpError::HandshakeFailed(_))));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_reordered_segments_are_delivered_in_order() {
        let fake = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let port = fake.local_addr().unwrap().port();

        let fake_task = tokio::spawn({
            let fake = fake.clone();
            async move {
                let (peer, _client_seq, my_seq) = fake_accept(&fake, 5000).await;

                let a = Packet::data(my_seq, 0, 16 * 1024, &[0xaa; 100]);
                let b = Packet::data(my_seq.wrapping_add(100), 0, 16 * 1024, &[0xbb; 100]);
                let c = Packet::data(my_seq.wrapping_add(200), 0, 16 * 1024, &[0xcc; 100]);

                // deliberate delivery order 2, 1, 3
                fake.send_to(&encode(&b), peer).await.unwrap();
                fake.send_to(&encode(&a), peer).await.unwrap();
                fake.send_to(&encode(&c), peer).await.unwrap();
            }
        });

        let mut conn = Connection::connect("127.0.0.1", port, RudpConfig::default())
            .await
            .unwrap();
        fake_task.await.unwrap();

        let mut buf = [0u8; 1024];
        let n = conn.recv(&mut buf).await.unwrap();
        assert_eq!(n, 300);
        assert_eq!(&buf[..100], &[0xaa; 100]);
        assert_eq!(&buf[100..200], &[0xbb; 100]);
        assert_eq!(&buf[200..300], &[0xcc; 100]);

        // the staging buffer must be empty once everything connected
        assert!(conn.reassembly.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_segment_is_delivered_once_and_acked_again() {
        let fake = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let port = fake.local_addr().unwrap().port();

        let fake_task = tokio::spawn({
            let fake = fake.clone();
            async move {
                let (peer, _client_seq, my_seq) = fake_accept(&fake, 9000).await;

                let segment = Packet::data(my_seq, 0, 16 * 1024, &[0x42; 50]);
                fake.send_to(&encode(&segment), peer).await.unwrap();
                fake.send_to(&encode(&segment), peer).await.unwrap();

                // both the first delivery and the duplicate are ACKed with
                // the same cumulative value
                let mut buf = [0u8; 2048];
                let mut acks = Vec::new();
                for _ in 0..2 {
                    let (n, _) = fake.recv_from(&mut buf).await.unwrap();
                    let ack = Packet::deser(&buf[..n]).unwrap();
                    assert!(ack.header.has_ack());
                    acks.push(ack.header.ack);
                }
                assert_eq!(acks, vec![my_seq.wrapping_add(50), my_seq.wrapping_add(50)]);
            }
        });

        let mut conn = Connection::connect("127.0.0.1", port, RudpConfig::default())
            .await
            .unwrap();

        let mut buf = [0u8; 256];
        let n = conn.recv(&mut buf).await.unwrap();
        assert_eq!(n, 50);
        assert_eq!(&buf[..50], &[0x42; 50]);

        fake_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unacknowledged_send_exhausts_retries() {
        let fake = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let port = fake.local_addr().unwrap().port();

        let fake_task = tokio::spawn({
            let fake = fake.clone();
            async move {
                // complete the handshake, then fall silent
                fake_accept(&fake, 1234).await;
            }
        });

        let mut conn = Connection::connect("127.0.0.1", port, RudpConfig::default())
            .await
            .unwrap();
        fake_task.await.unwrap();

        let result = conn.send(b"into the void").await;
        assert!(matches!(result, Err(RudpError::Unrecoverable { .. })));
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(conn.retransmits(), MAX_RETRIES as u64);
    }

    #[tokio::test]
    async fn test_send_returns_only_when_fully_acknowledged() {
        let (mut client, mut server) = establish().await;

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let mut got = 0;
            while got < 2000 {
                got += server.recv(&mut buf).await.unwrap();
            }
            server
        });

        client.send(&[7u8; 2000]).await.unwrap();
        assert!(client.send_window.is_empty());
        assert_eq!(client.send_base, client.send_seq);

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_pair() {
        let (mut client, mut server) = establish().await;

        let client_task = tokio::spawn(async move {
            client.close().await.unwrap();
            client
        });
        server.close().await.unwrap();
        let client = client_task.await.unwrap();

        assert_eq!(client.state(), State::Closed);
        assert_eq!(server.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_data_operations_require_established() {
        let (mut client, mut server) = establish().await;

        let client_task = tokio::spawn(async move {
            client.close().await.unwrap();
            client
        });
        server.close().await.unwrap();
        let mut client = client_task.await.unwrap();

        assert!(matches!(
            client.send(b"too late").await,
            Err(RudpError::WrongState(State::Closed))
        ));
        let mut buf = [0u8; 16];
        assert!(matches!(
            server.recv(&mut buf).await,
            Err(RudpError::WrongState(State::Closed))
        ));
        assert!(matches!(
            server.close().await,
            Err(RudpError::WrongState(State::Closed))
        ));
    }
}
