use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)]
use mockall::automock;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, error, trace};

use crate::error::RudpError;
use crate::event_log::EventLog;
use crate::packet::{Packet, HEADER_LEN, MAX_PACKET_LEN};

/// Abstraction over the bound UDP endpoint, introduced to facilitate mocking
/// the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, to).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// How long a receive may wait for a datagram.
#[derive(Clone, Copy, Debug)]
pub enum Wait {
    Indefinite,
    Poll,
    Timeout(Duration),
}

/// One endpoint of the datagram channel: a (possibly shared) UDP socket, the
/// peer address once known, and the simulated ingress loss. A listener and
/// the connection it accepts hold the same underlying socket.
pub struct DatagramChannel {
    socket: Arc<dyn DatagramSocket>,
    peer: Option<SocketAddr>,
    loss_rate: f64,
    dead: bool,
    events: EventLog,
}

impl DatagramChannel {
    pub fn new(
        socket: Arc<dyn DatagramSocket>,
        peer: Option<SocketAddr>,
        loss_rate: f64,
        events: EventLog,
    ) -> DatagramChannel {
        DatagramChannel {
            socket,
            peer,
            loss_rate,
            dead: false,
            events,
        }
    }

    pub fn socket(&self) -> Arc<dyn DatagramSocket> {
        self.socket.clone()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Forget the adopted peer so the next arrival picks a fresh one. Used by
    /// the accept path between clients.
    pub fn clear_peer(&mut self) {
        self.peer = None;
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Encode and transmit one packet to the peer. Returns the datagram size.
    pub async fn send_packet(&self, packet: &Packet) -> crate::Result<usize> {
        let peer = self.peer.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no peer address adopted yet")
        })?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + packet.data_len());
        packet.ser(&mut buf);

        trace!(
            "sending to {:?}: SEQ={} ACK={} FLAGS={:#x} LEN={}",
            peer,
            packet.header.seq,
            packet.header.ack,
            packet.header.flags,
            packet.data_len()
        );
        Ok(self.socket.send_to(&buf, peer).await?)
    }

    /// Receive and decode one datagram, waiting at most `wait`. If no peer is
    /// adopted yet, the first (non-dropped) sender becomes the peer.
    ///
    /// Transient outcomes are reported as errors the engine absorbs:
    /// `Timeout` for an elapsed wait, `Dropped` for the simulated-loss path,
    /// `Malformed`/`Oversize` for undecodable datagrams. A fatal socket error
    /// marks the channel dead and surfaces as `Io`.
    pub async fn recv_packet(&mut self, wait: Wait) -> crate::Result<Packet> {
        // one spare byte so an oversize datagram is distinguishable from a
        // maximum-size one
        let mut buf = [0u8; MAX_PACKET_LEN + 1];

        let (len, from) = match wait {
            Wait::Indefinite => self.do_recv(&mut buf).await?,
            Wait::Poll => time::timeout(Duration::ZERO, self.do_recv(&mut buf))
                .await
                .map_err(|_| RudpError::Timeout)??,
            Wait::Timeout(d) => time::timeout(d, self.do_recv(&mut buf))
                .await
                .map_err(|_| RudpError::Timeout)??,
        };

        if self.loss_rate > 0.0 && rand::thread_rng().gen::<f64>() < self.loss_rate {
            if let Ok(packet) = Packet::deser(&buf[..len]) {
                debug!("simulated loss: dropping SEQ={}", packet.header.seq);
                self.events
                    .emit(format_args!("DROP DATA SEQ={}", packet.header.seq));
            }
            return Err(RudpError::Dropped);
        }

        let packet = Packet::deser(&buf[..len]).map_err(|e| {
            debug!("undecodable {}-byte datagram from {:?} - discarding", len, from);
            e
        })?;

        if self.peer.is_none() {
            debug!("adopting {:?} as peer", from);
            self.peer = Some(from);
        }

        trace!(
            "received from {:?}: SEQ={} ACK={} FLAGS={:#x} LEN={}",
            from,
            packet.header.seq,
            packet.header.ack,
            packet.header.flags,
            packet.data_len()
        );
        Ok(packet)
    }

    async fn do_recv(&mut self, buf: &mut [u8]) -> crate::Result<(usize, SocketAddr)> {
        match self.socket.recv_from(buf).await {
            Ok(x) => Ok(x),
            Err(e) => match e.kind() {
                // transient conditions look like an empty wait
                io::ErrorKind::WouldBlock
                | io::ErrorKind::Interrupted
                | io::ErrorKind::TimedOut
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset => Err(RudpError::Timeout),
                _ => {
                    error!("socket error: {} - marking endpoint dead", e);
                    self.dead = true;
                    Err(RudpError::Io(e))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketHeader;
    use rstest::rstest;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn socket_delivering(datagram: Vec<u8>, from: SocketAddr) -> MockDatagramSocket {
        let mut socket = MockDatagramSocket::new();
        socket.expect_recv_from().returning(move |buf| {
            buf[..datagram.len()].copy_from_slice(&datagram);
            Ok((datagram.len(), from))
        });
        socket
    }

    fn encode(packet: &Packet) -> Vec<u8> {
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_send_packet_encodes_to_peer() {
        let packet = Packet::data(7, 3, 2048, &[1, 2, 3]);
        let expected = encode(&packet);

        let mut socket = MockDatagramSocket::new();
        socket
            .expect_send_to()
            .withf(move |buf, to| buf == expected.as_slice() && *to == addr(9))
            .returning(|buf, _| Ok(buf.len()));

        let channel =
            DatagramChannel::new(Arc::new(socket), Some(addr(9)), 0.0, EventLog::disabled());
        assert_eq!(channel.send_packet(&packet).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn test_send_without_peer_fails() {
        let channel = DatagramChannel::new(
            Arc::new(MockDatagramSocket::new()),
            None,
            0.0,
            EventLog::disabled(),
        );
        let packet = Packet::control(1, 0, crate::packet::SYN, 1024);
        assert!(matches!(
            channel.send_packet(&packet).await,
            Err(RudpError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_recv_adopts_first_sender_as_peer() {
        let packet = Packet::data(5, 0, 1024, &[9, 9]);
        let socket = socket_delivering(encode(&packet), addr(4711));

        let mut channel = DatagramChannel::new(Arc::new(socket), None, 0.0, EventLog::disabled());
        assert_eq!(channel.peer(), None);

        let received = channel.recv_packet(Wait::Indefinite).await.unwrap();
        assert_eq!(received, packet);
        assert_eq!(channel.peer(), Some(addr(4711)));
    }

    #[tokio::test]
    async fn test_recv_keeps_existing_peer() {
        let packet = Packet::data(5, 0, 1024, &[9]);
        let socket = socket_delivering(encode(&packet), addr(4711));

        let mut channel =
            DatagramChannel::new(Arc::new(socket), Some(addr(1)), 0.0, EventLog::disabled());
        channel.recv_packet(Wait::Indefinite).await.unwrap();
        assert_eq!(channel.peer(), Some(addr(1)));
    }

    #[rstest]
    #[case::always_drop(1.0)]
    fn test_full_loss_drops_every_ingress_datagram(#[case] loss_rate: f64) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let packet = Packet::data(5, 0, 1024, &[1]);
            let socket = socket_delivering(encode(&packet), addr(4711));

            let mut channel =
                DatagramChannel::new(Arc::new(socket), None, loss_rate, EventLog::disabled());
            for _ in 0..20 {
                assert!(matches!(
                    channel.recv_packet(Wait::Indefinite).await,
                    Err(RudpError::Dropped)
                ));
            }
            // dropped datagrams must not adopt a peer
            assert_eq!(channel.peer(), None);
        });
    }

    #[tokio::test]
    async fn test_recv_rejects_short_datagram() {
        let socket = socket_delivering(vec![1, 2, 3], addr(4711));
        let mut channel = DatagramChannel::new(Arc::new(socket), None, 0.0, EventLog::disabled());
        assert!(matches!(
            channel.recv_packet(Wait::Indefinite).await,
            Err(RudpError::Malformed)
        ));
    }

    #[tokio::test]
    async fn test_recv_rejects_oversize_datagram() {
        let header = PacketHeader { seq: 0, ack: 0, flags: 0, window: 0 };
        let mut datagram = Vec::new();
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        datagram.extend_from_slice(&buf);
        datagram.extend_from_slice(&vec![0u8; MAX_PACKET_LEN + 1 - HEADER_LEN]);

        let socket = socket_delivering(datagram, addr(4711));
        let mut channel = DatagramChannel::new(Arc::new(socket), None, 0.0, EventLog::disabled());
        assert!(matches!(
            channel.recv_packet(Wait::Indefinite).await,
            Err(RudpError::Oversize(_))
        ));
    }

    #[tokio::test]
    async fn test_fatal_socket_error_marks_channel_dead() {
        let mut socket = MockDatagramSocket::new();
        socket
            .expect_recv_from()
            .returning(|_| Err(io::Error::new(io::ErrorKind::BrokenPipe, "fd gone")));

        let mut channel = DatagramChannel::new(Arc::new(socket), None, 0.0, EventLog::disabled());
        assert!(matches!(
            channel.recv_packet(Wait::Indefinite).await,
            Err(RudpError::Io(_))
        ));
        assert!(channel.is_dead());
    }

    #[tokio::test]
    async fn test_transient_socket_error_is_a_timeout() {
        let mut socket = MockDatagramSocket::new();
        socket
            .expect_recv_from()
            .returning(|_| Err(io::Error::new(io::ErrorKind::ConnectionRefused, "icmp")));

        let mut channel = DatagramChannel::new(Arc::new(socket), None, 0.0, EventLog::disabled());
        assert!(matches!(
            channel.recv_packet(Wait::Indefinite).await,
            Err(RudpError::Timeout)
        ));
        assert!(!channel.is_dead());
    }

    #[tokio::test]
    async fn test_poll_times_out_when_nothing_is_queued() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mut channel = DatagramChannel::new(socket, None, 0.0, EventLog::disabled());
        assert!(matches!(
            channel.recv_packet(Wait::Poll).await,
            Err(RudpError::Timeout)
        ));
        assert!(matches!(
            channel
                .recv_packet(Wait::Timeout(Duration::from_millis(10)))
                .await,
            Err(RudpError::Timeout)
        ));
    }
}
