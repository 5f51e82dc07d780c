use bytes::{Buf, BufMut, BytesMut};

use crate::error::RudpError;

/// Fixed header size on the wire.
pub const HEADER_LEN: usize = 12;

/// Maximum payload bytes per segment (the MSS).
pub const MAX_DATA_LEN: usize = 1024;

/// Upper bound for a well-formed datagram.
pub const MAX_PACKET_LEN: usize = HEADER_LEN + MAX_DATA_LEN;

pub const SYN: u16 = 0x1;
pub const ACK: u16 = 0x2;
pub const FIN: u16 = 0x4;

/// Wrap-safe sequence comparison: `a < b` as a signed 32-bit delta.
pub fn seq_lt(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

/// Wrap-safe sequence comparison: `a <= b` as a signed 32-bit delta.
pub fn seq_le(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) >= 0
}

/// The 12-byte packet header - all numbers in network byte order (BE):
/// ```ascii
/// 0:  sequence number (u32): stream offset of the first payload byte for a
///      data segment; a SYN or FIN consumes one sequence number
/// 4:  acknowledgment number (u32): the next sequence number the
///      acknowledger expects (cumulative)
/// 8:  flags (u16): SYN=0x1, ACK=0x2, FIN=0x4; other bits must be zero
/// 10: advertised receive window in bytes (u16)
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub seq: u32,
    pub ack: u32,
    pub flags: u16,
    pub window: u16,
}

impl PacketHeader {
    pub fn has_syn(&self) -> bool {
        self.flags & SYN != 0
    }

    pub fn has_ack(&self) -> bool {
        self.flags & ACK != 0
    }

    pub fn has_fin(&self) -> bool {
        self.flags & FIN != 0
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u16(self.flags);
        buf.put_u16(self.window);
    }

    pub fn deser(buf: &mut impl Buf) -> crate::Result<PacketHeader> {
        if buf.remaining() < HEADER_LEN {
            return Err(RudpError::Malformed);
        }
        Ok(PacketHeader {
            seq: buf.get_u32(),
            ack: buf.get_u32(),
            flags: buf.get_u16(),
            window: buf.get_u16(),
        })
    }
}

/// A decoded datagram: header plus 0..=MAX_DATA_LEN payload bytes. The codec
/// is stateless; sequencing and windows live in the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    /// A data segment; flags are empty, the ack field piggybacks the
    /// receiver cursor.
    pub fn data(seq: u32, ack: u32, window: u16, payload: &[u8]) -> Packet {
        debug_assert!(payload.len() <= MAX_DATA_LEN);
        Packet {
            header: PacketHeader { seq, ack, flags: 0, window },
            payload: payload.to_vec(),
        }
    }

    /// A zero-payload control segment (SYN / ACK / FIN combinations).
    pub fn control(seq: u32, ack: u32, flags: u16, window: u16) -> Packet {
        Packet {
            header: PacketHeader { seq, ack, flags, window },
            payload: Vec::new(),
        }
    }

    pub fn data_len(&self) -> usize {
        self.payload.len()
    }

    /// The sequence number one past this segment's payload.
    pub fn end_seq(&self) -> u32 {
        self.header.seq.wrapping_add(self.payload.len() as u32)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.header.ser(buf);
        buf.put_slice(&self.payload);
    }

    pub fn deser(datagram: &[u8]) -> crate::Result<Packet> {
        let mut buf = datagram;
        let header = PacketHeader::deser(&mut buf)?;
        if buf.len() > MAX_DATA_LEN {
            return Err(RudpError::Oversize(buf.len()));
        }
        Ok(Packet {
            header,
            payload: buf.to_vec(),
        })
    }
}
