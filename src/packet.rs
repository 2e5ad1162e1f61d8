//! Wire format.
//!
//! Every datagram carries exactly one packet:
//!
//! ```text
//! +--------+------+--------+-----------------+
//! | id: 4  | ty:1 | len: 4 | payload: len    |
//! +--------+------+--------+-----------------+
//! ```
//!
//! All integers are big-endian. HELLO and the ACK answering it carry [`HELLO_ID`], which never
//! appears as a data id.

use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 4 + 1 + 4;

/// Sequence id reserved for handshake packets.
pub const HELLO_ID: u32 = 0x7fff_ffff;

const TYPE_DATA: u8 = 0;
const TYPE_ACK: u8 = 1;
const TYPE_HELLO: u8 = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketType {
    Data,
    Ack,
    Hello,
}

impl PacketType {
    fn to_byte(self) -> u8 {
        match self {
            Self::Data => TYPE_DATA,
            Self::Ack => TYPE_ACK,
            Self::Hello => TYPE_HELLO,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            TYPE_DATA => Some(Self::Data),
            TYPE_ACK => Some(Self::Ack),
            TYPE_HELLO => Some(Self::Hello),
            _ => None,
        }
    }
}

/// A single packet together with its serialized form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    id: u32,
    packet_type: PacketType,
    // Header followed by payload, ready to hand to the socket
    bytes: Box<[u8]>,
    // Local-only; meaningful for outbound DATA packets
    acked: bool,
}

impl Packet {
    /// Builds a packet and its wire representation.
    pub fn encode(id: u32, packet_type: PacketType, payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= u32::MAX as usize);

        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());

        bytes.extend_from_slice(&id.to_be_bytes());
        bytes.push(packet_type.to_byte());
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);

        Self {
            id,
            packet_type,
            bytes: bytes.into_boxed_slice(),
            acked: false,
        }
    }

    /// Shorthand for an empty handshake packet.
    pub fn hello() -> Self {
        Self::encode(HELLO_ID, PacketType::Hello, &[])
    }

    /// Shorthand for an acknowledgement of `id`.
    pub fn ack(id: u32) -> Self {
        Self::encode(id, PacketType::Ack, &[])
    }

    /// Parses a received datagram. The advertised payload length must match the number of bytes
    /// that actually follow the header.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::MalformedPacket("datagram shorter than header"));
        }

        let id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

        let packet_type = PacketType::from_byte(bytes[4])
            .ok_or(Error::MalformedPacket("unknown packet type"))?;

        let payload_len = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;

        if bytes.len() - HEADER_SIZE != payload_len {
            return Err(Error::MalformedPacket("payload length mismatch"));
        }

        Ok(Self {
            id,
            packet_type,
            bytes: bytes.into(),
            acked: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..]
    }

    pub fn payload_len(&self) -> usize {
        self.bytes.len() - HEADER_SIZE
    }

    /// Serialized bytes, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_acked(&self) -> bool {
        self.acked
    }

    pub fn set_acked(&mut self) {
        self.acked = true;
    }
}
