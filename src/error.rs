use std::io;

/// Errors produced by sessions, servers and the event loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying UDP socket or poller failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// No handshake acknowledgement arrived before the last attempt expired.
    #[error("connection timed out after {attempts} handshake attempts")]
    ConnectionTimeout { attempts: usize },

    /// A datagram could not be parsed as a packet.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// The payload passed to `send` exceeds the configured maximum.
    #[error("payload of {len} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    /// A sequence id could not be placed without breaking ascending order.
    #[error("sequence id {id} violates buffer ordering")]
    ProtocolConsistencyViolation { id: u32 },

    /// The endpoint registry is full.
    #[error("endpoint capacity of {max} exceeded")]
    CapacityExceeded { max: usize },

    /// The event loop has been stopped.
    #[error("event loop stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, Error>;
