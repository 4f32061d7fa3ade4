//! Binary framing shared by the archive client and any peer speaking its protocol.
//!
//! Every message after the handshake starts with a one byte packet tag followed by
//! a typed payload. Integers are little-endian, strings are a `u32` byte length
//! followed by UTF-8, and time bounds are `i64` milliseconds since the Unix epoch.

mod codec;
pub mod handshake;
pub mod packet;

pub use handshake::{client_handshake, server_handshake};
pub use packet::{ClientPacket, ServerPacket};

/// Sent by the client immediately after connecting.
pub const CLIENT_MAGIC: u32 = 0x4143_5243;
/// Sent by the server in reply to [`CLIENT_MAGIC`], followed by its protocol version.
pub const SERVER_MAGIC: u32 = 0x4153_5243;
pub const PROTOCOL_VERSION: u32 = 1;
pub const CLIENT_READY: u32 = 0x5952_4443;
pub const SERVER_READY: u32 = 0x5952_4453;

/// Upper bound for a single file data chunk in either direction.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;
/// Upper bound for any length-prefixed string on the wire.
pub const MAX_STRING_LEN: usize = 16 * 1024 * 1024;
/// Upper bound for the number of names in one listing response.
pub const MAX_LIST_ENTRIES: usize = 1 << 24;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("bad handshake magic: {0:#010x}")]
    BadMagic(u32),
    #[error("protocol version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("bad ready marker: {0:#010x}")]
    BadReady(u32),
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => WireError::UnexpectedEof,
            _ => WireError::Io(err.to_string()),
        }
    }
}
