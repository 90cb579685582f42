use std::net::SocketAddr;

use thiserror::Error;

/// Broad classes of failure, used by callers that only care about how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The host or its settings are in the wrong shape for the request.
    Configuration,
    /// A datagram or frame violated the wire protocol.
    Protocol,
    /// A bounded buffer, backlog or index range was exceeded.
    Resource,
    /// The connection is not in a state that allows the request.
    Connection,
    /// The I/O worker stopped; the host must be reopened.
    Fatal,
}

/// All errors produced by the TernStream transport layer.
#[derive(Debug, Error)]
pub enum TernStreamError {
    // Configuration
    #[error("host is already open")]
    AlreadyOpen,

    #[error("host is not open")]
    NotOpen,

    #[error("unsupported address family for {0}")]
    UnsupportedAddressFamily(SocketAddr),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    // Protocol
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("invalid delivery mode: 0x{0:02x}")]
    InvalidDelivery(u8),

    #[error("invalid connection mode: 0x{0:02x}")]
    InvalidConnectionMode(u8),

    #[error("checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("unknown channel {channel} (connection has {channels})")]
    UnknownChannel { channel: u8, channels: u8 },

    #[error("ordinal {ordinal} outside the receive window at {next}")]
    OutOfWindow { ordinal: u16, next: u16 },

    #[error("session mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")]
    SessionMismatch { expected: u32, actual: u32 },

    #[error("replayed or stale packet counter {0}")]
    Replayed(u64),

    #[error("fragment {index} of {last} is malformed or out of sequence")]
    InvalidFragment { index: u8, last: u8 },

    // Resource
    #[error("backlog full on channel {channel}: {pending} + {size} bytes exceeds {capacity}")]
    BacklogFull {
        channel: u8,
        pending: usize,
        size: usize,
        capacity: usize,
    },

    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("requested length {requested} exceeds maximum {max}")]
    CapacityExceeded { requested: usize, max: usize },

    #[error("stale memory block: version {held} no longer current ({current})")]
    StaleBlock { held: u32, current: u32 },

    #[error("buffer too small: need {need}, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("receive window full: {buffered} + {size} bytes exceeds {window}")]
    ReceiveWindowFull {
        buffered: usize,
        size: usize,
        window: usize,
    },

    #[error("host is full: {0} peers")]
    HostFull(usize),

    // Connection
    #[error("peer is not connected")]
    NotConnected,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("connection timeout")]
    ConnectionTimeout,

    #[error("crypto error: {0}")]
    Crypto(#[from] terntrust::TernTrustError),

    // Fatal
    #[error("io worker stopped: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TernStreamError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        use TernStreamError::*;
        match self {
            AlreadyOpen | NotOpen | UnsupportedAddressFamily(_) | Bind { .. }
            | InvalidSettings(_) => ErrorKind::Configuration,
            FrameTooShort { .. }
            | UnknownPacketType(_)
            | UnknownFrameType(_)
            | InvalidDelivery(_)
            | InvalidConnectionMode(_)
            | ChecksumMismatch { .. }
            | UnknownChannel { .. }
            | OutOfWindow { .. }
            | SessionMismatch { .. }
            | Replayed(_)
            | InvalidFragment { .. } => ErrorKind::Protocol,
            BacklogFull { .. }
            | PayloadTooLarge { .. }
            | IndexOutOfRange { .. }
            | CapacityExceeded { .. }
            | StaleBlock { .. }
            | BufferTooSmall { .. }
            | ReceiveWindowFull { .. }
            | HostFull(_) => ErrorKind::Resource,
            NotConnected | HandshakeFailed(_) | ConnectionTimeout | Crypto(_) => {
                ErrorKind::Connection
            }
            Fatal(_) | Io(_) => ErrorKind::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, TernStreamError>;
