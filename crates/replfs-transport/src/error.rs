use thiserror::Error;

/// Errors raised while framing, chunking or moving bytes over a connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("frame checksum mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    FrameChecksumMismatch { expected: u32, computed: u32 },

    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: u32, max_size: u32 },

    #[error("unknown opcode: 0x{0:04X}")]
    UnknownOpcode(u16),

    #[error("unexpected opcode: expected {expected:?}, got {got:?}")]
    UnexpectedOpcode {
        expected: crate::protocol::Opcode,
        got: crate::protocol::Opcode,
    },

    #[error("invalid chunk: {reason}")]
    InvalidChunk { reason: String },

    #[error("chunk {index} checksum mismatch: expected {expected}, computed {computed}")]
    ChunkChecksumMismatch {
        index: u32,
        expected: String,
        computed: String,
    },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for TransportError {
    fn from(e: bincode::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}

impl TransportError {
    /// True when the peer went away mid-exchange.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::ConnectionClosed => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
