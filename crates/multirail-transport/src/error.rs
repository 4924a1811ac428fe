use thiserror::Error;

/// Errors surfaced by the transport core.
///
/// `BadSubpath` is recoverable (the engine marks the rail unhealthy and
/// rebinds work to another rail); `BadPath` is fatal for the whole path and
/// must be surfaced to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("pool '{pool}' permanently exhausted")]
    OutOfResource { pool: &'static str },

    #[error("pool '{pool}' temporarily exhausted, retry on next progress call")]
    TempOutOfResource { pool: &'static str },

    #[error("rail {rail} failed")]
    BadSubpath { rail: usize },

    #[error("no healthy rail remains")]
    BadPath,

    #[error("fatal transport error: {reason}")]
    Fatal { reason: String },

    #[error("checksum mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("invalid sequence range: [{lower}, {upper}]")]
    InvalidRange { lower: u64, upper: u64 },

    #[error("unknown control message type: {0}")]
    UnknownCtlType(u32),

    #[error("unknown message id: {0}")]
    UnknownMessage(u64),
}

pub type Result<T> = std::result::Result<T, TransportError>;
