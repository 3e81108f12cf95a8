use thiserror::Error;

/// Errors raised while converting between [`Value`](super::Value) and bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("invalid marker byte 0x{0:02x}")]
    InvalidMarker(u8),

    #[error("integer {0} does not fit in 64 bits")]
    IntegerOutOfRange(i128),

    #[error("{kind} of length {len} exceeds the 32-bit limit")]
    LengthOverflow { kind: &'static str, len: usize },

    #[error("invalid utf-8 in string")]
    InvalidUtf8,

    #[error("nesting deeper than {0} levels")]
    DepthLimitExceeded(usize),

    #[error("frame declared {declared} bytes but {consumed} were consumed")]
    LengthMismatch { declared: usize, consumed: usize },

    #[error("frame of {len} bytes exceeds the limit of {limit}")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("expected {expected}, found {found}")]
    UnexpectedType {
        expected: &'static str,
        found: String,
    },
}
