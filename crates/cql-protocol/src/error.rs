use thiserror::Error;

/// Failures that can occur while encoding or decoding the wire protocol.
///
/// Every variant names the condition precisely enough to diagnose a bad
/// frame without inspecting raw bytes; none of these are ever retryable.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    #[error("declared length {declared} exceeds remaining buffer of {remaining} bytes")]
    LengthOverrun { declared: i64, remaining: usize },

    #[error("integer value does not fit in target type {target}")]
    IntegerRange { target: &'static str },

    #[error("uuid must be exactly 16 bytes long, got {0}")]
    BadUuidLength(usize),

    #[error("duration is missing its {0} component")]
    IncompleteDuration(&'static str),

    #[error("expected vector with {expected} dimensions, received {actual}")]
    VectorDimensionMismatch { expected: u32, actual: u32 },

    #[error("malformed vint: {0}")]
    MalformedVint(&'static str),

    #[error("unsupported or unrecognized CQL type string: {0}")]
    UnknownType(String),

    #[error("unexpected opcode 0x{0:02x}")]
    UnexpectedOpcode(u8),

    #[error("frame body truncated: expected {expected} bytes, have {actual}")]
    TruncatedFrame { expected: usize, actual: usize },

    #[error("segment header CRC24 mismatch")]
    SegmentHeaderCrc,

    #[error("segment payload CRC32 mismatch")]
    SegmentPayloadCrc,

    #[error("segment payload exceeds the 128 KiB segment budget ({0} bytes)")]
    SegmentTooLarge(usize),

    #[error("compression codec '{0}' failed: {1}")]
    Compression(&'static str, String),

    #[error("value is not valid UTF-8 for an ascii/text/varchar column")]
    InvalidUtf8,

    #[error("collection count {0} is negative")]
    NegativeCollectionCount(i32),

    #[error("'not set' marker (-2) is only valid for bound EXECUTE values, not for decoded results")]
    UnexpectedUnset,
}
