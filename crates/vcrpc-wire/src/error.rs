/// Errors raised when a frame or field on the wire is malformed.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The preamble buffer is shorter than the fixed header size.
    #[error("short packet preamble ({len} bytes, need {need})")]
    ShortPreamble { len: usize, need: usize },

    /// The preamble checksum does not validate against the header bytes.
    #[error("bad checksum in packet preamble (expected {expected:#010x}, found {found:#010x})")]
    BadChecksum { expected: u32, found: u32 },

    /// The preamble carries a non-positive payload size.
    #[error("bad payload size in packet preamble: {size}")]
    BadPayloadSize { size: u32 },

    /// The preamble announces a payload larger than the configured limit.
    #[error("payload size {size} exceeds limit {max}")]
    OversizedPayload { size: u32, max: usize },

    /// A field name ran off the end of the payload before its terminator.
    #[error("unterminated field name in packet payload")]
    UnterminatedFieldName,

    /// The payload ended before a complete field could be read.
    #[error("truncated field in packet payload (need {need} bytes, {remaining} remaining)")]
    TruncatedField { need: usize, remaining: usize },

    /// A field name could not be decoded with the session charset.
    #[error("undecodable field name in packet payload")]
    UndecodableFieldName,
}

/// Caller defects: misuse of the API rather than a peer or transport fault.
///
/// These are not recoverable by retrying; the calling code is wrong.
#[derive(Debug, thiserror::Error)]
pub enum ProgrammingError {
    /// A packet was submitted for marshaling without a function name.
    #[error("unmapped / unmappable function name in packet")]
    EmptyFunctionName,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
