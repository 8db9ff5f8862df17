use crate::message::DataKind;

/// Raised when a message is built with a payload that does not match its kind
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MessageError {
    #[error("Invalid message: kind {kind} cannot carry a {payload} payload")]
    InvalidMessage { kind: DataKind, payload: DataKind },

    #[error("Invalid message: id {0:#04x} out of range")]
    InvalidId(u8),
}

/// Reasons a single frame is dropped by a decoder.
///
/// None of these are fatal: the decoder has already resynchronised by the
/// time the error is returned.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Sentence has no checksum")]
    MissingChecksum,

    #[error("Frame exceeded {limit} bytes without a terminator")]
    FrameTooLong { limit: usize },

    #[error("Framing error: {0}")]
    FrameError(String),

    #[error("Parity error: receiver status {status}")]
    ParityError { status: u8 },

    #[error("Cycle incomplete: {0}")]
    CycleIncomplete(String),

    #[error("Malformed data: {0}")]
    Malformed(String),

    #[error("Invalid hex digits: {0:?}")]
    InvalidHex(String),
}
