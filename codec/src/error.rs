//! Error types for carlink-codec.

/// Result type alias for carlink-codec.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for encoding and decoding operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The command descriptor could not be interpreted.
    #[error("malformed command: {0}")]
    Malformed(String),

    /// No wire encoding exists for this command type.
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    /// Payload does not fit the one-byte length field.
    #[error("payload too large: {0} bytes (max 255)")]
    PayloadTooLarge(usize),

    /// Not enough bytes to decode a full frame.
    #[error("incomplete frame: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// First byte is not the frame header.
    #[error("invalid frame header: 0x{0:02X}")]
    InvalidHeader(u8),

    /// Checksum byte does not match the frame contents.
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{got:02X}")]
    ChecksumMismatch { expected: u8, got: u8 },
}
