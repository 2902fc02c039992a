//! Error types for carlink-serial.

/// Result type alias for carlink-serial.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for serial transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The port could not be opened, or the transport is closed.
    #[error("port unavailable: {0}")]
    PortUnavailable(String),

    /// The device rejected or dropped a write.
    #[error("write failed: {0}")]
    WriteFailed(String),
}
