//! Error types for carlink-bridge.

use std::io;

/// Result type alias for carlink-bridge.
pub type Result<T> = std::result::Result<T, Error>;

/// Process-level errors: startup, configuration, listeners.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// Config file could not be parsed.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The client's outbound queue is gone.
    #[error("client disconnected")]
    ClientDisconnected,
}

/// Per-request failure, reported only to the requesting client.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// Bad client JSON or fields.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Rejected by the encoder before any hardware I/O.
    #[error(transparent)]
    Codec(carlink_codec::Error),

    /// The serial write did not happen.
    #[error(transparent)]
    Transport(carlink_serial::Error),
}

impl GatewayError {
    /// Text of the `error` field sent back to the client.
    pub fn client_message(&self) -> String {
        use carlink_codec::Error as CodecError;

        match self {
            GatewayError::MalformedRequest(_) => "malformed command".to_string(),
            GatewayError::Codec(CodecError::UnsupportedCommand(kind)) => {
                format!("unsupported command: {}", kind)
            }
            GatewayError::Codec(CodecError::PayloadTooLarge(_)) => "payload too large".to_string(),
            GatewayError::Codec(_) => "malformed command".to_string(),
            GatewayError::Transport(_) => "hardware send failed".to_string(),
        }
    }

    /// Whether the failure happened at the hardware boundary.
    pub fn is_transport(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }
}

impl From<carlink_codec::Error> for GatewayError {
    fn from(e: carlink_codec::Error) -> Self {
        match e {
            carlink_codec::Error::Malformed(msg) => GatewayError::MalformedRequest(msg),
            other => GatewayError::Codec(other),
        }
    }
}

impl From<carlink_serial::Error> for GatewayError {
    fn from(e: carlink_serial::Error) -> Self {
        GatewayError::Transport(e)
    }
}
