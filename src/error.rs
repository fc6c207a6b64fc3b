//! Error types for agentvm.

use thiserror::Error;

/// Result type alias using agentvm's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Infrastructure errors raised by collaborators (Firecracker API, vsock,
/// host reclaim) and by configuration handling.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load the configuration file.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// The Firecracker API answered with a non-success status.
    #[error("firecracker API {method} {path} failed: {status} - {body}")]
    Api {
        /// HTTP method.
        method: String,
        /// Request path.
        path: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// HTTP transport failure talking to the Firecracker API.
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Guest protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation timed out.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Operation not supported on this platform.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

impl From<agentvm_protocol::DecodeError> for Error {
    fn from(e: agentvm_protocol::DecodeError) -> Self {
        Error::Protocol(e.to_string())
    }
}
