use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur in pipe transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The pipe name cannot be mapped to an endpoint.
    #[error("invalid pipe name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// The endpoint did not appear before the deadline.
    #[error("timed out after {0:?} waiting for endpoint")]
    Timeout(Duration),

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

impl TransportError {
    /// Whether a connect attempt failed only because nobody is listening yet.
    pub fn is_endpoint_unavailable(&self) -> bool {
        match self {
            TransportError::Connect { source, .. } => is_unavailable_kind(source.kind()),
            _ => false,
        }
    }
}

pub(crate) fn is_unavailable_kind(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
    )
}

pub type Result<T> = std::result::Result<T, TransportError>;
