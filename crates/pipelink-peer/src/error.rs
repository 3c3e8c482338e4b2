use std::time::Duration;

/// Errors that can occur in connection, server and client operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] pipelink_transport::TransportError),

    /// Frame-level error, including payload (de)serialization.
    #[error("frame error: {0}")]
    Frame(#[from] pipelink_frame::FrameError),

    /// Rendezvous handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Peer disconnected.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// An operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A background thread could not be started.
    #[error("failed to spawn worker '{name}': {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    /// A background worker panicked.
    #[error("worker '{name}' panicked: {message}")]
    WorkerPanicked { name: String, message: String },

    /// The server is already running.
    #[error("already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, PeerError>;
