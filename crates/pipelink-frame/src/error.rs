/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x504C \"PL\")")]
    InvalidMagic,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended cleanly between two frames.
    #[error("connection closed")]
    ConnectionClosed,

    /// The stream ended in the middle of a frame.
    #[error("connection closed mid-frame ({received} of {expected} bytes)")]
    Truncated { received: usize, expected: usize },

    /// A frame of one kind arrived where another was expected.
    #[error(
        "unexpected {} frame (kind {got}, expected {})",
        named(.got),
        named(.expected)
    )]
    UnexpectedKind { expected: u16, got: u16 },

    /// The payload could not be serialized or deserialized.
    #[error("{codec} codec error: {message}")]
    Codec {
        codec: &'static str,
        message: String,
    },
}

impl FrameError {
    /// Whether this error means the peer is gone rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::ConnectionClosed => true,
            FrameError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Whether the byte stream is still aligned on a frame boundary.
    ///
    /// Codec and kind errors leave the stream usable; everything else does not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FrameError::Codec { .. } | FrameError::UnexpectedKind { .. }
        )
    }
}

fn named(kind: &u16) -> &'static str {
    crate::kind::kind_name(*kind)
}

pub type Result<T> = std::result::Result<T, FrameError>;
