//! Rendezvous handshake: hand a new client the name of its private data pipe.
//!
//! The server accepts on the well-known rendezvous name, allocates
//! `{rendezvous}_{n}`, binds it, and writes the name back as a single
//! `HANDSHAKE` frame. The client reads that one frame, hangs up, and connects
//! to the data pipe.

use std::io::ErrorKind;
use std::time::Duration;

use pipelink_frame::{
    FrameConfig, FrameError, FrameReader, FrameWriter, ObjectReader, ObjectWriter, PayloadCodec,
};
use pipelink_transport::{validate_pipe_name, IpcStream};
use tracing::debug;

use crate::error::{PeerError, Result};

/// Handshake timing and limits.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Bound on each blocking handshake step.
    pub timeout: Duration,
    /// Pause between attempts to reach the data pipe.
    pub retry_interval: Duration,
    /// Largest accepted handshake frame payload, in bytes.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(50),
            max_handshake_payload: 1024,
        }
    }
}

/// Name of the `sequence`-th data pipe allocated behind `rendezvous`.
pub fn data_pipe_name(rendezvous: &str, sequence: u64) -> String {
    format!("{rendezvous}_{sequence}")
}

/// Server side: write the data pipe name to a freshly accepted rendezvous stream.
pub fn send_pipe_name<C: PayloadCodec>(
    stream: &IpcStream,
    pipe_name: &str,
    codec: &C,
    config: &HandshakeConfig,
) -> Result<()> {
    let frames = FrameWriter::with_config_ipc(stream.try_clone()?, handshake_frames(config))?;
    let mut writer = ObjectWriter::new(frames, codec.clone());
    writer
        .write_string(pipe_name)
        .map_err(|err| handshake_error(err, config.timeout))?;
    debug!(pipe = pipe_name, "sent data pipe name");
    Ok(())
}

/// Client side: read the data pipe name from the rendezvous stream.
///
/// The name must belong to `rendezvous`, i.e. look like `{rendezvous}_{n}`.
pub fn recv_pipe_name<C: PayloadCodec>(
    stream: &IpcStream,
    rendezvous: &str,
    codec: &C,
    config: &HandshakeConfig,
) -> Result<String> {
    let frames = FrameReader::with_config_ipc(stream.try_clone()?, handshake_frames(config))?;
    let mut reader: ObjectReader<IpcStream, String, C> = ObjectReader::new(frames, codec.clone());

    let name = match reader.read_string() {
        Ok(Some(name)) => name,
        Ok(None) => {
            return Err(PeerError::Disconnected(
                "server closed the rendezvous pipe before naming a data pipe".to_string(),
            ))
        }
        Err(err) => return Err(handshake_error(err, config.timeout)),
    };

    check_pipe_name(rendezvous, &name)?;
    debug!(pipe = %name, "received data pipe name");
    Ok(name)
}

fn handshake_frames(config: &HandshakeConfig) -> FrameConfig {
    FrameConfig {
        max_payload_size: config.max_handshake_payload,
        read_timeout: Some(config.timeout),
        write_timeout: Some(config.timeout),
    }
}

fn handshake_error(err: FrameError, timeout: Duration) -> PeerError {
    match err {
        FrameError::Io(io) if matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            PeerError::Timeout(timeout)
        }
        FrameError::Codec { .. }
        | FrameError::UnexpectedKind { .. }
        | FrameError::PayloadTooLarge { .. }
        | FrameError::InvalidMagic => PeerError::HandshakeFailed(err.to_string()),
        other => PeerError::Frame(other),
    }
}

fn check_pipe_name(rendezvous: &str, name: &str) -> Result<()> {
    let sequence = name
        .strip_prefix(rendezvous)
        .and_then(|rest| rest.strip_prefix('_'))
        .ok_or_else(|| {
            PeerError::HandshakeFailed(format!(
                "data pipe '{name}' does not belong to '{rendezvous}'"
            ))
        })?;

    if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PeerError::HandshakeFailed(format!(
            "data pipe '{name}' has no sequence number"
        )));
    }

    validate_pipe_name(name)?;
    Ok(())
}
