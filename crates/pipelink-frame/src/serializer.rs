//! Pluggable payload serializers.
//!
//! The framing layer moves opaque bytes; a [`PayloadCodec`] decides how a typed
//! message becomes those bytes. Both peers must use the same codec. The codec
//! is chosen by type parameter and handed in at construction, so message
//! types stay checked at compile time and no runtime type inspection happens.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FrameError, Result};

/// Serializes typed values into frame payloads and back.
pub trait PayloadCodec: Clone + Send + Sync + 'static {
    /// Short codec name for diagnostics.
    fn name(&self) -> &'static str;

    /// Serialize `value` into a payload.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize a payload. Never returns a partially decoded value.
    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T>;
}

/// Compact binary encoding via `bincode`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl PayloadCodec for BincodeCodec {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|err| codec_error(self.name(), err))
    }

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        // Same layout as `bincode::serialize`, but leftover bytes mean the
        // peer sent a different type and are rejected.
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .reject_trailing_bytes()
            .deserialize(payload)
            .map_err(|err| codec_error(self.name(), err))
    }
}

/// Self-describing JSON encoding via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|err| codec_error(self.name(), err))
    }

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        serde_json::from_slice(payload).map_err(|err| codec_error(self.name(), err))
    }
}

fn codec_error(codec: &'static str, err: impl std::fmt::Display) -> FrameError {
    FrameError::Codec {
        codec,
        message: err.to_string(),
    }
}
