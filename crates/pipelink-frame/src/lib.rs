//! Length-prefixed typed message framing.
//!
//! Every message on a pipe is one frame:
//! - A 2-byte magic number ("PL") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian frame kind (handshake record or message)
//!
//! Payloads are produced by a pluggable [`PayloadCodec`]. The
//! [`ObjectReader`]/[`ObjectWriter`] pair hides framing entirely: one value
//! in, one frame out, and a clean `None` when the peer hangs up.

pub mod codec;
pub mod error;
pub mod kind;
pub mod object;
pub mod reader;
pub mod serializer;
pub mod writer;

pub use codec::{decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use error::{FrameError, Result};
pub use kind::{kind_name, HANDSHAKE, MESSAGE, USER_KIND_START};
pub use object::{ObjectReader, ObjectWriter};
pub use reader::FrameReader;
pub use serializer::{BincodeCodec, JsonCodec, PayloadCodec};
pub use writer::FrameWriter;
