//! Typed message streams on top of frames.
//!
//! [`ObjectWriter::write_object`] turns one value into exactly one `MESSAGE`
//! frame; [`ObjectReader::read_object`] turns one frame back into one value.
//! End of stream is reported as `Ok(None)` so callers can treat it as the
//! peer hanging up rather than as a failure.

use std::io::{Read, Write};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FrameError, Result};
use crate::kind::{HANDSHAKE, MESSAGE};
use crate::reader::FrameReader;
use crate::serializer::PayloadCodec;
use crate::writer::FrameWriter;

/// Writes typed values as frames.
pub struct ObjectWriter<W, C> {
    frames: FrameWriter<W>,
    codec: C,
}

impl<W: Write, C: PayloadCodec> ObjectWriter<W, C> {
    pub fn new(frames: FrameWriter<W>, codec: C) -> Self {
        Self { frames, codec }
    }

    /// Serialize `value` and write it as one frame.
    ///
    /// Returns once the whole frame has been handed to the stream and flushed.
    /// A value that fails to serialize leaves the stream untouched.
    pub fn write_object<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let payload = self.codec.encode(value)?;
        self.frames.send(MESSAGE, &payload)
    }

    /// Write a handshake record.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        let payload = self.codec.encode(value)?;
        self.frames.send(HANDSHAKE, &payload)
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn get_ref(&self) -> &W {
        self.frames.get_ref()
    }

    pub fn into_inner(self) -> FrameWriter<W> {
        self.frames
    }
}

/// Reads typed values from frames.
pub struct ObjectReader<R, T, C> {
    frames: FrameReader<R>,
    codec: C,
    _message: PhantomData<fn() -> T>,
}

impl<R: Read, T: DeserializeOwned, C: PayloadCodec> ObjectReader<R, T, C> {
    pub fn new(frames: FrameReader<R>, codec: C) -> Self {
        Self {
            frames,
            codec,
            _message: PhantomData,
        }
    }

    /// Block until the next value arrives.
    ///
    /// Returns `Ok(None)` when the peer closed the stream or the pipe broke.
    /// A frame that does not decode as `T` is an error; the stream stays
    /// aligned and the next call reads the following frame.
    pub fn read_object(&mut self) -> Result<Option<T>> {
        let frame = match self.frames.read_frame() {
            Ok(frame) => frame,
            Err(err) if err.is_disconnect() => return Ok(None),
            Err(err) => return Err(err),
        };

        if frame.kind != MESSAGE {
            return Err(FrameError::UnexpectedKind {
                expected: MESSAGE,
                got: frame.kind,
            });
        }

        self.codec.decode(&frame.payload).map(Some)
    }

    /// Block until a handshake record arrives.
    pub fn read_string(&mut self) -> Result<Option<String>> {
        let frame = match self.frames.read_frame() {
            Ok(frame) => frame,
            Err(err) if err.is_disconnect() => return Ok(None),
            Err(err) => return Err(err),
        };

        if frame.kind != HANDSHAKE {
            return Err(FrameError::UnexpectedKind {
                expected: HANDSHAKE,
                got: frame.kind,
            });
        }

        self.codec.decode(&frame.payload).map(Some)
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn get_ref(&self) -> &R {
        self.frames.get_ref()
    }

    pub fn into_inner(self) -> FrameReader<R> {
        self.frames
    }
}
