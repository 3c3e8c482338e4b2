use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use pipelink_transport::IpcStream;
use tracing::debug;

use crate::codec::{decode_frame, pending_frame_len, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete frames.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached on a
    /// frame boundary and `Err(FrameError::Truncated)` when it cuts a frame.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            let decoded = decode_frame(&mut self.buf, self.config.max_payload_size)
                .inspect_err(|err| {
                    debug!(error = %err, buffered = self.buf.len(), "rejecting frame");
                })?;
            if let Some(frame) = decoded {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(self.eof_error());
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    fn eof_error(&self) -> FrameError {
        if self.buf.is_empty() {
            return FrameError::ConnectionClosed;
        }
        let expected = pending_frame_len(&self.buf)
            .ok()
            .flatten()
            .unwrap_or(crate::codec::HEADER_SIZE);
        debug!(received = self.buf.len(), expected, "stream ended mid-frame");
        FrameError::Truncated {
            received: self.buf.len(),
            expected,
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame decoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<IpcStream> {
    /// Create a frame reader for `IpcStream` and apply read timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

pub(crate) fn transport_to_frame_error(err: pipelink_transport::TransportError) -> FrameError {
    match err {
        pipelink_transport::TransportError::Io(io)
        | pipelink_transport::TransportError::Accept(io) => FrameError::Io(io),
        pipelink_transport::TransportError::Bind { source, .. }
        | pipelink_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::codec::{encode_frame, HEADER_SIZE, MAGIC};
    use crate::kind::{HANDSHAKE, MESSAGE};

    #[test]
    fn read_single_frame() {
        let mut wire = BytesMut::new();
        encode_frame(MESSAGE, b"hello", &mut wire).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.kind, MESSAGE);
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn read_frames_in_order() {
        let mut wire = BytesMut::new();
        encode_frame(HANDSHAKE, b"svc_1", &mut wire).unwrap();
        encode_frame(MESSAGE, b"two", &mut wire).unwrap();
        encode_frame(MESSAGE, b"three", &mut wire).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));

        let f1 = reader.read_frame().unwrap();
        let f2 = reader.read_frame().unwrap();
        let f3 = reader.read_frame().unwrap();

        assert_eq!((f1.kind, f1.payload.as_ref()), (HANDSHAKE, b"svc_1".as_ref()));
        assert_eq!((f2.kind, f2.payload.as_ref()), (MESSAGE, b"two".as_ref()));
        assert_eq!((f3.kind, f3.payload.as_ref()), (MESSAGE, b"three".as_ref()));
    }

    #[test]
    fn read_frame_with_large_payload() {
        let payload = vec![0xAB; 64 * 1024];
        let mut wire = BytesMut::new();
        encode_frame(MESSAGE, &payload, &mut wire).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn partial_read_handling() {
        let mut wire = BytesMut::new();
        encode_frame(MESSAGE, b"slow", &mut wire).unwrap();

        let byte_reader = ByteByByteReader {
            bytes: wire.to_vec(),
            pos: 0,
        };
        let mut reader = FrameReader::new(byte_reader);

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.payload.as_ref(), b"slow");
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
        assert!(err.is_disconnect());
    }

    #[test]
    fn connection_closed_mid_frame_is_truncated() {
        let mut partial = BytesMut::new();
        partial.put_slice(&MAGIC);
        partial.put_u32_le(16);
        partial.put_u16_le(MESSAGE);
        partial.put_slice(b"only-part");

        let mut reader = FrameReader::new(Cursor::new(partial.to_vec()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(
            err,
            FrameError::Truncated {
                received,
                expected
            } if received == HEADER_SIZE + 9 && expected == HEADER_SIZE + 16
        ));
        assert!(!err.is_disconnect());
    }

    #[test]
    fn connection_closed_mid_header_is_truncated() {
        let mut reader = FrameReader::new(Cursor::new(vec![0x50, 0x4C, 0x01]));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Truncated { received: 3, .. }));
    }

    #[test]
    fn invalid_magic_in_stream() {
        let bytes = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::InvalidMagic));
    }

    #[test]
    fn oversized_frame_in_stream() {
        let mut wire = BytesMut::new();
        wire.put_slice(&MAGIC);
        wire.put_u32_le(1024);
        wire.put_u16_le(MESSAGE);

        let cfg = FrameConfig {
            max_payload_size: 16,
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config(Cursor::new(wire.to_vec()), cfg);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }

    #[derive(Debug)]
    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }

            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn roundtrip_over_pipe() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        writer.send(MESSAGE, b"ping").unwrap();
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.kind, MESSAGE);
        assert_eq!(frame.payload.as_ref(), b"ping");
    }

    #[test]
    fn concurrent_reader_writer_threads() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        let reader_thread = std::thread::spawn(move || {
            for expected in 0..64u32 {
                let frame = reader.read_frame().unwrap();
                assert_eq!(frame.payload.as_ref(), format!("msg-{expected}").as_bytes());
            }
        });

        for i in 0..64u32 {
            writer.send(MESSAGE, format!("msg-{i}").as_bytes()).unwrap();
        }

        reader_thread.join().unwrap();
    }

    #[test]
    fn read_would_block_propagates_io_error() {
        let reader = WouldBlockReader;
        let mut framed = FrameReader::new(reader);
        let err = framed.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::WouldBlock));
    }

    struct WouldBlockReader;

    impl Read for WouldBlockReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::WouldBlock))
        }
    }

    #[test]
    fn interrupted_read_retries() {
        let mut wire = BytesMut::new();
        encode_frame(MESSAGE, b"ok", &mut wire).unwrap();

        let reader = InterruptedThenData {
            interrupted: false,
            inner: Cursor::new(wire.to_vec()),
        };
        let mut framed = FrameReader::new(reader);
        let frame = framed.read_frame().unwrap();

        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    struct InterruptedThenData {
        interrupted: bool,
        inner: Cursor<Vec<u8>>,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.inner.read(buf)
        }
    }

    #[test]
    fn applies_read_timeout_for_ipc_stream() {
        let (left, _right) = IpcStream::pair().unwrap();
        let cfg = FrameConfig {
            read_timeout: Some(std::time::Duration::from_millis(10)),
            ..FrameConfig::default()
        };

        let mut reader = FrameReader::with_config_ipc(left, cfg).unwrap();
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(
            err,
            FrameError::Io(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
        ));
    }
}
