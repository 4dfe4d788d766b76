use std::io::{ErrorKind, Read};

use crate::byte_array::ByteArray;
use crate::error::{FrameError, Result};
use crate::telegram::{TelegramBuffer, DEFAULT_CAPACITY};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete telegrams from any `Read` stream.
///
/// Handles partial reads internally; callers always get whole telegrams,
/// delimiter stripped.
pub struct TelegramReader<T> {
    inner: T,
    buffer: TelegramBuffer,
    /// Overflow held back until the frames read before it are returned.
    overflow: Option<FrameError>,
}

impl<T: Read> TelegramReader<T> {
    /// Create a new reader with the default capacity.
    pub fn new(inner: T) -> Self {
        Self::with_capacity(inner, DEFAULT_CAPACITY)
    }

    /// Create a new reader bounding undelimited data to `capacity` bytes.
    pub fn with_capacity(inner: T, capacity: usize) -> Self {
        Self {
            inner,
            buffer: TelegramBuffer::new(capacity),
            overflow: None,
        }
    }

    /// Read the next complete telegram (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached, even
    /// if an unterminated telegram was pending. An overflow is reported once
    /// the telegrams read in the same chunk have been returned.
    pub fn read_frame(&mut self) -> Result<ByteArray> {
        loop {
            if let Some(frame) = self.buffer.next_frame() {
                return Ok(frame);
            }
            if let Some(err) = self.overflow.take() {
                return Err(err);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            if let Err(err) = self.buffer.append(&chunk[..read]) {
                self.overflow = Some(err);
            }
        }
    }

    /// Bytes read past the last complete telegram.
    pub fn pending(&self) -> &ByteArray {
        self.buffer.data()
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
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn read_single_frame() {
        let mut reader = TelegramReader::new(Cursor::new(b"hello\x17".to_vec()));
        let frame = reader.read_frame().unwrap();
        assert_eq!(frame, "hello");
    }

    #[test]
    fn read_multiple_frames() {
        let mut reader = TelegramReader::new(Cursor::new(b"one\x17two\x17three\x17".to_vec()));

        assert_eq!(reader.read_frame().unwrap(), "one");
        assert_eq!(reader.read_frame().unwrap(), "two");
        assert_eq!(reader.read_frame().unwrap(), "three");
        assert!(matches!(
            reader.read_frame().unwrap_err(),
            FrameError::ConnectionClosed
        ));
    }

    #[test]
    fn read_frame_with_large_payload() {
        let mut wire = vec![0xAB; 64 * 1024];
        wire.push(crate::DELIMITER);

        let mut reader = TelegramReader::new(Cursor::new(wire));
        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.len(), 64 * 1024);
        assert!(frame.iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn partial_read_handling() {
        let byte_reader = ByteByByteReader {
            bytes: b"slow\x17".to_vec(),
            pos: 0,
        };
        let mut reader = TelegramReader::new(byte_reader);
        assert_eq!(reader.read_frame().unwrap(), "slow");
    }

    #[test]
    fn connection_closed_mid_frame() {
        let mut reader = TelegramReader::new(Cursor::new(b"only-part".to_vec()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
        assert_eq!(reader.pending().to_string(), "only-part");
    }

    #[test]
    fn oversized_frame_in_stream() {
        let mut reader = TelegramReader::with_capacity(Cursor::new(vec![b'x'; 1024]), 16);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Overflow { capacity: 16, .. }));
    }

    #[test]
    fn frames_before_overflow_are_returned_first() {
        let mut reader = TelegramReader::with_capacity(
            Cursor::new(b"ok\x17next\x17this-is-way-too-long".to_vec()),
            4,
        );
        assert_eq!(reader.read_frame().unwrap(), "ok");
        assert_eq!(reader.read_frame().unwrap(), "next");
        assert!(matches!(
            reader.read_frame().unwrap_err(),
            FrameError::Overflow { capacity: 4, .. }
        ));
    }

    #[test]
    fn interrupted_read_retries() {
        let reader = InterruptedThenData {
            state: 0,
            bytes: b"ok\x17".to_vec(),
            pos: 0,
        };
        let mut framed = TelegramReader::new(reader);
        assert_eq!(framed.read_frame().unwrap(), "ok");
    }

    #[test]
    #[cfg(unix)]
    fn roundtrip_over_socket_pair() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut writer = crate::writer::TelegramWriter::new(left);
        let mut reader = TelegramReader::new(right);

        writer.send(b"ping").unwrap();
        writer.send(b"pong").unwrap();
        assert_eq!(reader.read_frame().unwrap(), "ping");
        assert_eq!(reader.read_frame().unwrap(), "pong");
    }

    #[test]
    fn accessors_and_into_inner() {
        let mut reader = TelegramReader::new(Cursor::new(Vec::<u8>::new()));
        let _ = reader.get_ref();
        let _ = reader.get_mut();
        let _inner = reader.into_inner();
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

    struct InterruptedThenData {
        state: u8,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.state == 0 {
                self.state = 1;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            let n = (self.bytes.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }
}
