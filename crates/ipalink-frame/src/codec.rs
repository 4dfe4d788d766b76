use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::byte_array::ByteArray;
use crate::error::FrameError;
use crate::telegram::{encode_telegram, TelegramBuffer, DEFAULT_CAPACITY};

/// `tokio_util` codec for delimiter-terminated telegrams.
///
/// Decoding moves every received byte into an internal [`TelegramBuffer`],
/// so overflow and resync behave exactly as in the blocking path. Frames
/// completed in the overflowing chunk are yielded first, then the error.
#[derive(Debug, Default)]
pub struct TelegramCodec {
    buffer: TelegramBuffer,
    overflow: Option<FrameError>,
}

impl TelegramCodec {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: TelegramBuffer::new(capacity),
            overflow: None,
        }
    }
}

impl Decoder for TelegramCodec {
    type Item = ByteArray;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ByteArray>, FrameError> {
        if let Some(frame) = self.buffer.next_frame() {
            return Ok(Some(frame));
        }
        if let Some(err) = self.overflow.take() {
            return Err(err);
        }
        if src.is_empty() {
            return Ok(None);
        }

        let chunk = src.split();
        if let Err(err) = self.buffer.append(&chunk) {
            match self.buffer.next_frame() {
                Some(frame) => {
                    self.overflow = Some(err);
                    return Ok(Some(frame));
                }
                None => return Err(err),
            }
        }
        Ok(self.buffer.next_frame())
    }
}

impl<B: AsRef<[u8]>> Encoder<B> for TelegramCodec {
    type Error = FrameError;

    fn encode(&mut self, item: B, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode_telegram(item.as_ref(), dst)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;

    #[test]
    fn decode_across_split_chunks() {
        let mut codec = TelegramCodec::new();
        let mut src = BytesMut::from(&b"par"[..]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(src.is_empty());

        src.extend_from_slice(b"tial\x17next\x17");
        assert_eq!(codec.decode(&mut src).unwrap().unwrap(), "partial");
        assert_eq!(codec.decode(&mut src).unwrap().unwrap(), "next");
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn decode_reports_overflow() {
        let mut codec = TelegramCodec::with_capacity(3);
        let mut src = BytesMut::from(&b"abcdef"[..]);
        let err = codec.decode(&mut src).unwrap_err();
        assert!(matches!(err, FrameError::Overflow { .. }));
    }

    #[test]
    fn decode_yields_earlier_frames_before_overflow() {
        let mut codec = TelegramCodec::with_capacity(4);
        let mut src = BytesMut::from(&b"ok\x17this-is-way-too-long"[..]);
        assert_eq!(codec.decode(&mut src).unwrap().unwrap(), "ok");
        let err = codec.decode(&mut src).unwrap_err();
        assert!(matches!(err, FrameError::Overflow { .. }));
    }

    #[test]
    fn encode_appends_delimiter() {
        let mut codec = TelegramCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(&b"cmd"[..], &mut dst).unwrap();
        assert_eq!(dst.as_ref(), b"cmd\x17");
    }

    #[tokio::test]
    async fn framed_read_delivers_frames_before_overflow() {
        let mut stream = FramedRead::new(
            &b"ok\x17this-is-way-too-long"[..],
            TelegramCodec::with_capacity(4),
        );

        assert_eq!(stream.next().await.unwrap().unwrap(), "ok");
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(FrameError::Overflow { .. })
        ));
    }

    #[tokio::test]
    async fn framed_roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(16);
        let mut sink = FramedWrite::new(client, TelegramCodec::new());
        let mut stream = FramedRead::new(server, TelegramCodec::new());

        let writer = tokio::spawn(async move {
            sink.send(&b"{\"JOB_ID\":\"1\"}"[..]).await.unwrap();
            sink.send(&b"second telegram longer than the pipe"[..])
                .await
                .unwrap();
        });

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first, "{\"JOB_ID\":\"1\"}");
        assert_eq!(second, "second telegram longer than the pipe");

        writer.await.unwrap();
        assert!(stream.next().await.is_none());
    }
}
