use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

use crate::byte_array::ByteArray;
use crate::error::{FrameError, Result};

/// Telegram terminator: ASCII ETB (end of transmission block).
pub const DELIMITER: u8 = 0x17;

/// Default bound on undelimited data: 16 MiB.
pub const DEFAULT_CAPACITY: usize = 16 * 1024 * 1024;

/// Encode a payload into the wire format by appending the delimiter.
///
/// Wire format:
/// ```text
/// ┌──────────────────────────┬───────────┐
/// │ Payload (any length)     │ 0x17 (1B) │
/// └──────────────────────────┴───────────┘
/// ```
///
/// Payloads containing the delimiter are rejected, since the receiver would
/// split them into two telegrams.
pub fn encode_telegram(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if let Some(offset) = payload.iter().position(|b| *b == DELIMITER) {
        return Err(FrameError::DelimiterInPayload { offset });
    }
    dst.reserve(payload.len() + 1);
    dst.put_slice(payload);
    dst.put_u8(DELIMITER);
    Ok(())
}

/// Accumulates raw stream bytes and hands out complete telegrams.
///
/// Bytes that have not yet been terminated by [`DELIMITER`] stay in the
/// residual buffer, which is bounded by `capacity`. Completed telegrams are
/// queued in arrival order until [`TelegramBuffer::take_frames`] drains them.
///
/// Not meant for concurrent writers: one reader feeds a given buffer.
#[derive(Debug)]
pub struct TelegramBuffer {
    residual: ByteArray,
    frames: VecDeque<ByteArray>,
    capacity: usize,
    /// Set after an overflow: input is dropped up to and including the next
    /// delimiter so the tail of an oversized telegram never becomes a frame.
    resyncing: bool,
}

impl TelegramBuffer {
    /// Create a buffer whose residual never exceeds `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            residual: ByteArray::with_capacity(capacity.min(ByteArray::DEFAULT_SIZE_HINT)),
            frames: VecDeque::new(),
            capacity,
            resyncing: false,
        }
    }

    /// Feed a chunk of stream bytes.
    ///
    /// Every delimiter found closes one telegram. On overflow the residual is
    /// discarded and [`FrameError::Overflow`] is returned after the whole
    /// chunk has been scanned; telegrams completed before the overflow remain
    /// queued.
    pub fn append(&mut self, chunk: &[u8]) -> Result<()> {
        let mut overflow = None;
        let mut rest = chunk;

        loop {
            let split = rest.iter().position(|b| *b == DELIMITER);
            let segment = match split {
                Some(idx) => &rest[..idx],
                None => rest,
            };
            let terminated = split.is_some();

            if self.resyncing {
                if terminated {
                    debug!("telegram stream resynchronized on delimiter");
                    self.resyncing = false;
                }
            } else if self.residual.len() + segment.len() > self.capacity {
                let size = self.residual.len() + segment.len();
                warn!(
                    size,
                    capacity = self.capacity,
                    "telegram buffer overflow, dropping undelimited data"
                );
                self.residual.clear();
                self.resyncing = !terminated;
                overflow.get_or_insert(FrameError::Overflow {
                    size,
                    capacity: self.capacity,
                });
            } else {
                self.residual.append(segment);
                if terminated {
                    let frame = self.residual.split_to(self.residual.len());
                    self.frames.push_back(frame);
                }
            }

            match split {
                Some(idx) => rest = &rest[idx + 1..],
                None => break,
            }
        }

        match overflow {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drain every completed telegram, oldest first. The residual is untouched.
    pub fn take_frames(&mut self) -> Vec<ByteArray> {
        self.frames.drain(..).collect()
    }

    /// Pop the oldest completed telegram, if any.
    pub fn next_frame(&mut self) -> Option<ByteArray> {
        self.frames.pop_front()
    }

    /// Bytes received but not yet terminated.
    pub fn data(&self) -> &ByteArray {
        &self.residual
    }

    /// Discard the residual, any undrained telegrams and any pending resync.
    pub fn clear(&mut self) {
        self.residual.clear();
        self.frames.clear();
        self.resyncing = false;
    }

    /// True when there is neither residual data nor a queued telegram.
    pub fn is_empty(&self) -> bool {
        self.residual.is_empty() && self.frames.is_empty()
    }

    /// Number of completed telegrams waiting in the queue.
    pub fn pending_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether input is being dropped until the next delimiter.
    pub fn is_resyncing(&self) -> bool {
        self.resyncing
    }
}

impl Default for TelegramBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
