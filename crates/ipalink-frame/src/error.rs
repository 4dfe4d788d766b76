/// Errors that can occur while framing or deframing telegrams.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Undelimited data grew past the configured buffer capacity.
    #[error("telegram buffer overflow ({size} bytes pending, capacity {capacity})")]
    Overflow { size: usize, capacity: usize },

    /// An outgoing payload contains the delimiter byte and would be split in two.
    #[error("payload contains telegram delimiter at offset {offset}")]
    DelimiterInPayload { offset: usize },

    /// An I/O error occurred while reading or writing telegrams.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream was closed before a complete telegram was received.
    #[error("connection closed (incomplete telegram)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
