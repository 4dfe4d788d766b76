use std::path::PathBuf;

/// Errors that can occur in session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] ipalink_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] ipalink_frame::FrameError),

    /// Worker supervision error.
    #[error("process error: {0}")]
    Process(#[from] ipalink_process::SupervisorError),

    /// No open connection to the worker.
    #[error("not connected to worker")]
    NotConnected,

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A response telegram lacks a field or carries a malformed one.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Config {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The session dispatcher is gone.
    #[error("session closed")]
    Closed,

    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
