/// Errors surfaced by [`ProcessSupervisor`](crate::ProcessSupervisor).
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The command line contained no program.
    #[error("empty command line")]
    InvalidCommand,

    /// The OS refused to start the worker.
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },

    /// `start` was called while a worker is still active.
    #[error("worker already running")]
    AlreadyRunning,

    #[error("supervisor I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
