//! Worker process supervision.
//!
//! [`ProcessSupervisor`] launches a worker from a command line, watches it
//! on a fixed interval, restarts it after a crash and stops it with a
//! graceful-then-forced sequence. Every transition is published as a
//! [`ProcessEvent`].

pub mod command;
pub mod error;
pub mod launcher;
pub mod supervisor;

pub use command::CommandLine;
pub use error::{Result, SupervisorError};
pub use launcher::{ExitInfo, Launcher, OutputMode, SystemLauncher, Worker};
pub use supervisor::{ProcessEvent, ProcessState, ProcessSupervisor, StopOutcome, SupervisorConfig};
