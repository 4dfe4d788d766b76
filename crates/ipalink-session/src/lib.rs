//! Client session for a supervised local worker.
//!
//! [`ClientSession`] owns a [`ProcessSupervisor`](ipalink_process::ProcessSupervisor),
//! a [`Connection`](ipalink_transport::Connection) to the worker and the
//! [`TelegramBuffer`](ipalink_frame::TelegramBuffer) that reassembles its
//! replies. Consumers issue commands and observe one ordered stream of
//! [`SessionEvent`]s.

pub mod config;
pub mod error;
pub mod request;
pub mod session;

pub use config::{SessionConfig, TransportConfig};
pub use error::{Result, SessionError};
pub use request::{Command, OptionList, Request, RequestBuilder, Response, MAX_PATH_COUNT};
pub use session::{ClientSession, SessionEvent};
