//! Supervised local worker processes spoken to over delimiter-framed IPC.
//!
//! A client launches a worker, keeps it alive, connects to it over a Unix
//! domain socket or its stdio pipes, and exchanges `0x17`-terminated
//! telegrams with it.
//!
//! # Crate Structure
//!
//! - [`transport`]: connections (UDS, pipes) and event fan-out
//! - [`frame`]: telegram reassembly and blocking/async framing helpers
//! - [`process`]: worker supervision with crash detection and restart
//! - [`session`]: the client session tying the three together

/// Re-export transport types.
pub mod transport {
    pub use ipalink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use ipalink_frame::*;
}

/// Re-export supervisor types.
pub mod process {
    pub use ipalink_process::*;
}

/// Re-export session types.
pub mod session {
    pub use ipalink_session::*;
}

pub use ipalink_session::{ClientSession, SessionConfig, SessionEvent, TransportConfig};
