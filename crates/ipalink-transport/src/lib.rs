//! Local IPC transports with ordered event delivery.
//!
//! Provides one [`Connection`] interface over different local mechanisms:
//! - Unix domain sockets ([`SocketConnection`], Linux/macOS)
//! - Process pipes ([`PipeConnection`], a worker's stdin/stdout)
//!
//! Connection-state changes and received bytes are published on a single
//! ordered [`ConnectionEvent`] stream per connection, fanned out through
//! [`Subscribers`].

pub mod connection;
pub mod error;
pub mod events;
pub mod pipe;

#[cfg(unix)]
pub mod uds;

pub use connection::{Connection, ConnectionEvent};
pub use error::{Result, TransportError};
pub use events::Subscribers;
pub use pipe::{PipeConnection, PipeEnds};

#[cfg(unix)]
pub use uds::{SocketConnection, SocketListener};
