//! Delimiter-terminated telegram framing for IPC byte streams.
//!
//! Every telegram on the wire is an opaque payload followed by a single
//! [`DELIMITER`] byte (`0x17`, ASCII ETB). There is no header, length prefix
//! or checksum: a telegram is complete only once its terminator has been seen,
//! so partial reads never surface as partial frames.
//!
//! - [`ByteArray`] is the owned unit of transport data.
//! - [`TelegramBuffer`] reassembles frames from arbitrarily split chunks.
//! - [`TelegramReader`] / [`TelegramWriter`] wrap blocking `Read`/`Write` streams.
//! - `TelegramCodec` (feature `async`) plugs the same framing into `tokio_util::codec`.

pub mod byte_array;
#[cfg(feature = "async")]
pub mod codec;
pub mod error;
pub mod reader;
pub mod telegram;
pub mod writer;

pub use byte_array::ByteArray;
#[cfg(feature = "async")]
pub use codec::TelegramCodec;
pub use error::{FrameError, Result};
pub use reader::TelegramReader;
pub use telegram::{encode_telegram, TelegramBuffer, DEFAULT_CAPACITY, DELIMITER};
pub use writer::TelegramWriter;
