use std::fmt;
use std::io::{Read, Write};
use std::sync::{Mutex, PoisonError};

use tracing::{info, warn};

use crate::connection::{Connection, ConnectionEvent, Link, LinkSlot};
use crate::error::{Result, TransportError};
use crate::events::Subscribers;

const TRANSPORT_NAME: &str = "pipe";

/// The two ends of a byte pipe to a worker, usually its stdout and stdin.
pub struct PipeEnds {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

impl PipeEnds {
    pub fn new(reader: impl Read + Send + 'static, writer: impl Write + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl fmt::Debug for PipeEnds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeEnds").finish_non_exhaustive()
    }
}

type PipeSource = Box<dyn FnMut() -> std::io::Result<PipeEnds> + Send>;

/// Connection over a pair of pipes.
///
/// Each `connect` asks the source for fresh ends, so a restarted worker is
/// picked up by connecting again. Disconnecting closes the write end, which
/// the worker sees as EOF on its stdin once no write is in progress.
pub struct PipeConnection {
    source: Mutex<PipeSource>,
    events: Subscribers<ConnectionEvent>,
    link: LinkSlot<Box<dyn Write + Send>>,
}

impl PipeConnection {
    /// Create a connection that obtains its pipe ends from `source` on
    /// every connect.
    pub fn new(source: impl FnMut() -> std::io::Result<PipeEnds> + Send + 'static) -> Self {
        Self {
            source: Mutex::new(Box::new(source)),
            events: Subscribers::new(),
            link: LinkSlot::new(),
        }
    }

    /// Create a connection over one fixed pair of streams. Connecting a
    /// second time fails.
    pub fn from_streams(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        let mut ends = Some(PipeEnds::new(reader, writer));
        Self::new(move || {
            ends.take().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotConnected, "pipe already consumed")
            })
        })
    }
}

impl Connection for PipeConnection {
    fn connect(&self) -> Result<()> {
        let (_connecting, epoch) = self.link.begin_connect();
        if self.link.is_connected() {
            return Ok(());
        }

        let ends = {
            let mut source = self.source.lock().unwrap_or_else(PoisonError::into_inner);
            (*source)()
        }
        .map_err(|source| TransportError::Connect {
            endpoint: TRANSPORT_NAME.to_string(),
            source,
        })?;
        if self.link.cancelled_since(epoch) {
            return Err(cancelled());
        }
        self.link.install(Link::open(
            TRANSPORT_NAME,
            ends.reader,
            ends.writer,
            &self.events,
        )?);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        let link = self.link.current().ok_or(TransportError::NotConnected)?;
        if let Err(err) = link.write(bytes) {
            warn!(error = %err, "pipe write failed, disconnecting");
            if self.link.remove(&link) && link.close(&self.events) {
                info!("pipe disconnected");
            }
            return Err(TransportError::Io(err));
        }
        Ok(())
    }

    fn disconnect(&self) {
        if let Some(link) = self.link.take() {
            if link.close(&self.events) {
                info!("pipe disconnected");
            }
        }
    }

    fn events(&self) -> &Subscribers<ConnectionEvent> {
        &self.events
    }

    fn transport_name(&self) -> &'static str {
        TRANSPORT_NAME
    }
}

fn cancelled() -> TransportError {
    TransportError::Connect {
        endpoint: TRANSPORT_NAME.to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "disconnected while connecting",
        ),
    }
}

impl Drop for PipeConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
