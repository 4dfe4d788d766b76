use std::io::ErrorKind;
use std::net::Shutdown;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionEvent, Link, LinkSlot};
use crate::error::{Result, TransportError};
use crate::events::Subscribers;

const TRANSPORT_NAME: &str = "unix-socket";

/// Unix `sockaddr_un.sun_path` is 108 bytes on Linux, 104 on macOS.
#[cfg(target_os = "linux")]
const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_PATH_LEN: usize = 104;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

fn check_path_len(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len >= MAX_PATH_LEN {
        return Err(TransportError::PathTooLong {
            path: path.to_path_buf(),
            len,
            max: MAX_PATH_LEN,
        });
    }
    Ok(())
}

/// Worker-side listening socket.
///
/// Replaces a stale socket file left at `path` and removes its own socket
/// file on drop, unless something else has since taken the path over.
pub struct SocketListener {
    listener: UnixListener,
    path: PathBuf,
    identity: (u64, u64),
}

impl SocketListener {
    /// Permission mode applied to the socket file.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        check_path_len(&path)?;
        let bind_err = |source| TransportError::Bind {
            path: path.clone(),
            source,
        };

        match std::fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.file_type().is_socket() => {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(bind_err)?;
            }
            Ok(_) => {
                return Err(bind_err(std::io::Error::new(
                    ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(bind_err(err)),
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(bind_err)?;
        let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening on unix socket");
        Ok(Self {
            listener,
            path,
            identity: (metadata.dev(), metadata.ino()),
        })
    }

    /// Accept one client (blocking).
    pub fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted connection");
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        let Ok(metadata) = std::fs::symlink_metadata(&self.path) else {
            return;
        };
        if metadata.file_type().is_socket() && (metadata.dev(), metadata.ino()) == self.identity {
            debug!(path = ?self.path, "removing socket file");
            let _ = std::fs::remove_file(&self.path);
        } else {
            debug!(path = ?self.path, "socket path replaced; leaving it alone");
        }
    }
}

/// Client connection to a worker listening on a Unix domain socket.
///
/// `connect` keeps retrying for up to `connect_timeout` while the socket is
/// missing or refusing, which covers a worker that is still starting up.
/// A write that cannot complete within `write_timeout` fails and drops the
/// connection.
pub struct SocketConnection {
    path: PathBuf,
    connect_timeout: Duration,
    write_timeout: Duration,
    events: Subscribers<ConnectionEvent>,
    link: LinkSlot<UnixStream>,
}

impl SocketConnection {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
    pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(5000);

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            write_timeout: Self::DEFAULT_WRITE_TIMEOUT,
            events: Subscribers::new(),
            link: LinkSlot::new(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// A zero duration is treated as one millisecond.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect_error(&self, source: std::io::Error) -> TransportError {
        TransportError::Connect {
            endpoint: self.path.display().to_string(),
            source,
        }
    }

    /// Retry until the deadline, giving up early once `cancelled` says so.
    fn dial(&self, cancelled: impl Fn() -> bool) -> Result<UnixStream> {
        check_path_len(&self.path)?;
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            if cancelled() {
                return Err(self.connect_error(std::io::Error::new(
                    ErrorKind::Interrupted,
                    "disconnected while connecting",
                )));
            }
            match UnixStream::connect(&self.path) {
                Ok(stream) => return Ok(stream),
                Err(err) if is_retryable(&err) && Instant::now() < deadline => {
                    thread::sleep(CONNECT_RETRY_INTERVAL);
                }
                Err(source) => return Err(self.connect_error(source)),
            }
        }
    }
}

fn is_retryable(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::Interrupted
    )
}

impl Connection for SocketConnection {
    fn connect(&self) -> Result<()> {
        let (_connecting, epoch) = self.link.begin_connect();
        if self.link.is_connected() {
            return Ok(());
        }

        let stream = self.dial(|| self.link.cancelled_since(epoch))?;
        stream.set_write_timeout(Some(self.write_timeout))?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        if self.link.cancelled_since(epoch) {
            return Err(self.connect_error(std::io::Error::new(
                ErrorKind::Interrupted,
                "disconnected while connecting",
            )));
        }
        debug!(path = ?self.path, "connected to unix socket");
        let link = Link::open(TRANSPORT_NAME, reader, stream, &self.events)?
            // Unblocks the reader thread and any write in progress.
            .with_close_hook(move || {
                let _ = control.shutdown(Shutdown::Both);
            });
        self.link.install(link);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        let link = self.link.current().ok_or(TransportError::NotConnected)?;
        if let Err(err) = link.write(bytes) {
            warn!(path = ?self.path, error = %err, "socket write failed, disconnecting");
            if self.link.remove(&link) && link.close(&self.events) {
                info!(path = ?self.path, "disconnected from unix socket");
            }
            return Err(TransportError::Io(err));
        }
        Ok(())
    }

    fn disconnect(&self) {
        if let Some(link) = self.link.take() {
            if link.close(&self.events) {
                info!(path = ?self.path, "disconnected from unix socket");
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

impl Drop for SocketConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
