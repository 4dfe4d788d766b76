use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::events::Subscribers;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Everything a connection reports, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Emitted once per actual transition.
    StateChanged(bool),
    /// A chunk of received bytes, in stream order. Chunk boundaries carry no
    /// meaning.
    Data(Bytes),
}

/// A bidirectional local byte stream to a worker.
///
/// Implementations publish [`ConnectionEvent`]s from their own I/O thread;
/// a subscriber sees `StateChanged(true)` before any `Data` of that
/// connection and no `Data` after the matching `StateChanged(false)`.
///
/// Methods take `&self` and may be called from any thread. Only `connect`
/// and `write` block on I/O; state queries and `disconnect` never wait for
/// a dial or a write in progress.
pub trait Connection: Send + Sync {
    /// Open the stream. A no-op when already connected.
    fn connect(&self) -> Result<()>;

    /// Cached state; the transport is not queried again.
    fn is_connected(&self) -> bool;

    /// Write all of `bytes`. Fails with [`TransportError::NotConnected`] when
    /// there is no open stream; a failed write tears the connection down.
    fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Close the stream. A no-op when already disconnected. A `connect`
    /// still dialing when this is called gives up instead of connecting.
    fn disconnect(&self);

    /// Event fan-out for this connection.
    fn events(&self) -> &Subscribers<ConnectionEvent>;

    fn subscribe(&self) -> Receiver<ConnectionEvent> {
        self.events().subscribe()
    }

    fn subscribe_with(&self, callback: impl FnMut(&ConnectionEvent) -> bool + Send + 'static)
    where
        Self: Sized,
    {
        self.events().subscribe_with(callback);
    }

    /// Transport name for diagnostics.
    fn transport_name(&self) -> &'static str;
}

type CloseHook = Box<dyn Fn() + Send + Sync>;

/// The open half of a connection: the writer plus the flag shared with the
/// reader thread.
pub(crate) struct Link<W> {
    writer: Mutex<W>,
    alive: Arc<AtomicBool>,
    on_close: Option<CloseHook>,
}

impl<W: Write> Link<W> {
    /// Announce the connection, then start pumping `reader` into `events`.
    pub(crate) fn open<R>(
        transport: &'static str,
        reader: R,
        writer: W,
        events: &Subscribers<ConnectionEvent>,
    ) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let alive = Arc::new(AtomicBool::new(false));
        events.emit_if(
            || {
                alive.store(true, Ordering::SeqCst);
                true
            },
            ConnectionEvent::StateChanged(true),
        );

        let spawned = spawn_reader(transport, reader, Arc::clone(&alive), events.clone());
        if let Err(err) = spawned {
            mark_closed(&alive, events);
            return Err(TransportError::Io(err));
        }

        info!(transport, "connected");
        Ok(Self {
            writer: Mutex::new(writer),
            alive,
            on_close: None,
        })
    }

    /// Run `hook` on every close, without waiting for a write in progress.
    pub(crate) fn with_close_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        write_all_retrying(&mut *writer, bytes)
    }

    /// Report the disconnect unless the reader thread already did.
    pub(crate) fn close(&self, events: &Subscribers<ConnectionEvent>) -> bool {
        let closed = mark_closed(&self.alive, events);
        if let Some(hook) = &self.on_close {
            hook();
        }
        closed
    }
}

/// Holds a connection's current [`Link`]. The slot lock only guards swapping
/// the handle, never I/O; a separate lock serializes connect attempts.
pub(crate) struct LinkSlot<W> {
    current: Mutex<Option<Arc<Link<W>>>>,
    connecting: Mutex<()>,
    /// Bumped by every `take`, so a dial that started earlier can tell it
    /// was cancelled.
    epoch: AtomicU64,
}

impl<W: Write> LinkSlot<W> {
    pub(crate) fn new() -> Self {
        Self {
            current: Mutex::new(None),
            connecting: Mutex::new(()),
            epoch: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<Link<W>>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serialize connect attempts. Returns the guard and the epoch the
    /// attempt started in.
    pub(crate) fn begin_connect(&self) -> (MutexGuard<'_, ()>, u64) {
        let guard = self.connecting.lock().unwrap_or_else(PoisonError::into_inner);
        (guard, self.epoch.load(Ordering::SeqCst))
    }

    /// Whether a `take` happened since `epoch`.
    pub(crate) fn cancelled_since(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.lock().as_ref().is_some_and(|link| link.is_alive())
    }

    /// The open link, if any.
    pub(crate) fn current(&self) -> Option<Arc<Link<W>>> {
        self.lock().as_ref().filter(|link| link.is_alive()).cloned()
    }

    pub(crate) fn install(&self, link: Link<W>) {
        *self.lock() = Some(Arc::new(link));
    }

    pub(crate) fn take(&self) -> Option<Arc<Link<W>>> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.lock().take()
    }

    /// Remove `link` if it is still the current one.
    pub(crate) fn remove(&self, link: &Arc<Link<W>>) -> bool {
        let mut current = self.lock();
        if current.as_ref().is_some_and(|open| Arc::ptr_eq(open, link)) {
            *current = None;
            return true;
        }
        false
    }
}

fn mark_closed(alive: &AtomicBool, events: &Subscribers<ConnectionEvent>) -> bool {
    events.emit_if(
        || alive.swap(false, Ordering::SeqCst),
        ConnectionEvent::StateChanged(false),
    )
}

fn spawn_reader<R>(
    transport: &'static str,
    mut reader: R,
    alive: Arc<AtomicBool>,
    events: Subscribers<ConnectionEvent>,
) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("ipalink-{transport}-reader"))
        .spawn(move || {
            let mut chunk = vec![0u8; READ_CHUNK_SIZE];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) => {
                        debug!(transport, "stream closed by peer");
                        break;
                    }
                    Ok(n) => {
                        let data = ConnectionEvent::Data(Bytes::copy_from_slice(&chunk[..n]));
                        if !events.emit_if(|| alive.load(Ordering::SeqCst), data) {
                            break;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(transport, error = %err, "stream read failed");
                        break;
                    }
                }
            }

            if mark_closed(&alive, &events) {
                info!(transport, "disconnected");
            }
        })
}

fn write_all_retrying<W: Write>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    let mut offset = 0usize;
    while offset < bytes.len() {
        match writer.write(&bytes[offset..]) {
            Ok(0) => return Err(std::io::Error::from(ErrorKind::WriteZero)),
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    loop {
        match writer.flush() {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use super::*;

    fn collect_until_closed(rx: &Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
            let done = event == ConnectionEvent::StateChanged(false);
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    #[test]
    fn open_announces_before_data_and_closes_on_eof() {
        let events = Subscribers::new();
        let rx = events.subscribe();

        let link = Link::open("test", Cursor::new(b"abc".to_vec()), Vec::new(), &events)
            .expect("link should open");

        let seen = collect_until_closed(&rx);
        assert_eq!(
            seen,
            vec![
                ConnectionEvent::StateChanged(true),
                ConnectionEvent::Data(Bytes::from_static(b"abc")),
                ConnectionEvent::StateChanged(false),
            ]
        );
        assert!(!link.is_alive());
        assert!(!link.close(&events), "close after EOF should not re-emit");
    }

    #[test]
    #[cfg(unix)]
    fn close_emits_exactly_once() {
        let events = Subscribers::new();
        let rx = events.subscribe();
        let (reader, _keep_open) =
            std::os::unix::net::UnixStream::pair().expect("socket pair should be created");

        let link = Link::open("test", reader, Vec::new(), &events).expect("link should open");
        assert!(link.is_alive());
        assert!(link.close(&events));
        assert!(!link.close(&events));

        assert_eq!(rx.recv().unwrap(), ConnectionEvent::StateChanged(true));
        assert_eq!(rx.recv().unwrap(), ConnectionEvent::StateChanged(false));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn slot_take_cancels_pending_connects() {
        let slot: LinkSlot<Vec<u8>> = LinkSlot::new();
        let (guard, epoch) = slot.begin_connect();
        assert!(!slot.cancelled_since(epoch));

        assert!(slot.take().is_none());
        assert!(slot.cancelled_since(epoch));
        drop(guard);

        let (_guard, next) = slot.begin_connect();
        assert!(!slot.cancelled_since(next));
    }

    #[test]
    #[cfg(unix)]
    fn slot_remove_only_drops_the_same_link() {
        let events = Subscribers::new();
        let slot = LinkSlot::new();
        let (first_reader, _first_peer) = std::os::unix::net::UnixStream::pair().unwrap();
        let (second_reader, _second_peer) = std::os::unix::net::UnixStream::pair().unwrap();

        slot.install(Link::open("test", first_reader, Vec::new(), &events).unwrap());
        let stale = slot.current().expect("first link is open");
        slot.install(Link::open("test", second_reader, Vec::new(), &events).unwrap());

        assert!(!slot.remove(&stale), "a replaced link is not removed again");
        assert!(slot.is_connected());

        let open = slot.current().expect("second link is open");
        assert!(slot.remove(&open));
        assert!(!slot.is_connected());
        assert!(slot.current().is_none());
    }

    #[test]
    fn close_runs_hook_even_after_eof() {
        use std::sync::atomic::AtomicUsize;

        let events = Subscribers::new();
        let rx = events.subscribe();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let link = Link::open("test", Cursor::new(Vec::new()), Vec::new(), &events)
            .unwrap()
            .with_close_hook(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        collect_until_closed(&rx);
        assert!(!link.close(&events));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn write_retries_short_and_interrupted_writes() {
        let mut writer = Stuttering::default();
        write_all_retrying(&mut writer, b"telegram\x17").unwrap();
        assert_eq!(writer.data, b"telegram\x17");
    }

    #[test]
    fn write_zero_is_an_error() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let err = write_all_retrying(&mut Closed, b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteZero);
    }

    #[derive(Default)]
    struct Stuttering {
        calls: usize,
        data: Vec<u8>,
    }

    impl Write for Stuttering {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 1 {
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            let n = buf.len().min(3);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
