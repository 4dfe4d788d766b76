use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use ipalink_frame::{encode_telegram, ByteArray, TelegramBuffer};
use ipalink_process::{ProcessEvent, ProcessState, ProcessSupervisor, StopOutcome};
#[cfg(unix)]
use ipalink_transport::SocketConnection;
use ipalink_transport::{Connection, ConnectionEvent, PipeConnection, Subscribers, TransportError};
use tracing::{debug, info, warn};

use crate::config::{SessionConfig, TransportConfig};
use crate::error::{Result, SessionError};
use crate::request::Request;

/// Everything a session reports, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectionChanged(bool),
    /// One complete telegram, delimiter stripped.
    FrameReceived(ByteArray),
    RunStatusChanged(bool),
    ProcessError(String),
    /// Automatic restarts so far.
    ProcessRestarted(u32),
    /// The received stream could not be framed; the connection is dropped.
    ProtocolError(String),
}

enum Inbound {
    Connection(ConnectionEvent),
    Process(ProcessEvent),
    Connect,
    Shutdown,
}

/// Client side of a supervised worker: process lifecycle, connection and
/// telegram reassembly behind one command surface and one event stream.
///
/// Connection and supervisor events are funnelled into a single dispatcher
/// thread that owns the [`TelegramBuffer`], so frames and state changes are
/// observed in the order they happened. Dialing also happens there; state
/// queries, `send` and `disconnect` never wait for it.
///
/// ```no_run
/// use ipalink_session::{ClientSession, SessionConfig, SessionEvent};
///
/// let session = ClientSession::new(SessionConfig::default())?;
/// let events = session.subscribe();
/// session.request_start("my-worker --serve")?;
/// for event in events {
///     if let SessionEvent::ConnectionChanged(true) = event {
///         session.send_telegram(br#"{"JOB_ID":"1","CMD":"0","OPTIONS":""}"#)?;
///     }
/// }
/// # Ok::<(), ipalink_session::SessionError>(())
/// ```
pub struct ClientSession {
    config: SessionConfig,
    supervisor: Arc<ProcessSupervisor>,
    connection: Arc<dyn Connection>,
    events: Subscribers<SessionEvent>,
    inbound: Sender<Inbound>,
    dispatcher: Option<JoinHandle<()>>,
}

impl ClientSession {
    /// Build a session with a real supervisor and the configured transport.
    pub fn new(config: SessionConfig) -> Result<Self> {
        let supervisor = Arc::new(ProcessSupervisor::new(config.supervisor_config()));
        let connection = connection_for(&config, Arc::downgrade(&supervisor))?;
        Self::from_parts(config, supervisor, connection)
    }

    /// Build a session from an existing supervisor and connection.
    pub fn from_parts(
        config: SessionConfig,
        supervisor: Arc<ProcessSupervisor>,
        connection: Box<dyn Connection>,
    ) -> Result<Self> {
        let (inbound, rx) = mpsc::channel();

        let forward = inbound.clone();
        connection
            .events()
            .subscribe_with(move |event: &ConnectionEvent| {
                forward.send(Inbound::Connection(event.clone())).is_ok()
            });
        let forward = inbound.clone();
        supervisor.subscribe_with(move |event: &ProcessEvent| {
            forward.send(Inbound::Process(event.clone())).is_ok()
        });

        let connection: Arc<dyn Connection> = Arc::from(connection);
        let events = Subscribers::new();
        let dispatcher = Dispatcher {
            buffer: TelegramBuffer::new(config.capacity),
            connection: Arc::clone(&connection),
            supervisor: Arc::clone(&supervisor),
            events: events.clone(),
            reconnect_interval: config.reconnect_interval,
            connected: false,
        };
        let handle = thread::Builder::new()
            .name("ipalink-session".to_string())
            .spawn(move || dispatcher.run(rx))?;

        Ok(Self {
            config,
            supervisor,
            connection,
            events,
            inbound,
            dispatcher: Some(handle),
        })
    }

    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Register a callback, run on the dispatcher thread. Returning `false`
    /// unsubscribes. It must not block.
    pub fn on_event(&self, callback: impl FnMut(&SessionEvent) -> bool + Send + 'static) {
        self.events.subscribe_with(callback);
    }

    /// Write raw bytes to the worker.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        if !self.connection.is_connected() {
            warn!(len = bytes.len(), "cannot send, not connected to worker");
            return Err(SessionError::NotConnected);
        }
        self.connection.write(bytes).map_err(|err| match err {
            TransportError::NotConnected => SessionError::NotConnected,
            other => SessionError::Transport(other),
        })
    }

    /// Append the delimiter to `payload` and send it.
    pub fn send_telegram(&self, payload: &[u8]) -> Result<()> {
        let mut wire = BytesMut::with_capacity(payload.len() + 1);
        encode_telegram(payload, &mut wire)?;
        self.send(&wire)
    }

    /// Encode `request` as JSON and send it as one telegram.
    pub fn send_request(&self, request: &Request) -> Result<()> {
        self.send_telegram(&request.to_bytes()?)
    }

    /// Launch the worker. With the pipe transport the connection is opened
    /// right away, since the pipes exist as soon as the worker does.
    pub fn request_start(&self, command_line: &str) -> Result<()> {
        self.supervisor.start(command_line)?;
        if matches!(self.config.transport, TransportConfig::Pipe) {
            self.connect()?;
        }
        Ok(())
    }

    /// Stop the worker and drop the connection.
    pub fn request_stop(&self) -> StopOutcome {
        let outcome = self.supervisor.stop();
        self.disconnect();
        outcome
    }

    /// Ask the dispatcher to connect. Completion is reported as
    /// [`SessionEvent::ConnectionChanged`]; failures are logged.
    pub fn connect(&self) -> Result<()> {
        self.inbound
            .send(Inbound::Connect)
            .map_err(|_| SessionError::Closed)
    }

    /// Close the connection. A dial still in progress gives up.
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    pub fn process_state(&self) -> ProcessState {
        self.supervisor.state()
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.supervisor.stop();
        self.disconnect();
        let _ = self.inbound.send(Inbound::Shutdown);
        if let Some(handle) = self.dispatcher.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn connection_for(
    config: &SessionConfig,
    supervisor: Weak<ProcessSupervisor>,
) -> Result<Box<dyn Connection>> {
    match &config.transport {
        TransportConfig::Pipe => Ok(Box::new(PipeConnection::new(move || {
            supervisor
                .upgrade()
                .and_then(|supervisor| supervisor.take_stdio())
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotConnected,
                        "worker has no open pipes",
                    )
                })
        }))),
        #[cfg(unix)]
        TransportConfig::Socket { path } => Ok(Box::new(
            SocketConnection::new(path.clone())
                .with_connect_timeout(config.connect_timeout)
                .with_write_timeout(config.write_timeout),
        )),
        #[cfg(not(unix))]
        TransportConfig::Socket { path } => Err(SessionError::Transport(
            TransportError::Connect {
                endpoint: path.display().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix domain sockets are not available on this platform",
                ),
            },
        )),
    }
}

struct Dispatcher {
    buffer: TelegramBuffer,
    connection: Arc<dyn Connection>,
    supervisor: Arc<ProcessSupervisor>,
    events: Subscribers<SessionEvent>,
    reconnect_interval: Option<Duration>,
    connected: bool,
}

impl Dispatcher {
    fn run(mut self, rx: Receiver<Inbound>) {
        let mut next_reconnect = self.reconnect_interval.map(|interval| Instant::now() + interval);
        loop {
            let inbound = match next_reconnect {
                Some(deadline) => {
                    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(inbound) => inbound,
                        Err(RecvTimeoutError::Timeout) => {
                            self.reconnect_if_needed();
                            next_reconnect = self.reconnect_interval.map(|i| Instant::now() + i);
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(inbound) => inbound,
                    Err(_) => break,
                },
            };

            match inbound {
                Inbound::Connection(event) => self.on_connection_event(event),
                Inbound::Process(event) => self.on_process_event(event),
                Inbound::Connect => self.connect(),
                Inbound::Shutdown => break,
            }
        }
        debug!("session dispatcher stopped");
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(true) => {
                self.buffer.clear();
                self.connected = true;
                info!("connected to worker");
                self.events.emit(SessionEvent::ConnectionChanged(true));
            }
            ConnectionEvent::StateChanged(false) => self.mark_disconnected(),
            // Chunks still queued from a connection this side already dropped.
            ConnectionEvent::Data(_) if !self.connected => {}
            ConnectionEvent::Data(chunk) => {
                let appended = self.buffer.append(&chunk);
                for frame in self.buffer.take_frames() {
                    self.events.emit(SessionEvent::FrameReceived(frame));
                }
                if let Err(err) = appended {
                    warn!(error = %err, "telegram stream desynchronized, dropping connection");
                    self.events.emit(SessionEvent::ProtocolError(err.to_string()));
                    self.drop_connection();
                }
            }
        }
    }

    fn on_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::RunStatusChanged(running) => {
                self.events.emit(SessionEvent::RunStatusChanged(running));
            }
            ProcessEvent::Error(message) => {
                self.events.emit(SessionEvent::ProcessError(message));
            }
            ProcessEvent::Crashed { .. } => self.drop_connection(),
            ProcessEvent::Restarted { count } => {
                self.drop_connection();
                self.events.emit(SessionEvent::ProcessRestarted(count));
            }
            ProcessEvent::StateChanged(state) => debug!(?state, "worker state changed"),
        }
    }

    /// Close the transport and report it now; the transport's own
    /// notification arrives later and is ignored.
    fn drop_connection(&mut self) {
        self.connection.disconnect();
        self.mark_disconnected();
    }

    fn mark_disconnected(&mut self) {
        self.buffer.clear();
        if std::mem::take(&mut self.connected) {
            info!("disconnected from worker");
            self.events.emit(SessionEvent::ConnectionChanged(false));
        }
    }

    fn connect(&mut self) {
        if let Err(err) = self.connection.connect() {
            warn!(
                transport = self.connection.transport_name(),
                error = %err,
                "connecting to worker failed"
            );
        }
    }

    fn reconnect_if_needed(&mut self) {
        if self.supervisor.is_running() && !self.connection.is_connected() {
            debug!("retrying worker connection");
            self.connect();
        }
    }
}
