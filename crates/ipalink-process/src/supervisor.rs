use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ipalink_transport::{PipeEnds, Subscribers};
use tracing::{debug, error, info, warn};

use crate::command::CommandLine;
use crate::error::{Result, SupervisorError};
use crate::launcher::{forward_lines, ExitInfo, Launcher, OutputMode, SystemLauncher, Worker};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lifecycle of the supervised worker.
///
/// `Stopped → Starting → Running → {Stopping → Stopped | Crashed → Starting}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    /// Launched, not yet observed alive by the watcher.
    Starting,
    Running,
    /// An operator stop is in progress.
    Stopping,
    /// Exited without an operator stop. Transient: the watcher relaunches or
    /// gives up within the same tick.
    Crashed,
}

/// Published by the supervisor, in transition order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    StateChanged(ProcessState),
    /// Whether the worker is up, emitted once per actual transition.
    RunStatusChanged(bool),
    Error(String),
    Crashed { exit: Option<ExitInfo> },
    /// The worker was relaunched after a crash; `count` restarts so far.
    Restarted { count: u32 },
}

/// How [`ProcessSupervisor::stop`] ended the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited on its own or after the graceful request.
    Exited,
    /// Did not exit within `stop_timeout` and was killed.
    Killed,
    NotRunning,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Tag used in logs and thread names.
    pub name: String,
    pub watch_interval: Duration,
    pub stop_timeout: Duration,
    /// Automatic restarts allowed since the last `start`. `None` is unlimited.
    pub max_restarts: Option<u32>,
    pub output: OutputMode,
    /// Worker stderr lines are reported as [`ProcessEvent::Error`] unless
    /// they contain one of these.
    pub bypass_errors: Vec<String>,
}

impl SupervisorConfig {
    pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_millis(500);
    pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(5000);
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            watch_interval: Self::DEFAULT_WATCH_INTERVAL,
            stop_timeout: Self::DEFAULT_STOP_TIMEOUT,
            max_restarts: None,
            output: OutputMode::default(),
            bypass_errors: Vec::new(),
        }
    }
}

struct Inner {
    state: ProcessState,
    worker: Option<Box<dyn Worker>>,
    command: Option<CommandLine>,
    reported_running: bool,
    restarts: u32,
}

struct Shared {
    config: SupervisorConfig,
    launcher: Box<dyn Launcher>,
    inner: Mutex<Inner>,
    /// Taken before the state lock is released so that event batches from
    /// different threads are published in transition order.
    publish: Arc<Mutex<()>>,
    events: Subscribers<ProcessEvent>,
}

struct Watcher {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// Launches, watches, restarts and stops one worker process.
///
/// A watcher thread checks the worker every `watch_interval`. A worker that
/// exits without [`stop`](Self::stop) is reported as crashed and relaunched
/// with the same command line.
///
/// Subscriber callbacks run on the thread that caused the transition and
/// must not call back into the supervisor.
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    watcher: Mutex<Option<Watcher>>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_launcher(config, SystemLauncher)
    }

    pub fn with_launcher(config: SupervisorConfig, launcher: impl Launcher + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                launcher: Box::new(launcher),
                inner: Mutex::new(Inner {
                    state: ProcessState::Stopped,
                    worker: None,
                    command: None,
                    reported_running: false,
                    restarts: 0,
                }),
                publish: Arc::new(Mutex::new(())),
                events: Subscribers::new(),
            }),
            watcher: Mutex::new(None),
        }
    }

    /// Parse `command_line`, launch the worker and arm the watcher.
    ///
    /// Launch failures are reported as [`ProcessEvent::Error`] too and leave
    /// the supervisor Stopped; they are never retried.
    pub fn start(&self, command_line: &str) -> Result<()> {
        let command = match CommandLine::parse(command_line) {
            Ok(command) => command,
            Err(err) => {
                self.shared.events.emit(ProcessEvent::Error(err.to_string()));
                return Err(err);
            }
        };
        self.ensure_watcher()?;

        let mut inner = self.shared.lock();
        if inner.state != ProcessState::Stopped {
            return Err(SupervisorError::AlreadyRunning);
        }

        let mut events = vec![ProcessEvent::StateChanged(ProcessState::Starting)];
        inner.state = ProcessState::Starting;
        inner.restarts = 0;

        match self.shared.launch(&command) {
            Ok(worker) => {
                inner.worker = Some(worker);
                inner.command = Some(command);
                self.shared.publish(inner, events);
                Ok(())
            }
            Err(source) => {
                inner.state = ProcessState::Stopped;
                let err = SupervisorError::Launch {
                    program: command.program().to_string(),
                    source,
                };
                error!(worker = %self.shared.config.name, error = %err, "launch failed");
                events.push(ProcessEvent::Error(err.to_string()));
                events.push(ProcessEvent::StateChanged(ProcessState::Stopped));
                self.shared.publish(inner, events);
                Err(err)
            }
        }
    }

    /// Stop the worker: graceful request, wait up to `stop_timeout`, then
    /// kill. Always ends Stopped and disarms crash-restart.
    pub fn stop(&self) -> StopOutcome {
        let worker = {
            let mut inner = self.shared.lock();
            match inner.state {
                ProcessState::Starting | ProcessState::Running => {}
                ProcessState::Stopped | ProcessState::Stopping | ProcessState::Crashed => {
                    return StopOutcome::NotRunning;
                }
            }
            inner.state = ProcessState::Stopping;
            let worker = inner.worker.take();
            self.shared
                .publish(inner, vec![ProcessEvent::StateChanged(ProcessState::Stopping)]);
            worker
        };

        let outcome = match worker {
            Some(worker) => shutdown(
                worker,
                self.shared.config.stop_timeout,
                &self.shared.config.name,
            ),
            None => StopOutcome::NotRunning,
        };

        let mut inner = self.shared.lock();
        inner.state = ProcessState::Stopped;
        let mut events = vec![ProcessEvent::StateChanged(ProcessState::Stopped)];
        if std::mem::take(&mut inner.reported_running) {
            events.push(ProcessEvent::RunStatusChanged(false));
        }
        info!(worker = %self.shared.config.name, ?outcome, "worker stopped");
        self.shared.publish(inner, events);
        outcome
    }

    /// Check the worker now instead of waiting for the next watcher tick.
    pub fn poll(&self) {
        self.shared.poll();
    }

    /// Whether the worker process is up (Starting or Running).
    pub fn is_running(&self) -> bool {
        matches!(
            self.shared.lock().state,
            ProcessState::Starting | ProcessState::Running
        )
    }

    pub fn state(&self) -> ProcessState {
        self.shared.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.lock().worker.as_ref().map(|worker| worker.pid())
    }

    /// Automatic restarts since the last `start`.
    pub fn restarts(&self) -> u32 {
        self.shared.lock().restarts
    }

    /// The command line of the current or most recent worker.
    pub fn command(&self) -> Option<CommandLine> {
        self.shared.lock().command.clone()
    }

    /// Take the current worker's stdout/stdin pipes ([`OutputMode::Pipe`]).
    pub fn take_stdio(&self) -> Option<PipeEnds> {
        self.shared.lock().worker.as_mut().and_then(|worker| worker.take_stdio())
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> Receiver<ProcessEvent> {
        self.shared.events.subscribe()
    }

    pub fn subscribe_with(&self, callback: impl FnMut(&ProcessEvent) -> bool + Send + 'static) {
        self.shared.events.subscribe_with(callback);
    }

    fn ensure_watcher(&self) -> Result<()> {
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if watcher.is_some() {
            return Ok(());
        }

        let (shutdown, ticks) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let interval = self.shared.config.watch_interval;
        let handle = thread::Builder::new()
            .name(format!("{}-watcher", self.shared.config.name))
            .spawn(move || loop {
                match ticks.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => shared.poll(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        *watcher = Some(Watcher { shutdown, handle });
        Ok(())
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        let watcher = self
            .watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Watcher { shutdown, handle }) = watcher {
            let _ = shutdown.send(());
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.stop();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn launch(&self, command: &CommandLine) -> std::io::Result<Box<dyn Worker>> {
        let mut worker = self
            .launcher
            .launch(&self.config.name, command, self.config.output)?;
        if let Some(stderr) = worker.take_stderr() {
            self.forward_stderr(worker.pid(), stderr);
        }
        Ok(worker)
    }

    /// Log every stderr line and report the ones not matching
    /// `bypass_errors`.
    fn forward_stderr(&self, pid: u32, stderr: Box<dyn std::io::Read + Send>) {
        let worker = self.config.name.clone();
        let bypass = self.config.bypass_errors.clone();
        let events = self.events.clone();
        let publish = Arc::clone(&self.publish);
        forward_lines(&self.config.name, "stderr", stderr, move |line| {
            warn!(worker = %worker, pid, stream = "stderr", "{line}");
            if bypass.iter().any(|known| line.contains(known.as_str())) {
                return;
            }
            let _order = publish.lock().unwrap_or_else(PoisonError::into_inner);
            events.emit(ProcessEvent::Error(line.to_string()));
        });
    }

    /// Release the state lock and publish `events` without letting another
    /// batch overtake them.
    fn publish(&self, inner: MutexGuard<'_, Inner>, events: Vec<ProcessEvent>) {
        let _order = self.publish.lock().unwrap_or_else(PoisonError::into_inner);
        drop(inner);
        for event in events {
            self.events.emit(event);
        }
    }

    fn poll(&self) {
        let mut inner = self.lock();
        let state = inner.state;
        if !matches!(state, ProcessState::Starting | ProcessState::Running) {
            return;
        }

        let observed = match inner.worker.as_mut() {
            Some(worker) => worker.try_wait(),
            None => Ok(Some(ExitInfo::default())),
        };

        let events = match observed {
            Ok(None) if state == ProcessState::Starting => {
                inner.state = ProcessState::Running;
                let mut events = vec![ProcessEvent::StateChanged(ProcessState::Running)];
                if !inner.reported_running {
                    inner.reported_running = true;
                    events.push(ProcessEvent::RunStatusChanged(true));
                }
                let pid = inner.worker.as_ref().map(|worker| worker.pid());
                info!(worker = %self.config.name, ?pid, "worker running");
                events
            }
            Ok(None) => return,
            Ok(Some(exit)) => self.recover(&mut inner, Some(exit)),
            Err(err) => {
                warn!(worker = %self.config.name, error = %err, "cannot query worker status");
                self.recover(&mut inner, None)
            }
        };
        self.publish(inner, events);
    }

    /// Handle an exit nobody asked for: report it, then relaunch unless the
    /// restart limit is reached.
    fn recover(&self, inner: &mut Inner, exit: Option<ExitInfo>) -> Vec<ProcessEvent> {
        let name = &self.config.name;
        if let Some(mut worker) = inner.worker.take() {
            // Status unknown: make sure the old worker is gone before
            // launching its replacement.
            if exit.is_none() {
                if let Err(err) = worker.kill() {
                    warn!(worker = %name, error = %err, "kill failed");
                }
                if let Err(err) = worker.wait() {
                    warn!(worker = %name, error = %err, "reaping worker failed");
                }
            }
        }
        inner.state = ProcessState::Crashed;

        let description = exit.unwrap_or_default().to_string();
        warn!(worker = %name, exit = %description, "worker exited unexpectedly");
        let mut events = vec![
            ProcessEvent::StateChanged(ProcessState::Crashed),
            ProcessEvent::Error(format!("{name} exited unexpectedly ({description})")),
            ProcessEvent::Crashed { exit },
        ];
        if std::mem::take(&mut inner.reported_running) {
            events.push(ProcessEvent::RunStatusChanged(false));
        }

        if let Some(max) = self.config.max_restarts {
            if inner.restarts >= max {
                error!(worker = %name, restarts = inner.restarts, "restart limit reached");
                inner.state = ProcessState::Stopped;
                events.push(ProcessEvent::Error(format!(
                    "{name} crashed after {} restarts, giving up",
                    inner.restarts
                )));
                events.push(ProcessEvent::StateChanged(ProcessState::Stopped));
                return events;
            }
        }

        let Some(command) = inner.command.clone() else {
            inner.state = ProcessState::Stopped;
            events.push(ProcessEvent::StateChanged(ProcessState::Stopped));
            return events;
        };
        match self.launch(&command) {
            Ok(worker) => {
                inner.worker = Some(worker);
                inner.state = ProcessState::Starting;
                inner.restarts += 1;
                info!(worker = %name, restarts = inner.restarts, "worker restarted");
                events.push(ProcessEvent::StateChanged(ProcessState::Starting));
                events.push(ProcessEvent::Restarted {
                    count: inner.restarts,
                });
            }
            Err(err) => {
                error!(worker = %name, error = %err, "relaunch failed");
                inner.state = ProcessState::Stopped;
                events.push(ProcessEvent::Error(format!(
                    "failed to relaunch {}: {err}",
                    command.program()
                )));
                events.push(ProcessEvent::StateChanged(ProcessState::Stopped));
            }
        }
        events
    }
}

fn shutdown(mut worker: Box<dyn Worker>, timeout: Duration, name: &str) -> StopOutcome {
    if let Ok(Some(_)) = worker.try_wait() {
        return StopOutcome::Exited;
    }
    if let Err(err) = worker.terminate() {
        debug!(worker = name, error = %err, "graceful termination request failed");
    }

    let deadline = Instant::now() + timeout;
    loop {
        match worker.try_wait() {
            Ok(Some(exit)) => {
                debug!(worker = name, %exit, "worker exited after termination request");
                return StopOutcome::Exited;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(worker = name, error = %err, "cannot query worker status");
                break;
            }
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(STOP_POLL_INTERVAL.min(deadline - now));
    }

    warn!(
        worker = name,
        timeout_ms = timeout.as_millis() as u64,
        "worker ignored termination request, killing"
    );
    if let Err(err) = worker.kill() {
        warn!(worker = name, error = %err, "kill failed");
    }
    if let Err(err) = worker.wait() {
        warn!(worker = name, error = %err, "reaping killed worker failed");
    }
    StopOutcome::Killed
}
