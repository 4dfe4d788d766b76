use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::str::FromStr;
use std::thread;

use ipalink_transport::PipeEnds;
use tracing::{debug, info};

use crate::command::CommandLine;

/// Where a worker's standard streams go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Share the supervisor's stdio.
    #[default]
    Inherit,
    /// Discard everything.
    Null,
    /// Forward stdout line by line into `tracing`; stderr goes to
    /// [`Worker::take_stderr`].
    Log,
    /// Keep stdin/stdout as pipes for [`Worker::take_stdio`]; stderr goes to
    /// [`Worker::take_stderr`].
    Pipe,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inherit => "inherit",
            Self::Null => "null",
            Self::Log => "log",
            Self::Pipe => "pipe",
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inherit" => Ok(Self::Inherit),
            "null" => Ok(Self::Null),
            "log" => Ok(Self::Log),
            "pipe" => Ok(Self::Pipe),
            other => Err(format!(
                "unknown output mode '{other}' (expected inherit, null, log or pipe)"
            )),
        }
    }
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    /// Terminating signal (Unix only).
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// A launched worker process.
pub trait Worker: Send {
    fn pid(&self) -> u32;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> std::io::Result<Option<ExitInfo>>;

    /// Ask the worker to exit (SIGTERM on Unix).
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Force the worker to exit.
    fn kill(&mut self) -> std::io::Result<()>;

    /// Block until the worker has exited and reap it.
    fn wait(&mut self) -> std::io::Result<ExitInfo>;

    /// Hand out the stdout/stdin pipes, once. Only available with
    /// [`OutputMode::Pipe`].
    fn take_stdio(&mut self) -> Option<PipeEnds>;

    /// Hand out the stderr pipe, once. Available with [`OutputMode::Log`]
    /// and [`OutputMode::Pipe`]; whoever takes it must keep draining it.
    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        None
    }
}

/// Starts workers. The seam lets tests drive the supervisor without real
/// processes.
pub trait Launcher: Send + Sync {
    fn launch(
        &self,
        name: &str,
        command: &CommandLine,
        output: OutputMode,
    ) -> std::io::Result<Box<dyn Worker>>;
}

/// Launches real OS processes via `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn launch(
        &self,
        name: &str,
        command: &CommandLine,
        output: OutputMode,
    ) -> std::io::Result<Box<dyn Worker>> {
        let mut cmd = Command::new(command.program());
        cmd.args(command.args());
        match output {
            OutputMode::Inherit => {
                cmd.stdin(Stdio::null());
            }
            OutputMode::Null => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null());
            }
            OutputMode::Log => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
            OutputMode::Pipe => {
                cmd.stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
        }

        let mut child = cmd.spawn()?;
        info!(worker = name, pid = child.id(), command = %command, "worker launched");

        let mut stdio = None;
        match output {
            OutputMode::Log => {
                if let Some(stdout) = child.stdout.take() {
                    let worker = name.to_string();
                    forward_lines(name, "stdout", stdout, move |line| {
                        info!(worker = %worker, stream = "stdout", "{line}");
                    });
                }
            }
            OutputMode::Pipe => {
                if let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) {
                    stdio = Some(PipeEnds::new(stdout, stdin));
                }
            }
            OutputMode::Inherit | OutputMode::Null => {}
        }
        let stderr = child.stderr.take();

        Ok(Box::new(ChildWorker {
            child,
            stdio,
            stderr,
        }))
    }
}

struct ChildWorker {
    child: Child,
    stdio: Option<PipeEnds>,
    stderr: Option<ChildStderr>,
}

impl Worker for ChildWorker {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitInfo>> {
        Ok(self.child.try_wait()?.map(ExitInfo::from))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> std::io::Result<()> {
        let pid = libc::pid_t::try_from(self.child.id()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range")
        })?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> std::io::Result<()> {
        self.child.kill()
    }

    fn kill(&mut self) -> std::io::Result<()> {
        match self.child.kill() {
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    fn wait(&mut self) -> std::io::Result<ExitInfo> {
        self.stdio = None;
        self.stderr = None;
        Ok(self.child.wait()?.into())
    }

    fn take_stdio(&mut self) -> Option<PipeEnds> {
        self.stdio.take()
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stderr
            .take()
            .map(|stderr| Box::new(stderr) as Box<dyn Read + Send>)
    }
}

/// Read `reader` line by line on its own thread until EOF, handing each
/// non-empty line to `on_line` without its line ending.
pub(crate) fn forward_lines(
    name: &str,
    stream: &'static str,
    reader: impl Read + Send + 'static,
    mut on_line: impl FnMut(&str) + Send + 'static,
) {
    let worker = name.to_string();
    let spawned = thread::Builder::new()
        .name(format!("{name}-{stream}"))
        .spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&line);
                        let text = text.trim_end();
                        if !text.is_empty() {
                            on_line(text);
                        }
                    }
                }
            }
            debug!(worker = %worker, stream, "output stream closed");
        });
    if let Err(err) = spawned {
        debug!(worker = name, stream, error = %err, "could not start output forwarder");
    }
}
