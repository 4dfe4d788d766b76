use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use ipalink_process::OutputMode;
use ipalink_session::{
    ClientSession, SessionConfig, SessionError, SessionEvent, TransportConfig,
};
use tracing::{error, info, warn};

use crate::cmd::{parse_duration, RunArgs};
use crate::exit::{session_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};
use crate::output::{print_frame, OutputFormat};

enum Control {
    Line(String),
    Connected,
    Eof,
    Interrupt,
}

pub fn run(args: RunArgs, format: OutputFormat) -> CliResult<i32> {
    let config = session_config(&args)?;

    let session = Arc::new(
        ClientSession::new(config).map_err(|err| session_error("session setup failed", err))?,
    );
    let (control, commands) = mpsc::channel();
    let printer = spawn_event_printer(
        session.subscribe(),
        Arc::downgrade(&session),
        control.clone(),
        format,
    )?;
    install_ctrlc_handler(control.clone())?;

    session
        .request_start(&args.command_line)
        .map_err(|err| session_error("worker start failed", err))?;
    spawn_stdin_reader(control)?;

    relay(&session, &commands);

    let outcome = session.request_stop();
    info!(?outcome, "worker stopped");
    drop(session);
    let _ = printer.join();

    Ok(SUCCESS)
}

fn session_config(args: &RunArgs) -> CliResult<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_json_file(path)
            .map_err(|err| session_error("config load failed", err))?,
        None => SessionConfig::default(),
    };

    if let Some(path) = &args.socket {
        config.transport = TransportConfig::Socket { path: path.clone() };
    } else if args.pipe {
        config.transport = TransportConfig::Pipe;
    }
    // Worker stdout would interleave with printed frames.
    if matches!(config.transport, TransportConfig::Socket { .. })
        && config.output == OutputMode::Inherit
    {
        config.output = OutputMode::Log;
    }

    if let Some(capacity) = args.capacity {
        if capacity == 0 {
            return Err(CliError::new(USAGE, "capacity must be greater than zero"));
        }
        config.capacity = capacity;
    }
    if let Some(timeout) = &args.connect_timeout {
        config.connect_timeout = parse_duration(timeout)?;
    }
    if let Some(timeout) = &args.stop_timeout {
        config.stop_timeout = parse_duration(timeout)?;
    }
    if let Some(interval) = &args.reconnect_interval {
        config.reconnect_interval = Some(parse_duration(interval)?);
    }
    if let Some(limit) = args.max_restarts {
        config.max_restarts = Some(limit);
    }
    config
        .bypass_errors
        .extend(args.bypass_errors.iter().cloned());

    Ok(config)
}

/// Forward stdin lines until EOF or Ctrl-C. Lines that arrive while the
/// worker is unreachable wait for the next connection.
fn relay(session: &ClientSession, commands: &Receiver<Control>) {
    let mut pending = VecDeque::new();
    loop {
        match commands.recv() {
            Ok(Control::Line(line)) => {
                let line = line.trim_end_matches(['\r', '\n']);
                if !line.is_empty() {
                    pending.push_back(line.to_string());
                    flush(session, &mut pending);
                }
            }
            Ok(Control::Connected) => flush(session, &mut pending),
            Ok(Control::Eof) => {
                info!("stdin closed, stopping worker");
                break;
            }
            Ok(Control::Interrupt) | Err(_) => {
                info!("interrupted, stopping worker");
                break;
            }
        }
    }
    if !pending.is_empty() {
        warn!(dropped = pending.len(), "worker never received some lines");
    }
}

fn flush(session: &ClientSession, pending: &mut VecDeque<String>) {
    while let Some(line) = pending.front() {
        match session.send_telegram(line.as_bytes()) {
            Ok(()) => {
                pending.pop_front();
            }
            Err(SessionError::NotConnected) => return,
            Err(err) => {
                warn!(error = %err, "telegram not sent");
                pending.pop_front();
            }
        }
    }
}

fn spawn_event_printer(
    events: Receiver<SessionEvent>,
    session: Weak<ClientSession>,
    control: Sender<Control>,
    format: OutputFormat,
) -> CliResult<JoinHandle<()>> {
    thread::Builder::new()
        .name("ipalink-events".to_string())
        .spawn(move || {
            for event in events {
                match event {
                    SessionEvent::FrameReceived(frame) => print_frame(&frame, format),
                    SessionEvent::RunStatusChanged(running) => {
                        info!(running, "worker run status changed");
                        // Sockets only accept once the worker is up, and a
                        // restarted pipe worker has fresh stdio.
                        if running {
                            if let Some(session) = session.upgrade() {
                                if !session.is_connected() {
                                    let _ = session.connect();
                                }
                            }
                        }
                    }
                    SessionEvent::ConnectionChanged(connected) => {
                        info!(connected, "worker connection changed");
                        if connected {
                            let _ = control.send(Control::Connected);
                        }
                    }
                    SessionEvent::ProcessError(message) => error!("{message}"),
                    SessionEvent::ProcessRestarted(count) => {
                        warn!(restarts = count, "worker restarted");
                    }
                    SessionEvent::ProtocolError(message) => {
                        warn!(error = %message, "protocol error");
                    }
                }
            }
        })
        .map_err(|err| CliError::new(INTERNAL, format!("event thread failed: {err}")))
}

fn spawn_stdin_reader(control: Sender<Control>) -> CliResult<()> {
    thread::Builder::new()
        .name("ipalink-stdin".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if control.send(Control::Line(line)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "stdin read failed");
                        break;
                    }
                }
            }
            let _ = control.send(Control::Eof);
        })
        .map(|_| ())
        .map_err(|err| CliError::new(INTERNAL, format!("stdin thread failed: {err}")))
}

fn install_ctrlc_handler(control: Sender<Control>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        let _ = control.send(Control::Interrupt);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::exit::CONFIG_INVALID;

    fn args(command_line: &str) -> RunArgs {
        RunArgs {
            command_line: command_line.to_string(),
            socket: None,
            pipe: false,
            config: None,
            capacity: None,
            connect_timeout: None,
            stop_timeout: None,
            reconnect_interval: None,
            max_restarts: None,
            bypass_errors: Vec::new(),
        }
    }

    fn unique_config_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "ipalink-cli-{tag}-{}-{}.json",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ))
    }

    #[test]
    fn defaults_to_pipe_transport() {
        let config = session_config(&args("cat")).unwrap();
        assert_eq!(config.transport, TransportConfig::Pipe);
        assert_eq!(config.output, OutputMode::Inherit);
    }

    #[test]
    fn socket_flag_selects_socket_and_logs_worker_output() {
        let mut run = args("worker");
        run.socket = Some(PathBuf::from("/tmp/w.sock"));
        run.connect_timeout = Some("250ms".to_string());
        run.reconnect_interval = Some("1s".to_string());

        let config = session_config(&run).unwrap();
        assert_eq!(
            config.transport,
            TransportConfig::Socket {
                path: PathBuf::from("/tmp/w.sock")
            }
        );
        assert_eq!(config.output, OutputMode::Log);
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.reconnect_interval, Some(Duration::from_secs(1)));
    }

    #[test]
    fn flags_override_config_file() {
        let path = unique_config_path("override");
        std::fs::write(
            &path,
            r#"{
                "transport": { "kind": "socket", "path": "/tmp/from-file.sock" },
                "capacity": 4096,
                "stop_timeout_ms": 9000,
                "max_restarts": 2,
                "bypass_errors": ["Gtk-WARNING"]
            }"#,
        )
        .unwrap();

        let mut run = args("worker");
        run.config = Some(path.clone());
        run.pipe = true;
        run.stop_timeout = Some("2s".to_string());
        run.bypass_errors = vec!["dbus".to_string()];

        let config = session_config(&run).unwrap();
        assert_eq!(config.transport, TransportConfig::Pipe);
        assert_eq!(config.capacity, 4096);
        assert_eq!(config.stop_timeout, Duration::from_secs(2));
        assert_eq!(config.max_restarts, Some(2));
        assert_eq!(config.bypass_errors, vec!["Gtk-WARNING", "dbus"]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut run = args("cat");
        run.capacity = Some(0);
        assert_eq!(session_config(&run).unwrap_err().code, USAGE);
    }

    #[test]
    fn missing_config_file_fails() {
        let mut run = args("cat");
        run.config = Some(unique_config_path("missing"));
        assert_eq!(session_config(&run).unwrap_err().code, CONFIG_INVALID);
    }
}
