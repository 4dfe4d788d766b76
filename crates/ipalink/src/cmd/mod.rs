use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod run;
pub mod version;
pub mod worker;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a worker, relay stdin lines to it as telegrams and print replies.
    Run(RunArgs),
    /// Reference echo worker.
    Worker(WorkerArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Run(args) => run::run(args, format),
        Command::Worker(args) => worker::run(args),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Worker command line, split on whitespace.
    #[arg(value_name = "COMMAND_LINE")]
    pub command_line: String,
    /// Connect to the worker over this Unix domain socket.
    #[arg(long, value_name = "PATH", conflicts_with = "pipe")]
    pub socket: Option<PathBuf>,
    /// Talk to the worker over its stdin/stdout (default).
    #[arg(long)]
    pub pipe: bool,
    /// JSON session config; flags override its values.
    #[arg(long, value_name = "FILE", env = "IPALINK_CONFIG")]
    pub config: Option<PathBuf>,
    /// Bound on undelimited received data, in bytes.
    #[arg(long, value_name = "BYTES")]
    pub capacity: Option<usize>,
    /// How long to keep dialing the socket (e.g. 5s, 500ms).
    #[arg(long, value_name = "DURATION")]
    pub connect_timeout: Option<String>,
    /// Grace period between SIGTERM and SIGKILL on stop (e.g. 5s, 500ms).
    #[arg(long, value_name = "DURATION")]
    pub stop_timeout: Option<String>,
    /// Retry the connection at this interval while it is down.
    #[arg(long, value_name = "DURATION")]
    pub reconnect_interval: Option<String>,
    /// Give up after this many automatic restarts.
    #[arg(long, value_name = "N")]
    pub max_restarts: Option<u32>,
    /// Worker stderr lines containing this text are not reported as
    /// errors. Repeatable.
    #[arg(long = "bypass-error", value_name = "TEXT")]
    pub bypass_errors: Vec<String>,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Listen on this Unix domain socket instead of using stdin/stdout.
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `150ms`, `2s` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
