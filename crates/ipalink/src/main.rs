mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "ipalink", version, about = "Supervised worker IPC client")]
struct Cli {
    /// Output format for received frames.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_subcommand() {
        let cli = Cli::try_parse_from([
            "ipalink",
            "run",
            "my-worker --serve",
            "--socket",
            "/tmp/test.sock",
            "--stop-timeout",
            "2s",
        ])
        .expect("run args should parse");

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.command_line, "my-worker --serve");
        assert_eq!(args.stop_timeout.as_deref(), Some("2s"));
    }

    #[test]
    fn rejects_socket_with_pipe() {
        let err = Cli::try_parse_from([
            "ipalink",
            "run",
            "cat",
            "--socket",
            "/tmp/test.sock",
            "--pipe",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn global_flags_apply_after_subcommand() {
        let cli = Cli::try_parse_from([
            "ipalink",
            "worker",
            "--format",
            "raw",
            "--log-level",
            "off",
        ])
        .expect("worker args should parse");
        assert_eq!(cli.format, Some(OutputFormat::Raw));
        assert_eq!(cli.log_level, LogLevel::Off);
        assert!(matches!(cli.command, Command::Worker(_)));
    }
}
