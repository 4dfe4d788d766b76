use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SupervisorError};

/// A worker command line: program plus arguments.
///
/// Parsing splits on whitespace only. There is no quoting, so arguments
/// cannot contain spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next().ok_or(SupervisorError::InvalidCommand)?;
        Ok(Self::new(program, parts))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl FromStr for CommandLine {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_program_and_arguments() {
        let cmd = CommandLine::parse("vpr arch.xml circuit.blif --server --port 60555").unwrap();
        assert_eq!(cmd.program(), "vpr");
        assert_eq!(
            cmd.args(),
            &["arch.xml", "circuit.blif", "--server", "--port", "60555"]
        );
    }

    #[test]
    fn collapses_repeated_whitespace() {
        let cmd: CommandLine = "  worker \t -v   --fast ".parse().unwrap();
        assert_eq!(cmd, CommandLine::new("worker", ["-v", "--fast"]));
        assert_eq!(cmd.to_string(), "worker -v --fast");
    }

    #[test]
    fn empty_line_is_invalid() {
        assert!(matches!(
            CommandLine::parse(""),
            Err(SupervisorError::InvalidCommand)
        ));
        assert!(matches!(
            CommandLine::parse("   \t"),
            Err(SupervisorError::InvalidCommand)
        ));
    }
}
