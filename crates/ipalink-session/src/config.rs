use std::path::{Path, PathBuf};
use std::time::Duration;

use ipalink_frame::DEFAULT_CAPACITY;
use ipalink_process::{OutputMode, SupervisorConfig};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// How the session reaches the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Unix domain socket the worker listens on.
    Socket { path: PathBuf },
    /// The worker's stdin/stdout.
    Pipe,
}

/// Session settings. Durations are written in milliseconds in config files.
///
/// ```json
/// {
///   "transport": { "kind": "socket", "path": "/tmp/worker.sock" },
///   "capacity": 1048576,
///   "connect_timeout_ms": 5000,
///   "write_timeout_ms": 5000,
///   "reconnect_interval_ms": 1000,
///   "worker_name": "vpr",
///   "stop_timeout_ms": 5000,
///   "max_restarts": 3,
///   "output": "log",
///   "bypass_errors": ["warning:"]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub transport: TransportConfig,
    /// Bound on undelimited received data.
    pub capacity: usize,
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// Socket writes that stall longer than this fail and drop the
    /// connection.
    #[serde(rename = "write_timeout_ms", with = "millis")]
    pub write_timeout: Duration,
    /// Retry connecting at this interval while the worker runs and the
    /// connection is down. `None` leaves reconnecting to the consumer.
    #[serde(rename = "reconnect_interval_ms", with = "opt_millis")]
    pub reconnect_interval: Option<Duration>,
    pub worker_name: String,
    #[serde(rename = "watch_interval_ms", with = "millis")]
    pub watch_interval: Duration,
    #[serde(rename = "stop_timeout_ms", with = "millis")]
    pub stop_timeout: Duration,
    pub max_restarts: Option<u32>,
    #[serde(with = "output_mode")]
    pub output: OutputMode,
    /// Worker stderr lines containing any of these are logged but not
    /// reported as [`SessionEvent::ProcessError`](crate::SessionEvent::ProcessError).
    pub bypass_errors: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let supervisor = SupervisorConfig::default();
        Self {
            transport: TransportConfig::Pipe,
            capacity: DEFAULT_CAPACITY,
            connect_timeout: Duration::from_millis(5000),
            write_timeout: Duration::from_millis(5000),
            reconnect_interval: None,
            worker_name: supervisor.name,
            watch_interval: supervisor.watch_interval,
            stop_timeout: supervisor.stop_timeout,
            max_restarts: supervisor.max_restarts,
            output: supervisor.output,
            bypass_errors: supervisor.bypass_errors,
        }
    }
}

impl SessionConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| SessionError::Config {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Supervisor settings derived from this config. The pipe transport
    /// needs the worker's stdio, so it forces [`OutputMode::Pipe`].
    pub fn supervisor_config(&self) -> SupervisorConfig {
        let output = match self.transport {
            TransportConfig::Pipe => OutputMode::Pipe,
            TransportConfig::Socket { .. } => self.output,
        };
        SupervisorConfig {
            name: self.worker_name.clone(),
            watch_interval: self.watch_interval,
            stop_timeout: self.stop_timeout,
            max_restarts: self.max_restarts,
            output,
            bypass_errors: self.bypass_errors.clone(),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => super::millis::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

mod output_mode {
    use ipalink_process::OutputMode;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &OutputMode, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OutputMode, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_supervisor_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.watch_interval, Duration::from_millis(500));
        assert_eq!(config.stop_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect_interval, None);
        assert_eq!(config.max_restarts, None);
        assert_eq!(config.write_timeout, Duration::from_secs(5));
        assert!(config.bypass_errors.is_empty());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config = SessionConfig::from_json_str(
            r#"{
                "transport": { "kind": "socket", "path": "/tmp/worker.sock" },
                "reconnect_interval_ms": 1000,
                "stop_timeout_ms": 250,
                "write_timeout_ms": 750,
                "output": "log",
                "bypass_errors": ["deprecated", "warning:"]
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.transport,
            TransportConfig::Socket {
                path: PathBuf::from("/tmp/worker.sock")
            }
        );
        assert_eq!(config.reconnect_interval, Some(Duration::from_secs(1)));
        assert_eq!(config.stop_timeout, Duration::from_millis(250));
        assert_eq!(config.output, OutputMode::Log);
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.write_timeout, Duration::from_millis(750));
        assert_eq!(config.bypass_errors, vec!["deprecated", "warning:"]);
        assert_eq!(
            config.supervisor_config().bypass_errors,
            config.bypass_errors
        );
    }

    #[test]
    fn serializes_durations_as_millis() {
        let config = SessionConfig {
            reconnect_interval: Some(Duration::from_millis(1500)),
            ..SessionConfig::default()
        };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["connect_timeout_ms"], 5000);
        assert_eq!(value["reconnect_interval_ms"], 1500);
        assert_eq!(value["transport"]["kind"], "pipe");
        assert_eq!(value["output"], "inherit");

        let back: SessionConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn unknown_output_mode_is_rejected() {
        let err = SessionConfig::from_json_str(r#"{ "output": "tty" }"#).unwrap_err();
        assert!(matches!(err, SessionError::Json(_)));
    }

    #[test]
    fn pipe_transport_forces_pipe_output() {
        let config = SessionConfig {
            output: OutputMode::Null,
            ..SessionConfig::default()
        };
        assert_eq!(config.supervisor_config().output, OutputMode::Pipe);

        let config = SessionConfig {
            transport: TransportConfig::Socket {
                path: PathBuf::from("/tmp/x.sock"),
            },
            output: OutputMode::Null,
            ..SessionConfig::default()
        };
        assert_eq!(config.supervisor_config().output, OutputMode::Null);
    }

    #[test]
    fn missing_file_reports_path() {
        let path = std::env::temp_dir().join(format!(
            "ipalink-missing-config-{}.json",
            std::process::id()
        ));
        let err = SessionConfig::from_json_file(&path).unwrap_err();
        assert!(matches!(err, SessionError::Config { path: ref p, .. } if *p == path));
    }
}
