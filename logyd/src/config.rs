//! Daemon configuration, read from a TOML file.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// The longest time a Bolt receiver keeps its pairing lock open.
pub const MAX_PAIRING_TIMEOUT_SECS: u64 = 60;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Where the command socket is created.
    pub socket_path: PathBuf,

    /// The directory holding one settings file per device.
    pub state_dir: PathBuf,

    pub request_timeout_ms: u64,

    /// How long a transport read blocks before the read task checks whether
    /// it should stop.
    pub poll_interval_ms: u64,

    /// Consecutive unanswered requests after which a device counts as
    /// unreachable.
    pub grace_misses: u32,

    pub pairing_timeout_secs: u64,

    /// How often HID nodes are enumerated to notice receivers coming and
    /// going.
    pub rescan_interval_secs: u64,

    /// The default log filter, overridden by `RUST_LOG`.
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: Self::default_socket_path(),
            state_dir: Self::default_state_dir(),
            request_timeout_ms: 2000,
            poll_interval_ms: 100,
            grace_misses: 3,
            pairing_timeout_secs: 30,
            rescan_interval_secs: 2,
            log_level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Loads the configuration from `path`, or from [`Self::default_path`] if
    /// none is given.
    ///
    /// A missing file at the default location yields the defaults, a missing
    /// file that was asked for explicitly is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::default_path(), false),
        };

        if !explicit && !path.exists() {
            debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        let config: Self = toml::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("logyd")
            .join("config.toml")
    }

    fn default_socket_path() -> PathBuf {
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("logyd.sock")
    }

    fn default_state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from(".local/state"))
            .join("logyd")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log_level '{}' is none of {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if self.request_timeout_ms == 0 || self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_ms and poll_interval_ms must be positive".to_string(),
            ));
        }

        if !(1..=MAX_PAIRING_TIMEOUT_SECS).contains(&self.pairing_timeout_secs) {
            return Err(ConfigError::Invalid(format!(
                "pairing_timeout_secs must be within 1..={MAX_PAIRING_TIMEOUT_SECS}"
            )));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_timeout_secs)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs.max(1))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("the configuration is malformed")]
    Parse(#[from] toml::de::Error),

    #[error("the configuration is invalid: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let config: DaemonConfig = toml::from_str("grace_misses = 5\nlog_level = \"debug\"").unwrap();
        assert_eq!(config.grace_misses, 5);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_log_levels() {
        let config = DaemonConfig {
            log_level: "loud".to_string(),
            ..DaemonConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            DaemonConfig::load(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn loads_files_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "pairing_timeout_secs = 45\nsocket_path = \"/tmp/x.sock\"").unwrap();

        let config = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.pairing_timeout(), Duration::from_secs(45));
        assert_eq!(config.socket_path, PathBuf::from("/tmp/x.sock"));
    }
}
