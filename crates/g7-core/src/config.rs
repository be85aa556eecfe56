//! Connection and session configuration.
//!
//! Configuration is plain data loaded from TOML. Runtime flags that callers
//! may flip while the manager runs (stay-connected, scan-while-connecting)
//! are seeded from here and then live in the manager's own cells.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default delay before rescanning after a dropped link.
pub const DEFAULT_RESCAN_DELAY: Duration = Duration::from_secs(2);

/// Minimum rescan delay in milliseconds.
pub const MIN_RESCAN_DELAY_MS: u64 = 100;
/// Maximum rescan delay in milliseconds (1 minute).
pub const MAX_RESCAN_DELAY_MS: u64 = 60_000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection manager settings.
    pub connection: ConnectionConfig,
    /// Session layer settings.
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Load configuration from a file if it exists, defaults otherwise.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// # Example
    ///
    /// ```
    /// use g7_core::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = self.connection.validate();
        errors.extend(self.session.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Connection manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Rescan automatically after a dropped link or failed connection.
    pub stay_connected: bool,
    /// Keep scanning while a connection attempt is in flight.
    pub scan_while_connecting: bool,
    /// Delay before the automatic rescan, in milliseconds.
    pub rescan_delay_ms: u64,
    /// Capacity of the manager's command queue.
    pub command_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            stay_connected: true,
            scan_while_connecting: false,
            rescan_delay_ms: DEFAULT_RESCAN_DELAY.as_millis() as u64,
            command_capacity: 32,
        }
    }
}

impl ConnectionConfig {
    /// Set whether to rescan after a dropped link.
    #[must_use]
    pub fn stay_connected(mut self, enabled: bool) -> Self {
        self.stay_connected = enabled;
        self
    }

    /// Set whether scanning continues while connecting.
    #[must_use]
    pub fn scan_while_connecting(mut self, enabled: bool) -> Self {
        self.scan_while_connecting = enabled;
        self
    }

    /// Set the rescan delay.
    #[must_use]
    pub fn rescan_delay(mut self, delay: Duration) -> Self {
        self.rescan_delay_ms = delay.as_millis() as u64;
        self
    }

    /// The rescan delay as a [`Duration`].
    pub fn rescan_delay_duration(&self) -> Duration {
        Duration::from_millis(self.rescan_delay_ms)
    }

    /// Validate connection configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !(MIN_RESCAN_DELAY_MS..=MAX_RESCAN_DELAY_MS).contains(&self.rescan_delay_ms) {
            errors.push(ValidationError {
                field: "connection.rescan_delay_ms".to_string(),
                message: format!(
                    "rescan delay {}ms is out of range ({}-{}ms)",
                    self.rescan_delay_ms, MIN_RESCAN_DELAY_MS, MAX_RESCAN_DELAY_MS
                ),
            });
        }
        if self.command_capacity == 0 {
            errors.push(ValidationError {
                field: "connection.command_capacity".to_string(),
                message: "command capacity must be greater than 0".to_string(),
            });
        }

        errors
    }
}

/// Session layer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the session event broadcast channel.
    pub event_capacity: usize,
    /// Minutes without a reading before the session reports signal loss.
    pub signal_loss_minutes: u32,
    /// Where session state is persisted, if anywhere.
    pub state_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_capacity: 100,
            signal_loss_minutes: 15,
            state_path: None,
        }
    }
}

impl SessionConfig {
    /// Signal loss threshold as a [`time::Duration`].
    pub fn signal_loss_threshold(&self) -> time::Duration {
        time::Duration::minutes(i64::from(self.signal_loss_minutes))
    }

    /// Validate session configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.event_capacity == 0 {
            errors.push(ValidationError {
                field: "session.event_capacity".to_string(),
                message: "event capacity must be greater than 0".to_string(),
            });
        }
        if self.signal_loss_minutes == 0 {
            errors.push(ValidationError {
                field: "session.signal_loss_minutes".to_string(),
                message: "signal loss threshold must be at least 1 minute".to_string(),
            });
        }
        if let Some(path) = &self.state_path
            && path.as_os_str().is_empty()
        {
            errors.push(ValidationError {
                field: "session.state_path".to_string(),
                message: "state path cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `connection.rescan_delay_ms`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}
