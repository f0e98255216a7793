//! Reader configuration.
//!
//! Loadable from TOML; every field has a default, so an empty document is a
//! valid configuration:
//!
//! ```toml
//! id_addressing = "base_offset"   # unset: accept what the store records
//! start_position = "beginning"
//! poll_backoff_us = 1
//! discovery_idle_ms = 500
//! discovery_enabled = true
//! status_interval = 1024
//! orphan_timeout_ms = 5000
//! ```

use crate::error::ConfigError;
use crate::metadata::IdAddressing;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Where the change-queue consumer starts reading.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Logical position 0. Everything still in the queue is replayed, and a
    /// long-running writer shows up as one initial drop.
    #[default]
    Beginning,
    /// The head at reader start; only notifications published afterwards
    /// are delivered.
    Latest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaderConfig {
    /// Id addressing the store must have been created with.
    pub id_addressing: Option<IdAddressing>,
    pub start_position: StartPosition,
    /// Sleep between idle change-queue polls, in µs. `0` yields instead.
    pub poll_backoff_us: u64,
    /// Sleep between idle discovery polls, in ms.
    pub discovery_idle_ms: u64,
    pub discovery_enabled: bool,
    /// Drain cycles per status signal.
    pub status_interval: u64,
    /// Warn when the writer heartbeat is older than this, in ms.
    pub orphan_timeout_ms: Option<u64>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            id_addressing: None,
            start_position: StartPosition::Beginning,
            poll_backoff_us: 1,
            discovery_idle_ms: 500,
            discovery_enabled: true,
            status_interval: 1024,
            orphan_timeout_ms: None,
        }
    }
}

impl ReaderConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed TOML or unknown keys,
    /// [`ConfigError::Invalid`] on out-of-range values.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if `status_interval` or `orphan_timeout_ms`
    /// is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.status_interval == 0 {
            return Err(ConfigError::Invalid("status_interval must be > 0".into()));
        }
        if self.orphan_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("orphan_timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn poll_backoff(&self) -> Duration {
        Duration::from_micros(self.poll_backoff_us)
    }

    pub fn discovery_idle(&self) -> Duration {
        Duration::from_millis(self.discovery_idle_ms)
    }

    pub fn orphan_timeout(&self) -> Option<Duration> {
        self.orphan_timeout_ms.map(Duration::from_millis)
    }
}
