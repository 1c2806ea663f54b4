//! Serial session configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::BaudRate;

/// Environment variable naming the preferred device.
pub const ENV_PORT: &str = "SERIAL_PORT";
/// Environment variable holding the baud rate.
pub const ENV_BAUD: &str = "SERIAL_BAUD";
/// Environment variable holding the disconnect poll interval.
pub const ENV_POLL_MS: &str = "SERIAL_POLL_MS";
/// Environment variable holding the blocking read timeout.
pub const ENV_READ_TIMEOUT_MS: &str = "SERIAL_READ_TIMEOUT_MS";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unsupported baud rate: {0}")]
    InvalidBaudRate(u32),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Serial session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Line speed used when the port is opened.
    pub baud_rate: BaudRate,

    /// Preferred device path; the first enumerated port is used when unset.
    pub port_path: Option<String>,

    /// How often the native platform checks for removed devices.
    pub poll_interval_ms: u64,

    /// Blocking read timeout for native ports.
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: BaudRate::default(),
            port_path: None,
            poll_interval_ms: 500,
            read_timeout_ms: 50,
        }
    }
}

impl SerialConfig {
    /// Set the baud rate.
    #[must_use]
    pub const fn with_baud_rate(mut self, baud_rate: BaudRate) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the preferred device path.
    #[must_use]
    pub fn with_port_path(mut self, path: impl Into<String>) -> Self {
        self.port_path = Some(path.into());
        self
    }

    /// Defaults overlaid with `SERIAL_*` environment variables.
    ///
    /// # Errors
    /// Returns error if a variable is set to an unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from an arbitrary key lookup.
    ///
    /// # Errors
    /// Returns error if a value is present but cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_PORT).filter(|p| !p.trim().is_empty()) {
            config.port_path = Some(path);
        }
        if let Some(raw) = lookup(ENV_BAUD) {
            let bits = parse_number::<u32>(ENV_BAUD, &raw)?;
            config.baud_rate = BaudRate::try_from(bits)?;
        }
        if let Some(raw) = lookup(ENV_POLL_MS) {
            config.poll_interval_ms = parse_number(ENV_POLL_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_READ_TIMEOUT_MS) {
            config.read_timeout_ms = parse_number(ENV_READ_TIMEOUT_MS, &raw)?;
        }

        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}
