//! Bridge configuration
//!
//! The whole bridge is configured from a single TOML file that is read once at
//! startup. Every section has defaults except the broker host and the blind
//! list, so a minimal file looks like:
//!
//! ```toml
//! [mqtt]
//! host = "broker.local"
//!
//! [[blind]]
//! id = "window1"
//! address = "02:4E:F0:E9:6E:01"
//! location = "Living Room"
//! ```
//!
//! [`BridgeConfig::validate`] runs before anything touches the network, so a
//! broken file aborts the process without a single connection attempt.

use crate::mqtt::config::MqttConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Lower bound for the poll interval. Every poll wakes the blinds' radios, so
/// shorter intervals drain their batteries.
pub const MIN_POLL_INTERVAL_SECS: u64 = 30;

/// Errors raised while loading or validating configuration
///
/// All of these are fatal and happen before the bridge connects anywhere.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid device id {0:?}: ids must be non-empty and use only ASCII letters, digits, '_' or '-'")]
    InvalidDeviceId(String),

    #[error("device id {0:?} is configured more than once")]
    DuplicateDevice(String),

    #[error("devices {first:?} and {second:?} share the address {address}")]
    DuplicateAddress {
        address: String,
        first: String,
        second: String,
    },

    #[error("devices {first:?} and {second:?} both map to topic {topic}")]
    TopicCollision {
        topic: String,
        first: String,
        second: String,
    },
}

/// Root of the configuration file
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct BridgeConfig {
    /// Seconds between two full-fleet polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Seconds to wait after a command before reading the blind back
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,

    pub mqtt: MqttConfig,

    #[serde(default)]
    pub driver: DriverConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Blinds in the order they are polled and announced
    #[serde(default, rename = "blind")]
    pub blinds: Vec<BlindConfig>,
}

/// One `[[blind]]` entry
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct BlindConfig {
    pub id: String,
    /// Driver address, usually the Bluetooth MAC of the motor
    #[serde(alias = "mac_address")]
    pub address: String,
    pub location: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

/// Limits applied to calls into the device driver
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DriverConfig {
    #[serde(default = "default_driver_timeout")]
    pub timeout_secs: u64,
    /// Maximum number of driver calls running at the same time
    #[serde(default = "default_driver_workers")]
    pub workers: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_driver_timeout(),
            workers: default_driver_workers(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directives, overridden by `RUST_LOG`
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Optional file that receives a copy of every log line
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            file: None,
        }
    }
}

fn default_poll_interval() -> u64 {
    1200
}

fn default_settle_delay() -> u64 {
    30
}

fn default_driver_timeout() -> u64 {
    20
}

fn default_driver_workers() -> usize {
    4
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl BridgeConfig {
    /// Reads, parses and validates a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from {}", path.display());
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(raw)?;
        config.validate()?;
        debug!(
            "Configuration loaded: {} blinds, broker {}:{}",
            config.blinds.len(),
            config.mqtt.host,
            config.mqtt.port
        );
        Ok(config)
    }

    /// Range and consistency checks that serde cannot express
    ///
    /// Device id and address checks live in
    /// [`DeviceRegistry::from_config`](crate::devices::DeviceRegistry::from_config)
    /// so that the registry can never be built from unchecked input.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs < MIN_POLL_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "poll_interval_secs must be at least {MIN_POLL_INTERVAL_SECS}, got {}",
                self.poll_interval_secs
            )));
        }
        if self.driver.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "driver.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.driver.workers == 0 {
            return Err(ConfigError::Invalid(
                "driver.workers must be greater than 0".to_string(),
            ));
        }
        self.mqtt.validate()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    /// `<config dir>/blindbridge/config.toml`, e.g. `~/.config/blindbridge/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("blindbridge").join("config.toml"))
    }
}
