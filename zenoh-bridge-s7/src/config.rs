//! Configuration for the S7 bridge.

use s7bridge_common::config::{LoggingConfig, ZenohConfig, load_config, parse_config};
use s7bridge_common::keyexpr::{BridgeKeys, KEY_PREFIX, validate_prefix};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::device::SimulatedPlc;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] s7bridge_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S7BridgeConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// PLC connection settings
    pub plc: PlcConfig,

    /// Bridge behaviour
    #[serde(default)]
    pub bridge: BridgeSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// PLC connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlcConfig {
    /// PLC IP address or hostname
    pub address: String,

    /// Rack number (default: 0)
    #[serde(default)]
    pub rack: u16,

    /// Slot number (default: 0)
    #[serde(default)]
    pub slot: u16,

    /// Data blocks exposed by the simulated transport
    #[serde(default)]
    pub blocks: Vec<BlockConfig>,
}

/// A data block of the simulated transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockConfig {
    /// Data block number
    pub db: u16,
    /// Size in bytes
    pub size: usize,
}

impl PlcConfig {
    /// Build the simulated PLC described by `blocks`.
    pub fn simulated(&self) -> SimulatedPlc {
        self.blocks
            .iter()
            .fold(SimulatedPlc::new(), |plc, block| plc.with_block(block.db, block.size))
    }
}

/// Settings of the bridging engine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Key expression prefix (default: "s7bridge")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Poll interval in milliseconds (default: 100)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_key_prefix() -> String {
    KEY_PREFIX.to_string()
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl BridgeSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn keys(&self) -> BridgeKeys {
        BridgeKeys::new(&self.key_prefix)
    }
}

impl S7BridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: S7BridgeConfig = load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a JSON5 string.
    pub fn from_json5(content: &str) -> Result<Self, ConfigError> {
        let config: S7BridgeConfig = parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plc.address.trim().is_empty() {
            return Err(ConfigError::Validation(
                "PLC address cannot be empty".to_string(),
            ));
        }

        validate_prefix(&self.bridge.key_prefix).map_err(ConfigError::Validation)?;

        if self.bridge.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        for block in &self.plc.blocks {
            if block.size == 0 {
                return Err(ConfigError::Validation(format!(
                    "DB{}: block size must be greater than 0",
                    block.db
                )));
            }
        }

        Ok(())
    }
}
