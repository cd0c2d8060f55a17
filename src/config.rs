use crate::vehicle::Direction;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

const DEFAULT_DEVICE_NAME_PREFIX: &str = "rasp";
const DEFAULT_SERVICE_ID: &str = "fff0";
const DEFAULT_MAX_DISCOVERY_ATTEMPTS: u8 = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Runtime settings for discovery and vehicle creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VanetConfig {
    /// Advertisers whose name does not start with this are ignored.
    pub device_name_prefix: String,
    /// Service carrying the four telemetry channels.
    pub service_id: String,
    /// Re-discovery budget per device, shared by service and characteristic retries.
    pub max_discovery_attempts: u8,
    /// Direction assigned to newly created vehicles.
    pub default_direction: Direction,
    /// Optional service filter handed to the transport scan.
    pub scan_service_filter: Option<String>,
}

impl Default for VanetConfig {
    fn default() -> Self {
        Self {
            device_name_prefix: DEFAULT_DEVICE_NAME_PREFIX.to_string(),
            service_id: DEFAULT_SERVICE_ID.to_string(),
            max_discovery_attempts: DEFAULT_MAX_DISCOVERY_ATTEMPTS,
            default_direction: Direction::Up,
            scan_service_filter: None,
        }
    }
}

impl VanetConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_id.trim().is_empty() {
            return Err(ConfigError::Invalid("service_id must not be empty"));
        }
        if self.max_discovery_attempts == 0 {
            return Err(ConfigError::Invalid("max_discovery_attempts must be at least 1"));
        }
        Ok(())
    }
}
