//! Bridge configuration
//!
//! Every setting has a built-in default matching the supported controller
//! and broker, so the bridge runs without a config file. A TOML file can
//! override any subset:
//!
//! ```toml
//! [mqtt]
//! server = "ssl://broker.lan:8883"
//! topic = "studio/pads"
//!
//! [pipeline]
//! queue_capacity = 32
//!
//! [retry]
//! max_attempts = 20
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::controller::usb_link::DeviceSettings;
use crate::mqtt::config::MqttSettings;
use crate::pipeline::publisher::PublishSettings;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::PipelineSettings;

const APP_DIR: &str = "akai-bridge";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unable to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),

    #[error("Invalid broker address {0}")]
    InvalidBroker(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub device: DeviceSettings,
    pub mqtt: MqttSettings,
    pub pipeline: PipelineSettings,
    pub retry: RetryPolicy,
}

impl BridgeConfig {
    /// `<config dir>/akai-bridge/config.toml`, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Loads the given file, or the default file when it exists, or falls
    /// back to built-in defaults. The result is validated.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    debug!("No configuration file found, using defaults");
                    Self::default()
                }
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loading configuration from {}", path.display());
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Command line override for the broker address
    pub fn with_server(mut self, server: Option<String>) -> Self {
        if let Some(server) = server {
            debug!("Broker address overridden: {}", server);
            self.mqtt.server = server;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue_capacity()?;
        self.mqtt.validate()?;
        if self.mqtt.keep_alive_secs < 5 {
            return Err(ConfigError::Invalid(format!(
                "mqtt.keep_alive_secs must be at least 5 (got {})",
                self.mqtt.keep_alive_secs
            )));
        }
        if self.retry.initial_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry.initial_backoff_ms must be at least 1".into(),
            ));
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.max_backoff_ms ({}) is below retry.initial_backoff_ms ({})",
                self.retry.max_backoff_ms, self.retry.initial_backoff_ms
            )));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be at least 1.0 (got {})",
                self.retry.multiplier
            )));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn queue_capacity(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.pipeline.queue_capacity).ok_or_else(|| {
            ConfigError::Invalid("pipeline.queue_capacity must be at least 1".into())
        })
    }

    pub fn publish_settings(&self) -> PublishSettings {
        PublishSettings {
            topic: self.mqtt.topic.clone(),
            qos: self.mqtt.qos(),
            retain: self.mqtt.retain,
        }
    }
}
