//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `ASTRO_DAQ_`, nested keys separated
//!    by a double underscore
//!
//! # Example
//! ```no_run
//! use astro_daq::config::AstroConfig;
//!
//! let config = AstroConfig::load_from("config/astro-daq.toml")?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), astro_daq::config::ConfigError>(())
//! ```
//!
//! ```toml
//! [application]
//! log_level = "debug"
//!
//! [hotplug]
//! capacity = 10
//!
//! [[devices]]
//! id = "EQ6"
//! driver = "synscan"
//! [devices.config]
//! port = "/dev/ttyUSB0"
//! ```

use crate::logging::LogFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/astro-daq.toml";
pub const ENV_PREFIX: &str = "ASTRO_DAQ_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to parse configuration: {0}")]
    Parse(Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Parse(Box::new(err))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AstroConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub hotplug: HotplugSettings,
    /// Statically configured devices (serial/TCP mounts, simulators)
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// USB hot-plug settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotplugSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Maximum number of endpoints created from hot-plugged devices
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Delay between a USB event and the rescan, in milliseconds
    #[serde(default = "default_defer_ms")]
    pub defer_ms: u64,
    /// Only enumerate these USB vendors (empty = all)
    #[serde(default)]
    pub vendor_ids: Vec<u16>,
}

impl Default for HotplugSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            capacity: default_capacity(),
            defer_ms: default_defer_ms(),
            vendor_ids: Vec::new(),
        }
    }
}

impl HotplugSettings {
    pub fn defer(&self) -> Duration {
        Duration::from_millis(self.defer_ms)
    }
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device identifier, also the endpoint name
    pub id: String,
    /// Driver type (e.g. "synscan", "sim_camera")
    pub driver: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver-specific configuration, checked by the driver factory
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

fn default_name() -> String {
    "astro-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_capacity() -> usize {
    astro_hardware::hotplug::DEFAULT_CAPACITY
}

fn default_defer_ms() -> u64 {
    astro_hardware::hotplug::HOTPLUG_DEFER.as_millis() as u64
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl AstroConfig {
    /// Load configuration from the default path and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables override the file, e.g.
    /// `ASTRO_DAQ_APPLICATION__LOG_LEVEL=debug`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides)
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        crate::logging::parse_log_level(&self.application.log_level).map_err(ConfigError::Invalid)?;

        if self.hotplug.capacity == 0 {
            return Err(ConfigError::Invalid(
                "hotplug.capacity must be at least 1".into(),
            ));
        }
        if self.hotplug.defer_ms == 0 {
            return Err(ConfigError::Invalid(
                "hotplug.defer_ms must be positive".into(),
            ));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(ConfigError::Invalid("Device with empty id".into()));
            }
            if device.driver.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Device '{}' has no driver",
                    device.id
                )));
            }
            if !ids.insert(device.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate device ID: {}",
                    device.id
                )));
            }
        }
        Ok(())
    }

    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceDefinition> {
        self.devices.iter().filter(|d| d.enabled)
    }
}
