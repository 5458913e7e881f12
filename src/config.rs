//! # Configuration Management Module
//!
//! Persistent session settings stored in platform-appropriate locations.
//! Handles loading, saving, and providing defaults for configuration options.
//!
//! ## Settings
//! - device matching: name prefix and GATT UUID overrides
//! - timing: scan/connect/write timeouts, poll and keep-alive intervals
//! - recovery: auto-reconnect, backoff strategy, poll retry bound
//! - `telemetry_retention`: keep or clear telemetry when the link drops
//! - run defaults: strength and duration offered to the presentation layer
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/vagus-link/config.toml
//! - Linux: ~/.config/vagus-link/config.toml
//! - Windows: %APPDATA%\vagus-link\config.toml

use crate::error::ConfigError;
use crate::policy::{BackoffStrategy, ExponentialBackoff, FixedBackoff, ReconnectPolicy};
use crate::protocol;
use crate::telemetry::TelemetryRetention;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub device_name_prefix: String,
    pub service_uuid: String,
    pub write_char_uuid: String,
    pub notify_char_uuid: String,
    pub scan_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub write_timeout_ms: u64,
    pub auto_reconnect: bool,
    pub reconnect_backoff: BackoffStrategy,
    pub reconnect_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub telemetry_retention: TelemetryRetention,
    pub poll_enabled: bool,
    pub poll_interval_active_secs: u64,
    pub poll_interval_idle_secs: u64,
    pub keepalive_interval_secs: u64,
    pub max_retry_attempts: u32,
    pub default_strength: u8,
    pub default_duration_minutes: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            device_name_prefix: protocol::DEVICE_NAME_PREFIX.to_string(),
            service_uuid: protocol::SERVICE_UUID.to_string(),
            write_char_uuid: protocol::WRITE_CHAR_UUID.to_string(),
            notify_char_uuid: protocol::NOTIFY_CHAR_UUID.to_string(),
            scan_timeout_secs: 10,
            connect_timeout_secs: 10,
            write_timeout_ms: 2_000,
            auto_reconnect: true,
            reconnect_backoff: BackoffStrategy::Fixed,
            reconnect_delay_ms: 1_500,
            reconnect_max_delay_ms: 30_000,
            telemetry_retention: TelemetryRetention::Preserve,
            poll_enabled: true,
            poll_interval_active_secs: 15,
            poll_interval_idle_secs: 60,
            keepalive_interval_secs: 20,
            max_retry_attempts: 3,
            default_strength: 5,
            default_duration_minutes: 4,
        }
    }
}

/// GATT identifiers resolved from the config strings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattIds {
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
}

impl Config {
    /// Get the path to the config file
    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vagus-link")
            .join("config.toml")
    }

    /// Load config from the default location, or create default if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config = toml::from_str(&contents)
                    .map_err(ConfigError::ParseFailed)?;
                config.gatt_ids()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save_to(path)?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string)
            .map_err(ConfigError::WriteFailed)?;

        Ok(())
    }

    pub fn gatt_ids(&self) -> Result<GattIds, ConfigError> {
        fn parse(field: &'static str, value: &str) -> Result<Uuid, ConfigError> {
            Uuid::parse_str(value).map_err(|_| ConfigError::InvalidUuid {
                field,
                value: value.to_string(),
            })
        }

        Ok(GattIds {
            service: parse("service_uuid", &self.service_uuid)?,
            write: parse("write_char_uuid", &self.write_char_uuid)?,
            notify: parse("notify_char_uuid", &self.notify_char_uuid)?,
        })
    }

    pub fn reconnect_policy(&self) -> Box<dyn ReconnectPolicy> {
        let delay = Duration::from_millis(self.reconnect_delay_ms);
        match self.reconnect_backoff {
            BackoffStrategy::Fixed => Box::new(FixedBackoff { delay }),
            BackoffStrategy::Exponential => Box::new(ExponentialBackoff {
                base: delay,
                max: Duration::from_millis(self.reconnect_max_delay_ms.max(self.reconnect_delay_ms)),
            }),
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Status poll period; shorter while a run is in progress
    pub fn poll_interval(&self, running: bool) -> Duration {
        if running {
            Duration::from_secs(self.poll_interval_active_secs.max(1))
        } else {
            Duration::from_secs(self.poll_interval_idle_secs.max(1))
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.auto_reconnect);
        assert_eq!(config.scan_timeout_secs, 10);
        assert_eq!(config.telemetry_retention, TelemetryRetention::Preserve);
        assert!(config.poll_interval(true) < config.poll_interval(false));
        assert!(config.gatt_ids().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config {
            auto_reconnect: false,
            telemetry_retention: TelemetryRetention::Clear,
            ..Config::default()
        };

        let toml_str = toml::to_string(&config).expect("Failed to serialize");
        assert!(toml_str.contains("auto_reconnect = false"));
        assert!(toml_str.contains("telemetry_retention = \"clear\""));
    }

    #[test]
    fn test_config_partial_deserialization() {
        let toml_str = r#"
            auto_reconnect = false
            reconnect_backoff = "exponential"
        "#;

        let config: Config = toml::from_str(toml_str).expect("Failed to deserialize");
        assert!(!config.auto_reconnect);
        assert_eq!(config.reconnect_backoff, BackoffStrategy::Exponential);
        assert_eq!(config.max_retry_attempts, 3);
    }

    #[test]
    fn test_config_load_creates_default() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).expect("Failed to load config");
        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn test_config_save_and_reload() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("config.toml");
        let config = Config {
            device_name_prefix: "VNS-LAB".to_string(),
            max_retry_attempts: 5,
            ..Config::default()
        };

        config.save_to(&path).expect("Failed to save config");
        let loaded = Config::load_from(&path).expect("Failed to load config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_rejects_invalid_uuid() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "service_uuid = \"not-a-uuid\"\n").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::InvalidUuid { field: "service_uuid", .. })
        ));
    }

    #[test]
    fn test_reconnect_policy_selection() {
        let fixed = Config::default().reconnect_policy();
        assert_eq!(fixed.delay(1), fixed.delay(5));

        let exponential = Config {
            reconnect_backoff: BackoffStrategy::Exponential,
            ..Config::default()
        }
        .reconnect_policy();
        assert!(exponential.delay(3) > exponential.delay(1));
    }
}
