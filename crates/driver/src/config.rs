//! Driver configuration management

use crate::registry::DEFAULT_MINOR_BASE;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSettings,
    /// Interrupt event monitoring
    #[serde(default)]
    pub monitor: MonitorSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSettings {
    #[serde(default = "DriverSettings::default_log_level")]
    pub log_level: String,
    /// First minor number handed out
    #[serde(default = "DriverSettings::default_minor_base")]
    pub minor_base: u32,
    /// How many panels may be attached at once
    #[serde(default = "DriverSettings::default_max_devices")]
    pub max_devices: u32,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            minor_base: Self::default_minor_base(),
            max_devices: Self::default_max_devices(),
        }
    }
}

impl DriverSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_minor_base() -> u32 {
        DEFAULT_MINOR_BASE
    }

    fn default_max_devices() -> u32 {
        16
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Arm the interrupt listener on attach
    #[serde(default = "MonitorSettings::default_enabled")]
    pub enabled: bool,
    /// Longest single interrupt poll; bounds how long detach waits on an
    /// idle listener
    #[serde(default = "MonitorSettings::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Events kept per session before the oldest is dropped
    #[serde(default = "MonitorSettings::default_event_backlog")]
    pub event_backlog: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            event_backlog: Self::default_event_backlog(),
        }
    }
}

impl MonitorSettings {
    fn default_enabled() -> bool {
        true
    }

    fn default_poll_interval_ms() -> u64 {
        250
    }

    fn default_event_backlog() -> usize {
        32
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl DriverConfig {
    /// Load configuration from `path`, or from the first standard location
    /// that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()),
            None => Self::candidate_paths()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?,
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DriverConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Per-user configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("xserve-fp").join("driver.toml")
        } else {
            PathBuf::from(".config/xserve-fp/driver.toml")
        }
    }

    fn candidate_paths() -> Vec<PathBuf> {
        vec![
            Self::default_path(),
            PathBuf::from("/etc/xserve-fp/driver.toml"),
        ]
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.driver.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.driver.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.driver.max_devices == 0 {
            return Err(anyhow!("max_devices must be at least 1"));
        }
        if self
            .driver
            .minor_base
            .checked_add(self.driver.max_devices - 1)
            .is_none()
        {
            return Err(anyhow!(
                "minor_base {} leaves no room for {} devices",
                self.driver.minor_base,
                self.driver.max_devices
            ));
        }

        if self.monitor.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be greater than 0"));
        }
        if self.monitor.event_backlog == 0 {
            return Err(anyhow!("event_backlog must be at least 1"));
        }

        Ok(())
    }
}
