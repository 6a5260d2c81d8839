//! Daemon configuration.
//!
//! One TOML file configures all three services; every section has working
//! defaults so the daemons run without any file at all. Tests point the
//! paths into a tempdir.

use std::io;
use std::path::{Path, PathBuf};

use doze_core::ControlPaths;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default wakeup-count interface.
const DEFAULT_WAKEUP_COUNT: &str = "/sys/power/wakeup_count";
/// Default sleep-state interface.
const DEFAULT_POWER_STATE: &str = "/sys/power/state";
/// Default RTC wake-alarm interface.
const DEFAULT_RTC_WAKEALARM: &str = "/sys/class/rtc/rtc0/wakealarm";

/// Do not suspend when the nearest deadline is this close (seconds).
const DEFAULT_ALARM_MARGIN_SECS: u64 = 4;
/// Program the wake hardware this many seconds before the deadline.
const DEFAULT_ALARM_LEAD_SECS: u64 = 2;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),

    /// The configuration file could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A configured value is unusable.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DozeConfig {
    /// Control-surface paths.
    #[serde(default)]
    pub paths: ControlPaths,

    /// Kernel power interfaces.
    #[serde(default)]
    pub power: PowerConfig,

    /// Wake-alarm service settings.
    #[serde(default)]
    pub alarm: AlarmConfig,
}

/// Kernel power-interface paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerConfig {
    /// The wakeup-count interface.
    #[serde(default = "default_wakeup_count")]
    pub wakeup_count: PathBuf,

    /// The sleep-state interface.
    #[serde(default = "default_power_state")]
    pub state: PathBuf,
}

fn default_wakeup_count() -> PathBuf {
    PathBuf::from(DEFAULT_WAKEUP_COUNT)
}

fn default_power_state() -> PathBuf {
    PathBuf::from(DEFAULT_POWER_STATE)
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            wakeup_count: default_wakeup_count(),
            state: default_power_state(),
        }
    }
}

/// Wake-alarm service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    /// The RTC wake-alarm interface.
    #[serde(default = "default_rtc_wakealarm")]
    pub rtc_wakealarm: PathBuf,

    /// Suspend is blocked when the nearest deadline is within this many
    /// seconds.
    #[serde(default = "default_margin_secs")]
    pub margin_secs: u64,

    /// The wake hardware is programmed this many seconds ahead of the
    /// deadline.
    #[serde(default = "default_lead_secs")]
    pub lead_secs: u64,
}

fn default_rtc_wakealarm() -> PathBuf {
    PathBuf::from(DEFAULT_RTC_WAKEALARM)
}

const fn default_margin_secs() -> u64 {
    DEFAULT_ALARM_MARGIN_SECS
}

const fn default_lead_secs() -> u64 {
    DEFAULT_ALARM_LEAD_SECS
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            rtc_wakealarm: default_rtc_wakealarm(),
            margin_secs: default_margin_secs(),
            lead_secs: default_lead_secs(),
        }
    }
}

impl DozeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.alarm.lead_secs >= self.alarm.margin_secs {
            return Err(ConfigError::Validation(format!(
                "alarm.lead_secs ({}) must be smaller than alarm.margin_secs ({}); \
                 otherwise the programmed wake-up lands inside the no-suspend window",
                self.alarm.lead_secs, self.alarm.margin_secs
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = DozeConfig::from_toml("").unwrap();
        assert_eq!(config.paths.run_dir, Path::new("/run/suspend"));
        assert_eq!(config.power.wakeup_count, Path::new(DEFAULT_WAKEUP_COUNT));
        assert_eq!(config.power.state, Path::new(DEFAULT_POWER_STATE));
        assert_eq!(config.alarm.rtc_wakealarm, Path::new(DEFAULT_RTC_WAKEALARM));
        assert_eq!(config.alarm.margin_secs, 4);
        assert_eq!(config.alarm.lead_secs, 2);
    }

    #[test]
    fn test_partial_override() {
        let config = DozeConfig::from_toml(
            r#"
            [paths]
            run_dir = "/tmp/doze-test"

            [alarm]
            margin_secs = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.paths.run_dir, Path::new("/tmp/doze-test"));
        assert_eq!(config.alarm.margin_secs, 10);
        assert_eq!(config.alarm.lead_secs, 2);
        assert_eq!(config.power.state, Path::new(DEFAULT_POWER_STATE));
    }

    #[test]
    fn test_lead_must_undercut_margin() {
        let result = DozeConfig::from_toml(
            r#"
            [alarm]
            margin_secs = 2
            lead_secs = 3
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_malformed_toml_is_rejected() {
        assert!(matches!(
            DozeConfig::from_toml("[paths"),
            Err(ConfigError::Parse(_))
        ));
    }
}
