//! Coordinator configuration, read from `phasewright.toml`.
//!
//! Every section and field is optional; missing values fall back to the
//! built-in defaults.
//!
//! ```toml
//! [monitor]
//! interval_secs = 60
//! stall_threshold_secs = 3600
//! warning_percent = 50
//! critical_percent = 75
//!
//! [nested]
//! fallback_timeout_secs = 1800
//!
//! [nested.timeouts]
//! phase_four = 7200
//! phase_custom_eval = 900
//!
//! [circuit_breakers.phase_two]
//! failure_threshold = 8
//!
//! [logging]
//! level = "debug"
//! json = true
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::breaker::{CircuitBreakerConfig, TRANSITION_BREAKER};
use crate::phase::BuiltinPhase;

/// File name looked up by [`CoordinatorConfig::load_or_default`].
pub const CONFIG_FILE_NAME: &str = "phasewright.toml";

/// Environment variable overriding `logging.level`.
pub const LOG_LEVEL_ENV: &str = "PHASEWRIGHT_LOG";

/// Watchdog settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between sweeps
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// RUNNING longer than this is reported as stalled
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,
    /// Backoff after a failed sweep
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    /// Share of the timeout after which an idle execution gets a warning
    #[serde(default = "default_warning_percent")]
    pub warning_percent: u32,
    /// Share of the timeout after which an idle execution gets a critical alert
    #[serde(default = "default_critical_percent")]
    pub critical_percent: u32,
    /// Idle time required for the warning alert
    #[serde(default = "default_warning_idle_secs")]
    pub warning_idle_secs: u64,
    /// Idle time required for the critical alert
    #[serde(default = "default_critical_idle_secs")]
    pub critical_idle_secs: u64,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_stall_threshold_secs() -> u64 {
    3600
}

fn default_error_backoff_secs() -> u64 {
    10
}

fn default_warning_percent() -> u32 {
    50
}

fn default_critical_percent() -> u32 {
    75
}

fn default_warning_idle_secs() -> u64 {
    1800
}

fn default_critical_idle_secs() -> u64 {
    900
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            stall_threshold_secs: default_stall_threshold_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            warning_percent: default_warning_percent(),
            critical_percent: default_critical_percent(),
            warning_idle_secs: default_warning_idle_secs(),
            critical_idle_secs: default_critical_idle_secs(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn warning_idle(&self) -> Duration {
        Duration::from_secs(self.warning_idle_secs)
    }

    pub fn critical_idle(&self) -> Duration {
        Duration::from_secs(self.critical_idle_secs)
    }
}

/// Nested execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedConfig {
    /// Timeout for built-in types without a table entry
    #[serde(default = "default_fallback_timeout_secs")]
    pub fallback_timeout_secs: u64,
    /// Timeout when the child's type cannot be resolved at all
    #[serde(default = "default_unknown_type_timeout_secs")]
    pub unknown_type_timeout_secs: u64,
    /// Per-type timeouts in seconds
    #[serde(default = "default_timeouts")]
    pub timeouts: BTreeMap<String, u64>,
}

fn default_fallback_timeout_secs() -> u64 {
    1800
}

fn default_unknown_type_timeout_secs() -> u64 {
    3600
}

fn default_timeouts() -> BTreeMap<String, u64> {
    BTreeMap::from([
        (BuiltinPhase::Four.as_str().to_string(), 7200),
        (BuiltinPhase::Three.as_str().to_string(), 5400),
        (BuiltinPhase::Two.as_str().to_string(), 3600),
    ])
}

impl Default for NestedConfig {
    fn default() -> Self {
        Self {
            fallback_timeout_secs: default_fallback_timeout_secs(),
            unknown_type_timeout_secs: default_unknown_type_timeout_secs(),
            timeouts: default_timeouts(),
        }
    }
}

/// Partial breaker settings layered over the built-in default for a key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_window_secs: Option<u64>,
}

impl BreakerOverride {
    pub fn apply(&self, base: CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(base.failure_threshold),
            recovery_timeout_secs: self
                .recovery_timeout_secs
                .unwrap_or(base.recovery_timeout_secs),
            failure_window_secs: self.failure_window_secs.unwrap_or(base.failure_window_secs),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// Level to use, with `PHASEWRIGHT_LOG` taking precedence over the file.
    pub fn effective_level(&self) -> String {
        std::env::var(LOG_LEVEL_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.level.clone())
    }
}

/// Root of `phasewright.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub nested: NestedConfig,
    #[serde(default)]
    pub circuit_breakers: BTreeMap<String, BreakerOverride>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse phasewright.toml")
    }

    /// Load `<dir>/phasewright.toml`, or defaults when the file is absent.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize phasewright.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Effective breaker config for `key`: built-in default plus any override.
    pub fn breaker_config(&self, key: &str) -> CircuitBreakerConfig {
        let base = CircuitBreakerConfig::default_for(key);
        match self.circuit_breakers.get(key) {
            Some(over) => over.apply(base),
            None => base,
        }
    }

    /// Breaker configs for every built-in type, the transition breaker and
    /// any extra keys named in the file.
    pub fn breaker_configs(&self) -> BTreeMap<String, CircuitBreakerConfig> {
        let mut configs: BTreeMap<String, CircuitBreakerConfig> = BuiltinPhase::ALL
            .iter()
            .map(|kind| kind.as_str())
            .chain(std::iter::once(TRANSITION_BREAKER))
            .map(|key| (key.to_string(), self.breaker_config(key)))
            .collect();
        for key in self.circuit_breakers.keys() {
            configs
                .entry(key.clone())
                .or_insert_with(|| self.breaker_config(key));
        }
        configs
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let monitor = &self.monitor;

        if monitor.interval_secs == 0 {
            warnings.push("monitor.interval_secs is 0; the watchdog would spin".to_string());
        }
        if monitor.warning_percent >= monitor.critical_percent {
            warnings.push(format!(
                "monitor.warning_percent ({}) should be below critical_percent ({})",
                monitor.warning_percent, monitor.critical_percent
            ));
        }
        if monitor.critical_percent > 100 {
            warnings.push(format!(
                "monitor.critical_percent ({}) exceeds 100; critical alerts would never fire",
                monitor.critical_percent
            ));
        }

        for (key, secs) in &self.nested.timeouts {
            if *secs == 0 {
                warnings.push(format!("nested.timeouts.{} is 0", key));
            }
        }

        for (key, config) in self.breaker_configs() {
            if let Err(reason) = config.validate() {
                warnings.push(format!("circuit_breakers.{}: {}", key, reason));
            }
        }

        if !matches!(
            self.logging.level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            warnings.push(format!("Unknown logging.level '{}'", self.logging.level));
        }

        warnings
    }
}
