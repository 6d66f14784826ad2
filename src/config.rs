//! Configuration system using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/hive.toml` by default)
//! 2. environment variables prefixed with `HIVE_`, nested keys separated by `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! HIVE_APPLICATION__LOG_LEVEL=debug
//! HIVE_HARDWARE__SIMULATE=true
//! HIVE_RUNNER__HISTORY_CAPACITY=10
//! ```
//!
//! # Example
//!
//! ```no_run
//! use hive_runner::config::HiveConfig;
//!
//! let config = HiveConfig::load_from("config/hive.toml")?;
//! println!("Simulated hardware: {}", config.hardware.simulate);
//! # Ok::<(), hive_runner::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A provider failed to read or parse.
    #[error("Configuration load error: {0}")]
    Load(#[from] figment::Error),
    /// Values parsed but are unusable.
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HiveConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Job runner settings
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Daemon routes and request protocol settings
    pub hardware: HardwareConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Root directory for histograms and job records
    pub data_dir: PathBuf,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// What the runner does with the rest of a job once a recipe failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeFailurePolicy {
    /// Skip the remaining recipes and record the job as failed.
    #[default]
    AbortJob,
    /// Run the remaining recipes; the first error decides the outcome.
    Continue,
}

/// Job runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Supervising loop cadence
    #[serde(default = "default_tick", with = "humantime_serde")]
    pub tick: Duration,
    /// Number of entries kept in the done and failed histories
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Behaviour after a recipe failure
    #[serde(default)]
    pub on_recipe_failure: RecipeFailurePolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick: default_tick(),
            history_capacity: default_history_capacity(),
            on_recipe_failure: RecipeFailurePolicy::default(),
        }
    }
}

/// Hardware daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Short-circuit every daemon request (no instruments needed)
    #[serde(default)]
    pub simulate: bool,
    /// Delay applied to each simulated request
    #[serde(default = "default_simulate_delay", with = "humantime_serde")]
    pub simulate_delay: Duration,
    /// Status poll interval for request completion
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Status poll interval for passive "Done" waits
    #[serde(default = "default_counting_poll_interval", with = "humantime_serde")]
    pub counting_poll_interval: Duration,
    /// Upper bound for any single wait; absent means wait forever
    #[serde(default, with = "humantime_serde")]
    pub request_timeout: Option<Duration>,
    /// Sample height axis
    pub z: AxisRoute,
    /// Sample tilt axis
    pub theta: AxisRoute,
    /// Acquisition daemon
    pub acquisition: AcquisitionRoute,
}

/// Which motor of a two-motor controller drives an axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorSlot {
    /// `m1` fields.
    First,
    /// `m2` fields.
    Second,
}

/// Route to a motion axis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisRoute {
    /// Daemon URL
    pub url: String,
    /// Motor slot on the controller
    pub motor: MotorSlot,
}

/// Route to the acquisition daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionRoute {
    /// Daemon URL
    pub url: String,
    /// Digitizer board of the histogram channel
    #[serde(default)]
    pub board: String,
    /// Histogram channel
    #[serde(default)]
    pub channel: u32,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "hive".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick() -> Duration {
    Duration::from_secs(1)
}

fn default_history_capacity() -> usize {
    5
}

fn default_simulate_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_counting_poll_interval() -> Duration {
    Duration::from_secs(1)
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl HiveConfig {
    /// Load configuration from a TOML file, then apply `HIVE_` environment overrides
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("HIVE_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without consulting the environment
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Toml::string(text)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Tick, history capacity and poll intervals are non-zero
    /// - Every daemon URL is set
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.runner.tick.is_zero() {
            return Err(ConfigError::Validation(
                "runner.tick must be greater than zero".to_string(),
            ));
        }

        if self.runner.history_capacity == 0 {
            return Err(ConfigError::Validation(
                "runner.history_capacity must be at least 1".to_string(),
            ));
        }

        if self.hardware.poll_interval.is_zero() || self.hardware.counting_poll_interval.is_zero()
        {
            return Err(ConfigError::Validation(
                "hardware poll intervals must be greater than zero".to_string(),
            ));
        }

        if matches!(self.hardware.request_timeout, Some(t) if t.is_zero()) {
            return Err(ConfigError::Validation(
                "hardware.request_timeout must be greater than zero when set".to_string(),
            ));
        }

        let routes = [
            ("hardware.z", self.hardware.z.url.as_str()),
            ("hardware.theta", self.hardware.theta.url.as_str()),
            ("hardware.acquisition", self.hardware.acquisition.url.as_str()),
        ];
        for (name, url) in routes {
            if url.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "{}: 'url' cannot be empty",
                    name
                )));
            }
        }

        Ok(())
    }
}
