//! Configuration management for Warden.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerManagerConfig;
use crate::error::{Result, WardenError};
use crate::overload::OverloadConfig;
use crate::ratelimit::RateLimitOptions;
use crate::throttle::ThrottleOptions;

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "WARDEN";
/// Nesting separator in environment variable names.
pub const ENV_SEPARATOR: &str = "__";

/// Window guards that `check` runs, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardKind {
    RateLimit,
    Throttle,
}

/// Main configuration for a protection engine.
///
/// A component whose section is absent is disabled, except the circuit
/// breaker registry, which is always available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub rate_limit: Option<RateLimitOptions>,

    #[serde(default)]
    pub throttle: Option<ThrottleOptions>,

    #[serde(default)]
    pub circuit_breaker: BreakerManagerConfig,

    #[serde(default)]
    pub overload: Option<OverloadConfig>,

    /// Order in which window guards are consulted
    #[serde(default = "default_order")]
    pub order: Vec<GuardKind>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_limit: None,
            throttle: None,
            circuit_breaker: BreakerManagerConfig::default(),
            overload: None,
            order: default_order(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_order() -> Vec<GuardKind> {
    vec![GuardKind::RateLimit, GuardKind::Throttle]
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Parse configuration from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(contents).map_err(|e| WardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, overridden by `WARDEN__*`
    /// environment variables (`WARDEN__RATE_LIMIT__POINTS=50`).
    ///
    /// Keys are case-insensitive in this path, so map keys such as custom
    /// header names arrive lower-cased.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(WardenError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| WardenError::Config(e.to_string()))?;

        let config: EngineConfig = settings
            .try_deserialize()
            .map_err(|e| WardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| WardenError::Config(e.to_string()))
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate().map_err(WardenError::Config)?;
        }
        if let Some(throttle) = &self.throttle {
            throttle.validate().map_err(WardenError::Config)?;
        }
        if let Some(overload) = &self.overload {
            overload.validate().map_err(WardenError::Config)?;
        }
        self.circuit_breaker
            .validate()
            .map_err(WardenError::Config)?;

        let mut seen = Vec::with_capacity(self.order.len());
        for kind in &self.order {
            if seen.contains(kind) {
                return Err(WardenError::Config(format!(
                    "order lists {kind:?} more than once"
                )));
            }
            seen.push(*kind);
        }
        Ok(())
    }
}
