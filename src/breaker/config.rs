//! Circuit breaker configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

/// Asynchronous probe reporting whether a downstream dependency is healthy.
#[derive(Clone)]
pub struct HealthCheck(Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>);

impl HealthCheck {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        Self(Arc::new(move || f().boxed()))
    }

    pub async fn check(&self) -> bool {
        (self.0)().await
    }
}

impl fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HealthCheck(..)")
    }
}

/// Configuration for a single breaker.
///
/// Applied when the breaker for a key is first created; later calls for the
/// same key reuse the existing breaker and its configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// A disabled breaker passes every call through and never trips
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Upper bound on a single call; exceeding it counts as a failure
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: Option<u64>,

    /// Error rate (percent) above which the breaker opens
    #[serde(default = "default_error_threshold_percentage")]
    pub error_threshold_percentage: f64,

    /// How long the breaker stays open before allowing a trial call
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Length of the rolling statistics window
    #[serde(default = "default_rolling_count_timeout_ms")]
    pub rolling_count_timeout_ms: u64,

    /// Number of buckets the rolling window is divided into
    #[serde(default = "default_rolling_count_buckets")]
    pub rolling_count_buckets: u32,

    /// Minimum calls in the window before the error rate is considered
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: u64,

    /// Never trip during the first rolling window of a new breaker
    #[serde(default)]
    pub allow_warm_up: bool,

    /// How often to run the health check, if one is attached
    #[serde(default)]
    pub health_check_interval_ms: Option<u64>,

    #[serde(skip)]
    pub health_check: Option<HealthCheck>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            timeout_ms: default_timeout_ms(),
            error_threshold_percentage: default_error_threshold_percentage(),
            reset_timeout_ms: default_reset_timeout_ms(),
            rolling_count_timeout_ms: default_rolling_count_timeout_ms(),
            rolling_count_buckets: default_rolling_count_buckets(),
            volume_threshold: default_volume_threshold(),
            allow_warm_up: false,
            health_check_interval_ms: None,
            health_check: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_ms() -> Option<u64> {
    Some(3_000)
}

fn default_error_threshold_percentage() -> f64 {
    50.0
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_rolling_count_timeout_ms() -> u64 {
    10_000
}

fn default_rolling_count_buckets() -> u32 {
    10
}

fn default_volume_threshold() -> u64 {
    5
}

impl BreakerConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn rolling_window(&self) -> Duration {
        Duration::from_millis(self.rolling_count_timeout_ms)
    }

    /// Width of one rolling-window bucket.
    pub fn bucket_width(&self) -> Duration {
        let buckets = self.rolling_count_buckets.max(1) as u64;
        Duration::from_millis((self.rolling_count_timeout_ms / buckets).max(1))
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check_interval_ms.map(Duration::from_millis)
    }

    /// Attach a health check run every `interval`; an unhealthy report
    /// opens the breaker.
    pub fn with_health_check<F, Fut>(mut self, interval: Duration, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        self.health_check_interval_ms = Some(interval.as_millis() as u64);
        self.health_check = Some(HealthCheck::new(f));
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.error_threshold_percentage > 0.0 && self.error_threshold_percentage <= 100.0) {
            return Err("circuit_breaker.error_threshold_percentage must be in (0, 100]".into());
        }
        if self.rolling_count_buckets == 0 {
            return Err("circuit_breaker.rolling_count_buckets must be greater than zero".into());
        }
        if self.rolling_count_timeout_ms % self.rolling_count_buckets as u64 != 0 {
            return Err(
                "circuit_breaker.rolling_count_timeout_ms must divide evenly into rolling_count_buckets"
                    .into(),
            );
        }
        if self.timeout_ms == Some(0) {
            return Err("circuit_breaker.timeout_ms must be greater than zero when set".into());
        }
        if self.health_check_interval_ms == Some(0) {
            return Err("circuit_breaker.health_check_interval_ms must be greater than zero".into());
        }
        Ok(())
    }
}

/// Configuration for the breaker registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerManagerConfig {
    /// Configuration for breakers created without an explicit one
    #[serde(default)]
    pub defaults: BreakerConfig,

    /// How often the idle sweep runs
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Breakers idle for longer than this are evicted by the sweep
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// Hard cap on live breakers
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
}

impl Default for BreakerManagerConfig {
    fn default() -> Self {
        Self {
            defaults: BreakerConfig::default(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_age_secs: default_max_age_secs(),
            max_instances: default_max_instances(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_max_age_secs() -> u64 {
    3_600
}

fn default_max_instances() -> usize {
    1_000
}

impl BreakerManagerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_instances == 0 {
            return Err("circuit_breaker.max_instances must be greater than zero".into());
        }
        self.defaults.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BreakerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.timeout(), Some(Duration::from_secs(3)));
        assert_eq!(config.bucket_width(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_manager_yaml() {
        let yaml = r#"
max_instances: 50
defaults:
  error_threshold_percentage: 25
  volume_threshold: 20
  timeout_ms: null
"#;
        let config: BreakerManagerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_instances, 50);
        assert_eq!(config.sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.defaults.error_threshold_percentage, 25.0);
        assert_eq!(config.defaults.timeout(), None);
        assert_eq!(config.defaults.reset_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_validate() {
        let bad_percentage = BreakerConfig {
            error_threshold_percentage: 120.0,
            ..Default::default()
        };
        assert!(bad_percentage.validate().is_err());

        let uneven_buckets = BreakerConfig {
            rolling_count_timeout_ms: 10_000,
            rolling_count_buckets: 3,
            ..Default::default()
        };
        assert!(uneven_buckets.validate().is_err());

        let no_cap = BreakerManagerConfig {
            max_instances: 0,
            ..Default::default()
        };
        assert!(no_cap.validate().is_err());
    }
}
