//! Admission controller configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use super::queue::QueuedRequest;
use crate::callback::PriorityFunction;
use crate::context::ProtectionContext;

/// Priority given to requests that carry none.
pub const DEFAULT_PRIORITY: i64 = 5;

/// Order in which queued requests are served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShedStrategy {
    /// Arrival order
    #[default]
    Fifo,
    /// Most recent first
    Lifo,
    /// Highest priority first, arrival order among equals
    Priority,
    /// Uniformly shuffled on every insert
    Random,
    /// Caller-supplied reorder or filter
    Custom,
}

/// Caller-supplied queue transform for [`ShedStrategy::Custom`].
///
/// Requests left out of the returned queue are shed.
#[derive(Clone)]
pub struct ShedFunction(Arc<dyn Fn(Vec<QueuedRequest>) -> Vec<QueuedRequest> + Send + Sync>);

impl ShedFunction {
    pub fn new(f: impl Fn(Vec<QueuedRequest>) -> Vec<QueuedRequest> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub(crate) fn apply(&self, queue: Vec<QueuedRequest>) -> Vec<QueuedRequest> {
        (self.0)(queue)
    }
}

impl fmt::Debug for ShedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShedFunction(..)")
    }
}

/// Asynchronous source of the health score.
#[derive(Clone)]
pub struct HealthIndicator(Arc<dyn Fn() -> BoxFuture<'static, Result<f64, String>> + Send + Sync>);

impl HealthIndicator {
    pub fn new<F, Fut, E>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<f64, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        Self(Arc::new(move || {
            let fut = f();
            async move { fut.await.map_err(|e| e.to_string()) }.boxed()
        }))
    }

    pub(crate) async fn score(&self) -> Result<f64, String> {
        (self.0)().await
    }
}

impl fmt::Debug for HealthIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HealthIndicator(..)")
    }
}

/// Adaptive concurrency threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_min_threshold")]
    pub min_threshold: usize,

    #[serde(default = "default_max_threshold")]
    pub max_threshold: usize,

    /// How often the periodic adjuster runs
    #[serde(default = "default_adjustment_interval_ms")]
    pub adjustment_interval_ms: u64,

    /// Average queue wait above which the threshold shrinks
    #[serde(default)]
    pub target_latency_ms: Option<u64>,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_threshold: default_min_threshold(),
            max_threshold: default_max_threshold(),
            adjustment_interval_ms: default_adjustment_interval_ms(),
            target_latency_ms: None,
        }
    }
}

fn default_min_threshold() -> usize {
    10
}

fn default_max_threshold() -> usize {
    1_000
}

fn default_adjustment_interval_ms() -> u64 {
    10_000
}

impl AdaptiveConfig {
    pub fn adjustment_interval(&self) -> Duration {
        Duration::from_millis(self.adjustment_interval_ms.max(1))
    }

    pub fn target_latency(&self) -> Option<Duration> {
        self.target_latency_ms.map(Duration::from_millis)
    }
}

/// Configuration for overload protection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverloadConfig {
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Base time a request may wait in the queue
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    #[serde(default)]
    pub shed_strategy: ShedStrategy,

    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    /// Minimum age of the health score before it is recomputed
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    #[serde(skip)]
    pub priority_function: Option<PriorityFunction>,

    #[serde(skip)]
    pub custom_shed_function: Option<ShedFunction>,

    #[serde(skip)]
    pub health_indicator: Option<HealthIndicator>,
}

impl Default for OverloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            max_queue_size: default_max_queue_size(),
            queue_timeout_ms: default_queue_timeout_ms(),
            shed_strategy: ShedStrategy::default(),
            adaptive: AdaptiveConfig::default(),
            health_check_interval_ms: default_health_check_interval_ms(),
            priority_function: None,
            custom_shed_function: None,
            health_indicator: None,
        }
    }
}

fn default_max_concurrent_requests() -> usize {
    100
}

fn default_max_queue_size() -> usize {
    1_000
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}

fn default_health_check_interval_ms() -> u64 {
    5_000
}

impl OverloadConfig {
    pub fn new(max_concurrent_requests: usize, max_queue_size: usize) -> Self {
        Self {
            max_concurrent_requests,
            max_queue_size,
            ..Default::default()
        }
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_strategy(mut self, strategy: ShedStrategy) -> Self {
        self.shed_strategy = strategy;
        self
    }

    pub fn with_adaptive(mut self, adaptive: AdaptiveConfig) -> Self {
        self.adaptive = adaptive;
        self
    }

    pub fn with_priority_function(
        mut self,
        f: impl Fn(&ProtectionContext) -> i64 + Send + Sync + 'static,
    ) -> Self {
        self.priority_function = Some(PriorityFunction::new(f));
        self
    }

    /// Use a custom queue transform; also selects [`ShedStrategy::Custom`].
    pub fn with_shed_function(
        mut self,
        f: impl Fn(Vec<QueuedRequest>) -> Vec<QueuedRequest> + Send + Sync + 'static,
    ) -> Self {
        self.shed_strategy = ShedStrategy::Custom;
        self.custom_shed_function = Some(ShedFunction::new(f));
        self
    }

    pub fn with_health_indicator<F, Fut, E>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<f64, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.health_indicator = Some(HealthIndicator::new(f));
        self
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Queue priority of a request: the priority function, then the
    /// request's own priority, then [`DEFAULT_PRIORITY`].
    pub fn priority_for(&self, context: &ProtectionContext) -> i64 {
        match &self.priority_function {
            Some(f) => f.call(context),
            None => context.priority().unwrap_or(DEFAULT_PRIORITY),
        }
    }

    /// Adaptive threshold the controller starts from.
    pub(crate) fn initial_threshold(&self) -> usize {
        self.max_concurrent_requests
            .clamp(self.adaptive.min_threshold, self.adaptive.max_threshold.max(self.adaptive.min_threshold))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_requests == 0 {
            return Err("overload.max_concurrent_requests must be greater than zero".into());
        }
        if self.queue_timeout_ms == 0 {
            return Err("overload.queue_timeout_ms must be greater than zero".into());
        }
        if self.adaptive.min_threshold == 0 {
            return Err("overload.adaptive.min_threshold must be greater than zero".into());
        }
        if self.adaptive.min_threshold > self.adaptive.max_threshold {
            return Err("overload.adaptive.min_threshold must not exceed max_threshold".into());
        }
        if self.shed_strategy == ShedStrategy::Custom && self.custom_shed_function.is_none() {
            return Err("overload.shed_strategy CUSTOM requires a shed function".into());
        }
        Ok(())
    }
}
