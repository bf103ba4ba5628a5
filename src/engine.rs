//! The protection engine: composes the guards around an operation.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info};

use crate::breaker::CircuitBreakerManager;
use crate::clock::{SharedClock, SystemClock};
use crate::config::{EngineConfig, GuardKind};
use crate::context::{Outcome, ProtectionContext, ProtectionResult};
use crate::error::{CallError, ProtectionError, Result};
use crate::metrics::{NoopMetrics, SharedMetrics};
use crate::overload::AdmissionController;
use crate::ratelimit::RateLimiter;
use crate::storage::{InMemoryStorage, SharedStorage};
use crate::throttle::Throttle;

/// Rate limiter, throttle, admission controller and breaker registry
/// sharing one storage adapter and metrics sink.
#[derive(Debug)]
pub struct ProtectionEngine {
    rate_limiter: Option<RateLimiter>,
    throttle: Option<Throttle>,
    admission: Option<Arc<AdmissionController>>,
    breakers: Arc<CircuitBreakerManager>,
    order: Vec<GuardKind>,
}

impl ProtectionEngine {
    pub fn builder() -> ProtectionEngineBuilder {
        ProtectionEngineBuilder::default()
    }

    /// Run the window guards in order, stopping at the first rejection.
    ///
    /// Metadata from every guard that allowed the request is merged; the
    /// earlier guard wins where both set a field.
    pub async fn check(
        &self,
        context: &ProtectionContext,
    ) -> std::result::Result<ProtectionResult, ProtectionError> {
        let mut result = ProtectionResult::pass();
        for kind in &self.order {
            let decision = match kind {
                GuardKind::RateLimit => match &self.rate_limiter {
                    Some(limiter) => limiter.consume(context, None).await?,
                    None => continue,
                },
                GuardKind::Throttle => match &self.throttle {
                    Some(throttle) => throttle.consume(context, None).await?,
                    None => continue,
                },
            };
            result.metadata.merge(decision.metadata);
        }
        Ok(result)
    }

    /// Check the request, hold an admission slot while `operation` runs,
    /// then apply the rate limiter's outcome compensation to the window the
    /// request was counted in.
    pub async fn protect<T, E, F, Fut>(
        &self,
        context: &ProtectionContext,
        operation: F,
    ) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let decision = self.check(context).await?;

        let permit = match &self.admission {
            Some(admission) => Some(admission.guard(context).await?),
            None => None,
        };

        let result = operation().await;
        drop(permit);

        if let Some(limiter) = &self.rate_limiter {
            let outcome = match &result {
                Ok(_) => Outcome::Success,
                Err(_) => Outcome::Failure,
            };
            limiter.record_outcome(context, &decision, outcome, None).await;
        }

        result.map_err(CallError::Handler)
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub fn throttle(&self) -> Option<&Throttle> {
        self.throttle.as_ref()
    }

    pub fn admission(&self) -> Option<&Arc<AdmissionController>> {
        self.admission.as_ref()
    }

    /// The breaker registry, for wrapping downstream calls.
    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    /// Stop background tasks and turn away queued requests.
    pub fn shutdown(&self) {
        if let Some(admission) = &self.admission {
            admission.shutdown();
        }
        self.breakers.shutdown();
        info!("Protection engine shut down");
    }
}

/// Builder for [`ProtectionEngine`].
///
/// Storage defaults to an [`InMemoryStorage`], metrics to [`NoopMetrics`]
/// and the clock to [`SystemClock`].
#[derive(Debug, Default)]
pub struct ProtectionEngineBuilder {
    config: EngineConfig,
    storage: Option<SharedStorage>,
    metrics: Option<SharedMetrics>,
    clock: Option<SharedClock>,
}

impl ProtectionEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(mut self, storage: SharedStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and start the engine's background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<ProtectionEngine> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryStorage::with_clock(clock.clone())));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let config = self.config;

        let rate_limiter = config.rate_limit.map(|options| {
            RateLimiter::new(storage.clone(), metrics.clone(), clock.clone(), options)
        });
        let throttle = config
            .throttle
            .map(|options| Throttle::new(storage.clone(), metrics.clone(), clock.clone(), options));
        let admission = config.overload.map(|overload| {
            let controller = AdmissionController::new(overload, metrics.clone());
            controller.start();
            controller
        });
        let breakers = CircuitBreakerManager::start(config.circuit_breaker, metrics);

        debug!(
            rate_limit = rate_limiter.is_some(),
            throttle = throttle.is_some(),
            overload = admission.is_some(),
            order = ?config.order,
            "Protection engine built"
        );

        Ok(ProtectionEngine {
            rate_limiter,
            throttle,
            admission,
            breakers,
            order: config.order,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::InMemoryMetrics;
    use crate::overload::OverloadConfig;
    use crate::ratelimit::RateLimitOptions;
    use crate::throttle::ThrottleOptions;
    use std::time::Duration;

    fn ctx() -> ProtectionContext {
        ProtectionContext::new("GET", "/items").with_source("10.0.0.9")
    }

    fn engine(config: EngineConfig) -> ProtectionEngine {
        ProtectionEngine::builder()
            .config(config)
            .clock(Arc::new(ManualClock::new(1_700_000_040_000)))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_check_without_guards_passes() {
        let engine = engine(EngineConfig::default());
        let result = engine.check(&ctx()).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.metadata.remaining, None);
    }

    #[tokio::test]
    async fn test_check_merges_metadata_in_order() {
        let engine = engine(EngineConfig {
            rate_limit: Some(RateLimitOptions::new(3, 60)),
            throttle: Some(ThrottleOptions::new(10, 60)),
            ..Default::default()
        });
        let result = engine.check(&ctx()).await.unwrap();
        assert_eq!(result.metadata.remaining, Some(2));
        assert_eq!(result.metadata.limit, Some(3));
        assert!(result.metadata.headers.contains_key("X-RateLimit-Limit"));
        assert!(result.metadata.headers.contains_key("X-Throttle-Limit"));
    }

    #[tokio::test]
    async fn test_check_stops_at_first_rejection() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let engine = ProtectionEngine::builder()
            .config(EngineConfig {
                rate_limit: Some(RateLimitOptions::new(1, 60)),
                throttle: Some(ThrottleOptions::new(10, 60)),
                ..Default::default()
            })
            .metrics(metrics.clone())
            .clock(Arc::new(ManualClock::new(1_700_000_040_000)))
            .build()
            .unwrap();

        engine.check(&ctx()).await.unwrap();
        let err = engine.check(&ctx()).await.unwrap_err();
        assert!(matches!(err, ProtectionError::RateLimited { .. }));
        assert_eq!(metrics.counter("throttle_consumed"), 1.0);
    }

    #[tokio::test]
    async fn test_protect_returns_points_for_successes() {
        let engine = engine(EngineConfig {
            rate_limit: Some(RateLimitOptions::new(1, 60).skip_successful(true)),
            ..Default::default()
        });

        for _ in 0..3 {
            let value = engine
                .protect(&ctx(), || async { Ok::<_, String>(42) })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }

        let err = engine
            .protect(&ctx(), || async { Err::<u32, _>("broken".to_string()) })
            .await
            .unwrap_err();
        assert_eq!(err.into_handler(), Some("broken".to_string()));

        let err = engine
            .protect(&ctx(), || async { Ok::<_, String>(1) })
            .await
            .unwrap_err();
        assert!(matches!(
            err.protection(),
            Some(ProtectionError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_protect_returns_point_to_window_it_started_in() {
        let clock = ManualClock::new(1_700_000_040_000 + 59_000);
        let engine = ProtectionEngine::builder()
            .config(EngineConfig {
                rate_limit: Some(RateLimitOptions::new(1, 60).skip_successful(true)),
                ..Default::default()
            })
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();

        let (slow_clock, inner) = (&clock, &engine);
        engine
            .protect(&ctx(), move || async move {
                slow_clock.advance(Duration::from_secs(2));
                inner.check(&ctx()).await.map_err(|e| e.to_string())
            })
            .await
            .unwrap();

        let err = engine.check(&ctx()).await.unwrap_err();
        assert!(matches!(err, ProtectionError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_protect_holds_admission_slot() {
        let engine = engine(EngineConfig {
            overload: Some(OverloadConfig::new(1, 0)),
            ..Default::default()
        });
        let admission = engine.admission().unwrap().clone();

        let value = engine
            .protect(&ctx(), move || async move {
                assert_eq!(admission.status().current_requests, 1);
                Ok::<_, String>("done")
            })
            .await
            .unwrap();
        assert_eq!(value, "done");
        assert_eq!(engine.admission().unwrap().status().current_requests, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_build() {
        let result = ProtectionEngine::builder()
            .config(EngineConfig {
                throttle: Some(ThrottleOptions::new(0, 10)),
                ..Default::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_clears_queue() {
        let engine = engine(EngineConfig {
            overload: Some(OverloadConfig::new(1, 5)),
            ..Default::default()
        });
        let admission = engine.admission().unwrap().clone();
        let _held = admission.guard(&ctx()).await.unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire(&ctx(), None).await })
        };
        tokio::task::yield_now().await;
        engine.shutdown();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ProtectionError::Overloaded {
                reason: crate::error::OverloadReason::Cleared,
                ..
            }
        ));
    }
}
