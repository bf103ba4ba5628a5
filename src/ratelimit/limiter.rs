//! Fixed-window rate limiter over a storage adapter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::key::{block_key, WindowKey};
use super::options::RateLimitOptions;
use crate::clock::SharedClock;
use crate::context::{millis_to_datetime, Outcome, ProtectionContext, ProtectionResult, ResultMetadata};
use crate::error::ProtectionError;
use crate::metrics::SharedMetrics;
use crate::storage::{SharedStorage, StorageError};

/// Explicit block on a key, independent of window counting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Read-only view of a key's current window.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStatus {
    pub consumed: u64,
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Fixed-window rate limiter.
///
/// Counts live in the storage adapter under
/// `namespace:key:windowStart`; every mutation goes through the adapter's
/// atomic increment/decrement. Storage failures fail open.
#[derive(Debug)]
pub struct RateLimiter {
    storage: SharedStorage,
    metrics: SharedMetrics,
    clock: SharedClock,
    options: RateLimitOptions,
}

impl RateLimiter {
    /// Create a rate limiter with the given default options.
    pub fn new(
        storage: SharedStorage,
        metrics: SharedMetrics,
        clock: SharedClock,
        options: RateLimitOptions,
    ) -> Self {
        Self {
            storage,
            metrics,
            clock,
            options,
        }
    }

    /// The default options used when `consume` is called without any.
    pub fn options(&self) -> &RateLimitOptions {
        &self.options
    }

    /// Count the request against its window.
    ///
    /// Returns the decision metadata when allowed, or
    /// [`ProtectionError::RateLimited`] once the window's points are spent or
    /// the key is blocked.
    pub async fn consume(
        &self,
        context: &ProtectionContext,
        options: Option<&RateLimitOptions>,
    ) -> Result<ProtectionResult, ProtectionError> {
        let opts = options.unwrap_or(&self.options);
        let key = opts.key_for(context);
        let labels = [("namespace", opts.namespace.as_str())];
        let now = self.clock.now_millis();

        match self.active_block(&opts.namespace, &key).await {
            Ok(Some((record, remaining))) => {
                debug!(key = %key, reason = %record.reason, "Request rejected, key is blocked");
                self.metrics.increment("rate_limit_exceeded", 1.0, &labels);
                let mut metadata = self.build_metadata(opts, 0, None);
                let retry_after = retry_after_from(remaining);
                metadata
                    .headers
                    .insert("Retry-After".into(), retry_after.as_secs().to_string());
                return Err(ProtectionError::RateLimited {
                    message: opts.message_for(context),
                    retry_after,
                    metadata,
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Block lookup failed, ignoring block state");
                self.metrics.increment("rate_limit_errors", 1.0, &labels);
            }
        }

        let window_ms = (opts.duration().as_millis() as u64).max(1);
        let window = WindowKey::for_instant(&opts.namespace, &key, now, window_ms);
        let storage_key = window.to_storage_key();

        let count = match self.storage.increment(&storage_key, 1).await {
            Ok(count) => count,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Rate limit storage failed, failing open");
                self.metrics.increment("rate_limit_errors", 1.0, &labels);
                return Ok(ProtectionResult::pass());
            }
        };

        // Only the request that created the window arms its TTL, so later
        // requests never extend an in-flight window.
        if count == 1 {
            if let Err(e) = self.storage.expire(&storage_key, opts.duration()).await {
                warn!(key = %storage_key, error = %e, "Failed to set window expiry");
                self.metrics.increment("rate_limit_errors", 1.0, &labels);
            }
        }

        let count = count.max(0) as u64;
        let reset_at_ms = window.window_start + window_ms;
        let remaining = opts.points.saturating_sub(count);
        let mut metadata = self.build_metadata(opts, remaining, Some(reset_at_ms));

        trace!(
            key = %storage_key,
            count,
            limit = opts.points,
            "Rate limit consumed"
        );

        if count <= opts.points {
            self.metrics.increment("rate_limit_consumed", 1.0, &labels);
            metadata.window_start = Some(window.window_start);
            return Ok(ProtectionResult::allowed(metadata));
        }

        self.metrics.increment("rate_limit_exceeded", 1.0, &labels);
        debug!(key = %key, count, limit = opts.points, "Rate limit exceeded");

        let mut retry_after = retry_after_from(Duration::from_millis(reset_at_ms.saturating_sub(now)));
        if let Some(block_for) = opts.block_duration() {
            if let Err(e) = self
                .write_block(&opts.namespace, &key, block_for, "rate limit exceeded")
                .await
            {
                warn!(key = %key, error = %e, "Failed to write block record");
                self.metrics.increment("rate_limit_errors", 1.0, &labels);
            } else {
                retry_after = retry_after.max(retry_after_from(block_for));
            }
        }

        metadata
            .headers
            .insert("Retry-After".into(), retry_after.as_secs().to_string());

        Err(ProtectionError::RateLimited {
            message: opts.message_for(context),
            retry_after,
            metadata,
        })
    }

    /// Block the request's key for `ttl`, regardless of its window count.
    pub async fn block(
        &self,
        context: &ProtectionContext,
        ttl: Duration,
        reason: impl Into<String>,
    ) -> Result<(), StorageError> {
        let key = self.options.key_for(context);
        let reason = reason.into();
        debug!(key = %key, reason = %reason, ttl = ?ttl, "Blocking key");
        self.write_block(&self.options.namespace, &key, ttl, &reason)
            .await
    }

    /// Remove a block. Returns `true` if one was present.
    pub async fn unblock(&self, context: &ProtectionContext) -> Result<bool, StorageError> {
        let key = self.options.key_for(context);
        self.storage
            .delete(&block_key(&self.options.namespace, &key))
            .await
    }

    /// Whether the request's key is currently blocked.
    ///
    /// Storage failures report "not blocked".
    pub async fn is_blocked(&self, context: &ProtectionContext) -> bool {
        self.block_record(context).await.is_some()
    }

    /// The active block record for the request's key, if any.
    pub async fn block_record(&self, context: &ProtectionContext) -> Option<BlockRecord> {
        let key = self.options.key_for(context);
        match self.active_block(&self.options.namespace, &key).await {
            Ok(found) => found.map(|(record, _)| record),
            Err(e) => {
                warn!(key = %key, error = %e, "Block lookup failed");
                None
            }
        }
    }

    /// Compensate the window counter after the protected operation finished.
    ///
    /// With `skip_successful_requests` a success gives its point back; with
    /// `skip_failed_requests` a failure does. The point goes back to the
    /// window recorded in `counted`, the result `consume` returned for this
    /// request. Results that were never counted (fail-open passes, bypassed
    /// requests) return nothing. Returns `true` if a point was returned.
    pub async fn record_outcome(
        &self,
        context: &ProtectionContext,
        counted: &ProtectionResult,
        outcome: Outcome,
        options: Option<&RateLimitOptions>,
    ) -> bool {
        let opts = options.unwrap_or(&self.options);
        let skip = match outcome {
            Outcome::Success => opts.skip_successful_requests,
            Outcome::Failure => opts.skip_failed_requests,
        };
        if !skip {
            return false;
        }
        let Some(window_start) = counted.metadata.window_start else {
            return false;
        };

        let window = WindowKey {
            namespace: opts.namespace.clone(),
            key: opts.key_for(context),
            window_start,
        };
        let storage_key = window.to_storage_key();

        match self.storage.exists(&storage_key).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Failed to compensate rate limit");
                return false;
            }
        }

        match self.storage.decrement(&storage_key, 1).await {
            Ok(count) => {
                trace!(key = %storage_key, count, ?outcome, "Rate limit point returned");
                true
            }
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Failed to compensate rate limit");
                false
            }
        }
    }

    /// Current window state for the request without consuming a point.
    pub async fn status(
        &self,
        context: &ProtectionContext,
        options: Option<&RateLimitOptions>,
    ) -> Result<RateLimitStatus, StorageError> {
        let opts = options.unwrap_or(&self.options);
        let key = opts.key_for(context);
        let window_ms = (opts.duration().as_millis() as u64).max(1);
        let window = WindowKey::for_instant(&opts.namespace, &key, self.clock.now_millis(), window_ms);

        let consumed = self
            .storage
            .get(&window.to_storage_key())
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            .max(0) as u64;

        Ok(RateLimitStatus {
            consumed,
            remaining: opts.points.saturating_sub(consumed),
            limit: opts.points,
            reset_at: millis_to_datetime(window.window_start + window_ms),
        })
    }

    /// Delete the request's current window record.
    pub async fn reset(
        &self,
        context: &ProtectionContext,
        options: Option<&RateLimitOptions>,
    ) -> Result<bool, StorageError> {
        let opts = options.unwrap_or(&self.options);
        let key = opts.key_for(context);
        let window_ms = (opts.duration().as_millis() as u64).max(1);
        let window = WindowKey::for_instant(&opts.namespace, &key, self.clock.now_millis(), window_ms);
        debug!(key = %window, "Resetting rate limit window");
        self.storage.delete(&window.to_storage_key()).await
    }

    async fn write_block(
        &self,
        namespace: &str,
        key: &str,
        ttl: Duration,
        reason: &str,
    ) -> Result<(), StorageError> {
        let record = BlockRecord {
            reason: reason.to_string(),
            timestamp: millis_to_datetime(self.clock.now_millis()).unwrap_or_else(Utc::now),
        };
        self.storage
            .set(&block_key(namespace, key), serde_json::to_value(&record)?, Some(ttl))
            .await
    }

    async fn active_block(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<(BlockRecord, Duration)>, StorageError> {
        let storage_key = block_key(namespace, key);
        let Some(value) = self.storage.get(&storage_key).await? else {
            return Ok(None);
        };
        let record = parse_block(value)?;
        let remaining = self.storage.ttl(&storage_key).await?.unwrap_or(Duration::ZERO);
        Ok(Some((record, remaining)))
    }

    fn build_metadata(
        &self,
        opts: &RateLimitOptions,
        remaining: u64,
        reset_at_ms: Option<u64>,
    ) -> ResultMetadata {
        let mut metadata = ResultMetadata {
            remaining: Some(remaining),
            limit: Some(opts.points),
            reset_at: reset_at_ms.and_then(millis_to_datetime),
            ..Default::default()
        };
        metadata
            .headers
            .insert("X-RateLimit-Limit".into(), opts.points.to_string());
        metadata
            .headers
            .insert("X-RateLimit-Remaining".into(), remaining.to_string());
        if let Some(reset_at_ms) = reset_at_ms {
            metadata
                .headers
                .insert("X-RateLimit-Reset".into(), (reset_at_ms / 1000).to_string());
        }
        for (name, value) in &opts.custom_headers {
            metadata.headers.insert(name.clone(), value.clone());
        }
        metadata
    }
}

fn parse_block(value: Value) -> Result<BlockRecord, StorageError> {
    Ok(serde_json::from_value(value)?)
}

/// Whole seconds until retry, rounded up and never zero.
pub(crate) fn retry_after_from(remaining: Duration) -> Duration {
    let millis = remaining.as_millis() as u64;
    Duration::from_secs(millis.div_ceil(1000).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::InMemoryMetrics;
    use crate::storage::{FailingStorage, InMemoryStorage, StorageAdapter};
    use std::sync::Arc;

    struct Fixture {
        limiter: RateLimiter,
        storage: Arc<InMemoryStorage>,
        metrics: Arc<InMemoryMetrics>,
        clock: ManualClock,
    }

    fn fixture(options: RateLimitOptions) -> Fixture {
        // Aligned to a minute boundary so windows are predictable.
        let clock = ManualClock::new(1_700_000_040_000);
        let storage = Arc::new(InMemoryStorage::with_clock(Arc::new(clock.clone())));
        let metrics = Arc::new(InMemoryMetrics::new());
        let limiter = RateLimiter::new(
            storage.clone(),
            metrics.clone(),
            Arc::new(clock.clone()),
            options,
        );
        Fixture {
            limiter,
            storage,
            metrics,
            clock,
        }
    }

    fn ctx() -> ProtectionContext {
        ProtectionContext::new("GET", "/orders").with_source("10.1.1.1")
    }

    #[tokio::test]
    async fn test_consume_counts_down_then_rejects() {
        let f = fixture(RateLimitOptions::new(3, 60));

        for expected in [2, 1, 0] {
            let result = f.limiter.consume(&ctx(), None).await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.metadata.remaining, Some(expected));
            assert_eq!(result.metadata.limit, Some(3));
        }

        let err = f.limiter.consume(&ctx(), None).await.unwrap_err();
        let retry_after = err.retry_after().unwrap();
        assert!(retry_after > Duration::ZERO);
        assert!(retry_after <= Duration::from_secs(60));
        assert!(err.metadata().unwrap().headers.contains_key("Retry-After"));
        assert_eq!(f.metrics.counter("rate_limit_consumed"), 3.0);
        assert_eq!(f.metrics.counter("rate_limit_exceeded"), 1.0);
    }

    #[tokio::test]
    async fn test_window_rollover_resets_counter() {
        let f = fixture(RateLimitOptions::new(3, 60));
        for _ in 0..4 {
            let _ = f.limiter.consume(&ctx(), None).await;
        }

        f.clock.advance(Duration::from_secs(60));
        let result = f.limiter.consume(&ctx(), None).await.unwrap();
        assert_eq!(result.metadata.remaining, Some(2));
    }

    #[tokio::test]
    async fn test_reset_at_is_window_end() {
        let f = fixture(RateLimitOptions::new(3, 60));
        f.clock.advance(Duration::from_secs(15));
        let result = f.limiter.consume(&ctx(), None).await.unwrap();
        assert_eq!(
            result.metadata.reset_at,
            millis_to_datetime(1_700_000_100_000)
        );
        assert_eq!(result.metadata.headers["X-RateLimit-Reset"], "1700000100");

        f.limiter.consume(&ctx(), None).await.unwrap();
        f.limiter.consume(&ctx(), None).await.unwrap();
        let err = f.limiter.consume(&ctx(), None).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(45)));
    }

    #[tokio::test]
    async fn test_expiry_is_set_only_on_window_creation() {
        let f = fixture(RateLimitOptions::new(10, 60));
        f.limiter.consume(&ctx(), None).await.unwrap();

        f.clock.advance(Duration::from_secs(20));
        f.limiter.consume(&ctx(), None).await.unwrap();

        let keys = f.storage.scan("rate_limit:*").await.unwrap();
        assert_eq!(keys.len(), 1);
        let ttl = f.storage.ttl(&keys[0]).await.unwrap().unwrap();
        assert_eq!(ttl, Duration::from_secs(40));
    }

    #[tokio::test]
    async fn test_distinct_keys_count_separately() {
        let f = fixture(RateLimitOptions::new(1, 60));
        let other = ProtectionContext::new("GET", "/orders").with_source("10.9.9.9");

        assert!(f.limiter.consume(&ctx(), None).await.is_ok());
        assert!(f.limiter.consume(&other, None).await.is_ok());
        assert!(f.limiter.consume(&ctx(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_custom_message_and_headers() {
        let options = RateLimitOptions::new(1, 60)
            .with_header("X-Plan", "free")
            .with_response_message(|ctx| format!("slow down on {}", ctx.path()));
        let f = fixture(options);

        let ok = f.limiter.consume(&ctx(), None).await.unwrap();
        assert_eq!(ok.metadata.headers["X-Plan"], "free");

        let err = f.limiter.consume(&ctx(), None).await.unwrap_err();
        assert_eq!(err.to_string(), "Rate limit exceeded: slow down on /orders");
    }

    #[tokio::test]
    async fn test_per_call_options_override_defaults() {
        let f = fixture(RateLimitOptions::new(100, 60));
        let strict = RateLimitOptions::new(1, 60).with_namespace("strict");

        assert!(f.limiter.consume(&ctx(), Some(&strict)).await.is_ok());
        assert!(f.limiter.consume(&ctx(), Some(&strict)).await.is_err());
        assert!(f.limiter.consume(&ctx(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_block_overrides_count() {
        let f = fixture(RateLimitOptions::new(100, 60));
        f.limiter
            .block(&ctx(), Duration::from_secs(30), "abuse")
            .await
            .unwrap();

        assert!(f.limiter.is_blocked(&ctx()).await);
        assert_eq!(f.limiter.block_record(&ctx()).await.unwrap().reason, "abuse");

        let err = f.limiter.consume(&ctx(), None).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));

        f.clock.advance(Duration::from_secs(31));
        assert!(!f.limiter.is_blocked(&ctx()).await);
        assert!(f.limiter.consume(&ctx(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_unblock() {
        let f = fixture(RateLimitOptions::new(100, 60));
        f.limiter
            .block(&ctx(), Duration::from_secs(30), "manual")
            .await
            .unwrap();
        assert!(f.limiter.unblock(&ctx()).await.unwrap());
        assert!(f.limiter.consume(&ctx(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_block_duration_applies_after_exceeding() {
        let f = fixture(RateLimitOptions::new(1, 60).with_block_duration(300));
        f.limiter.consume(&ctx(), None).await.unwrap();

        let err = f.limiter.consume(&ctx(), None).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(300)));

        // Still blocked in the next window.
        f.clock.advance(Duration::from_secs(61));
        assert!(f.limiter.consume(&ctx(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_storage_failure_fails_open() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let limiter = RateLimiter::new(
            Arc::new(FailingStorage),
            metrics.clone(),
            Arc::new(ManualClock::default()),
            RateLimitOptions::new(1, 60),
        );

        for _ in 0..5 {
            let result = limiter.consume(&ctx(), None).await.unwrap();
            assert!(result.allowed);
        }
        assert!(metrics.counter("rate_limit_errors") >= 5.0);
        assert!(!limiter.is_blocked(&ctx()).await);
    }

    #[tokio::test]
    async fn test_skip_successful_requests_returns_point() {
        let f = fixture(RateLimitOptions::new(2, 60).skip_successful(true));

        let counted = f.limiter.consume(&ctx(), None).await.unwrap();
        assert!(f.limiter.record_outcome(&ctx(), &counted, Outcome::Success, None).await);
        assert!(!f.limiter.record_outcome(&ctx(), &counted, Outcome::Failure, None).await);

        let status = f.limiter.status(&ctx(), None).await.unwrap();
        assert_eq!(status.consumed, 0);
        assert_eq!(status.remaining, 2);
    }

    #[tokio::test]
    async fn test_skip_failed_requests_returns_point() {
        let f = fixture(RateLimitOptions::new(1, 60).skip_failed(true));

        let counted = f.limiter.consume(&ctx(), None).await.unwrap();
        assert!(f.limiter.record_outcome(&ctx(), &counted, Outcome::Failure, None).await);
        assert!(f.limiter.consume(&ctx(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_outcome_returns_point_to_counted_window() {
        let f = fixture(RateLimitOptions::new(1, 60).skip_successful(true));
        f.clock.advance(Duration::from_secs(59));
        let counted = f.limiter.consume(&ctx(), None).await.unwrap();

        f.clock.advance(Duration::from_secs(2));
        f.limiter.consume(&ctx(), None).await.unwrap();

        assert!(f.limiter.record_outcome(&ctx(), &counted, Outcome::Success, None).await);
        assert!(f.limiter.consume(&ctx(), None).await.is_err());
        assert_eq!(f.limiter.status(&ctx(), None).await.unwrap().consumed, 2);
    }

    #[tokio::test]
    async fn test_uncounted_pass_returns_nothing() {
        let f = fixture(RateLimitOptions::new(2, 60).skip_successful(true));
        f.limiter.consume(&ctx(), None).await.unwrap();

        let pass = ProtectionResult::pass();
        assert!(!f.limiter.record_outcome(&ctx(), &pass, Outcome::Success, None).await);
        assert_eq!(f.limiter.status(&ctx(), None).await.unwrap().consumed, 1);
    }

    #[tokio::test]
    async fn test_status_and_reset() {
        let f = fixture(RateLimitOptions::new(5, 60));
        f.limiter.consume(&ctx(), None).await.unwrap();
        f.limiter.consume(&ctx(), None).await.unwrap();

        let status = f.limiter.status(&ctx(), None).await.unwrap();
        assert_eq!(status.consumed, 2);
        assert_eq!(status.remaining, 3);

        assert!(f.limiter.reset(&ctx(), None).await.unwrap());
        let status = f.limiter.status(&ctx(), None).await.unwrap();
        assert_eq!(status.consumed, 0);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_from(Duration::from_millis(1)), Duration::from_secs(1));
        assert_eq!(retry_after_from(Duration::from_millis(1500)), Duration::from_secs(2));
        assert_eq!(retry_after_from(Duration::ZERO), Duration::from_secs(1));
    }
}
