//! Sliding first-request throttle over a storage adapter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::options::{ThrottleOptions, UserAgentMatcher};
use crate::clock::SharedClock;
use crate::context::{millis_to_datetime, ProtectionContext, ProtectionResult, ResultMetadata};
use crate::error::ProtectionError;
use crate::metrics::SharedMetrics;
use crate::ratelimit::retry_after_from;
use crate::storage::{SharedStorage, StorageError};

/// Current throttle state for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleRecord {
    pub count: u64,
    pub first_request_time: DateTime<Utc>,
}

/// Storage keys backing one throttle record.
struct RecordKeys {
    count: String,
    first: String,
}

impl RecordKeys {
    fn new(namespace: &str, key: &str) -> Self {
        Self {
            count: format!("{}:{}", namespace, key),
            first: format!("{}:{}:first", namespace, key),
        }
    }
}

/// Throttle whose window starts at a key's first request and lasts `ttl`.
///
/// The count is kept under `namespace:key` and mutated only through the
/// adapter's atomic increment; the window start lives beside it under
/// `namespace:key:first`. Storage failures fail open.
#[derive(Debug)]
pub struct Throttle {
    storage: SharedStorage,
    metrics: SharedMetrics,
    clock: SharedClock,
    options: ThrottleOptions,
    user_agents: UserAgentMatcher,
}

impl Throttle {
    /// Create a throttle with the given default options.
    ///
    /// Invalid user-agent patterns are logged and ignored.
    pub fn new(
        storage: SharedStorage,
        metrics: SharedMetrics,
        clock: SharedClock,
        options: ThrottleOptions,
    ) -> Self {
        let user_agents = compile_matcher(&options);
        Self {
            storage,
            metrics,
            clock,
            options,
            user_agents,
        }
    }

    pub fn options(&self) -> &ThrottleOptions {
        &self.options
    }

    /// Count the request against its sliding window.
    pub async fn consume(
        &self,
        context: &ProtectionContext,
        options: Option<&ThrottleOptions>,
    ) -> Result<ProtectionResult, ProtectionError> {
        let (opts, ignored) = match options {
            Some(opts) => (opts, compile_matcher(opts).is_ignored(context)),
            None => (&self.options, self.user_agents.is_ignored(context)),
        };

        if ignored {
            trace!(user_agent = ?context.user_agent(), "User agent bypasses throttle");
            let mut metadata = ResultMetadata::default();
            metadata.headers.extend(opts.custom_headers.clone());
            return Ok(ProtectionResult::allowed(metadata));
        }

        let key = opts.key_for(context);
        let labels = [("namespace", opts.namespace.as_str())];
        let keys = RecordKeys::new(&opts.namespace, &key);

        let (count, first_ms) = match self.touch(&keys, opts).await {
            Ok(state) => state,
            Err(e) => {
                warn!(key = %keys.count, error = %e, "Throttle storage failed, failing open");
                self.metrics.increment("throttle_errors", 1.0, &labels);
                return Ok(ProtectionResult::pass());
            }
        };

        let now = self.clock.now_millis();
        let ttl_ms = opts.ttl().as_millis() as u64;
        let reset_at_ms = first_ms + ttl_ms;
        let remaining = opts.limit.saturating_sub(count);
        let mut metadata = build_metadata(opts, remaining, reset_at_ms);

        trace!(key = %keys.count, count, limit = opts.limit, "Throttle consumed");

        if count <= opts.limit {
            self.metrics.increment("throttle_consumed", 1.0, &labels);
            return Ok(ProtectionResult::allowed(metadata));
        }

        self.metrics.increment("throttle_exceeded", 1.0, &labels);
        debug!(key = %key, count, limit = opts.limit, "Throttle limit exceeded");

        let retry_after = retry_after_from(Duration::from_millis(reset_at_ms.saturating_sub(now)));
        metadata
            .headers
            .insert("Retry-After".into(), retry_after.as_secs().to_string());

        Err(ProtectionError::Throttled {
            message: opts.message_for(context),
            retry_after,
            metadata,
        })
    }

    /// The request's current record, if its window is still open.
    pub async fn record(
        &self,
        context: &ProtectionContext,
        options: Option<&ThrottleOptions>,
    ) -> Result<Option<ThrottleRecord>, StorageError> {
        let opts = options.unwrap_or(&self.options);
        let keys = RecordKeys::new(&opts.namespace, &opts.key_for(context));

        let Some(count) = self.storage.get(&keys.count).await?.and_then(|v| v.as_u64()) else {
            return Ok(None);
        };
        let Some(first) = self.storage.get(&keys.first).await?.and_then(|v| v.as_u64()) else {
            return Ok(None);
        };
        if self.is_stale(first, opts) {
            return Ok(None);
        }

        Ok(millis_to_datetime(first).map(|first_request_time| ThrottleRecord {
            count,
            first_request_time,
        }))
    }

    /// Delete the request's record. Returns `true` if one existed.
    pub async fn reset(
        &self,
        context: &ProtectionContext,
        options: Option<&ThrottleOptions>,
    ) -> Result<bool, StorageError> {
        let opts = options.unwrap_or(&self.options);
        let keys = RecordKeys::new(&opts.namespace, &opts.key_for(context));
        debug!(key = %keys.count, "Resetting throttle record");
        let removed = self.storage.delete(&keys.count).await?;
        self.storage.delete(&keys.first).await?;
        Ok(removed)
    }

    /// Increment the record, starting a fresh window when the previous one
    /// is older than the TTL. Returns the new count and the window start.
    async fn touch(
        &self,
        keys: &RecordKeys,
        opts: &ThrottleOptions,
    ) -> Result<(u64, u64), StorageError> {
        let ttl = opts.ttl();
        // Both records carry the window TTL, so an elapsed window is removed
        // by the adapter; a stale start that is still readable is ignored.
        let first = self
            .storage
            .get(&keys.first)
            .await?
            .and_then(|v| v.as_u64())
            .filter(|started| !self.is_stale(*started, opts));
        if first.is_none() {
            trace!(key = %keys.count, "Starting throttle window");
        }

        let count = self.storage.increment(&keys.count, 1).await?.max(0) as u64;

        match first {
            Some(started) if count > 1 => Ok((count, started)),
            _ => {
                let now = self.clock.now_millis();
                self.storage
                    .set(&keys.first, serde_json::Value::from(now), Some(ttl))
                    .await?;
                if count == 1 {
                    self.storage.expire(&keys.count, ttl).await?;
                }
                Ok((count, now))
            }
        }
    }

    fn is_stale(&self, first_ms: u64, opts: &ThrottleOptions) -> bool {
        let ttl_ms = opts.ttl().as_millis() as u64;
        self.clock.now_millis().saturating_sub(first_ms) > ttl_ms
    }
}

fn compile_matcher(options: &ThrottleOptions) -> UserAgentMatcher {
    options.user_agent_matcher().unwrap_or_else(|e| {
        warn!(error = %e, "Invalid ignore_user_agents pattern, no agents will bypass the throttle");
        UserAgentMatcher::none()
    })
}

fn build_metadata(opts: &ThrottleOptions, remaining: u64, reset_at_ms: u64) -> ResultMetadata {
    let mut metadata = ResultMetadata {
        remaining: Some(remaining),
        limit: Some(opts.limit),
        reset_at: millis_to_datetime(reset_at_ms),
        ..Default::default()
    };
    metadata
        .headers
        .insert("X-Throttle-Limit".into(), opts.limit.to_string());
    metadata
        .headers
        .insert("X-Throttle-Remaining".into(), remaining.to_string());
    metadata
        .headers
        .insert("X-Throttle-Reset".into(), (reset_at_ms / 1000).to_string());
    for (name, value) in &opts.custom_headers {
        metadata.headers.insert(name.clone(), value.clone());
    }
    metadata
}
