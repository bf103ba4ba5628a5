//! Concurrency-limited admission with a bounded wait queue.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::config::OverloadConfig;
use super::health::{adaptive_timeout, clamp_health, derived_health, WaitAverage, FALLBACK_HEALTH};
use super::queue::{AdmissionQueue, Admitted};
use crate::context::{ProtectionContext, ProtectionResult, ResultMetadata};
use crate::error::{OverloadReason, ProtectionError};
use crate::metrics::SharedMetrics;

/// Utilization above which a non-empty queue shrinks the threshold.
const SHRINK_UTILIZATION: f64 = 0.8;
/// Utilization below which an empty queue grows the threshold.
const GROW_UTILIZATION: f64 = 0.4;

#[derive(Debug)]
struct ControllerState {
    current_requests: usize,
    queue: AdmissionQueue,
    adaptive_threshold: usize,
    health_score: f64,
    last_health_refresh: Option<Instant>,
    wait: WaitAverage,
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionStatus {
    pub current_requests: usize,
    pub queue_length: usize,
    pub effective_limit: usize,
    pub adaptive_threshold: usize,
    pub health_score: f64,
    pub utilization: f64,
    pub average_wait: Option<Duration>,
}

/// Admits requests up to a concurrency limit and queues the overflow.
///
/// All counters and the queue live behind one lock, so check-and-increment
/// and dequeue-and-admit are atomic with respect to each other.
#[derive(Debug)]
pub struct AdmissionController {
    config: OverloadConfig,
    metrics: SharedMetrics,
    state: Mutex<ControllerState>,
    adjuster: Mutex<Option<JoinHandle<()>>>,
}

impl AdmissionController {
    pub fn new(config: OverloadConfig, metrics: SharedMetrics) -> Arc<Self> {
        let state = ControllerState {
            current_requests: 0,
            queue: AdmissionQueue::new(),
            adaptive_threshold: config.initial_threshold(),
            health_score: 1.0,
            last_health_refresh: None,
            wait: WaitAverage::default(),
        };
        Arc::new(Self {
            config,
            metrics,
            state: Mutex::new(state),
            adjuster: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &OverloadConfig {
        &self.config
    }

    /// Spawn the periodic threshold adjuster, if adaptive mode is on.
    pub fn start(self: &Arc<Self>) {
        if !self.config.adaptive.enabled {
            return;
        }
        let interval = self.config.adaptive.adjustment_interval();
        let handle = tokio::spawn(adjust_loop(Arc::downgrade(self), interval));
        if let Some(previous) = self.adjuster.lock().replace(handle) {
            previous.abort();
        }
        info!(
            interval_ms = interval.as_millis() as u64,
            threshold = self.state.lock().adaptive_threshold,
            "Adaptive admission threshold enabled"
        );
    }

    /// Stop the adjuster and turn away everything still queued.
    pub fn shutdown(&self) {
        if let Some(handle) = self.adjuster.lock().take() {
            handle.abort();
        }
        let cleared = self.clear_queue();
        info!(cleared, "Admission controller shut down");
    }

    /// Take a concurrency slot, waiting in the queue if none is free.
    ///
    /// Every successful acquire must be paired with one [`release`](Self::release).
    /// `config` overrides the limits and queueing options for this request;
    /// the counters and the queue are shared. Dropping the returned future
    /// while queued gives up the queue place.
    pub async fn acquire(
        &self,
        context: &ProtectionContext,
        config: Option<&OverloadConfig>,
    ) -> Result<ProtectionResult, ProtectionError> {
        let config = config.unwrap_or(&self.config);
        self.refresh_health().await;

        let (id, rx, timeout) = {
            let mut state = self.state.lock();
            let limit = self.effective_limit(&state, config);

            if state.current_requests < limit {
                state.current_requests += 1;
                self.metrics.increment("overload_requests_accepted", 1.0, &[]);
                self.publish_gauges(&state);
                trace!(current = state.current_requests, limit, "Admitted request");
                return Ok(ProtectionResult::allowed(self.metadata(&state, None)));
            }

            if state.queue.len() >= config.max_queue_size {
                self.metrics.increment("overload_queue_full", 1.0, &[]);
                debug!(
                    path = %context.path(),
                    current = state.current_requests,
                    queue_length = state.queue.len(),
                    "Rejected request, queue is full"
                );
                return Err(ProtectionError::Overloaded {
                    reason: OverloadReason::QueueFull,
                    metadata: self.metadata(&state, None),
                });
            }

            let id = Uuid::new_v4();
            let priority = config.priority_for(context);
            let rx = state.queue.push(
                id,
                priority,
                context.clone(),
                config.shed_strategy,
                config.custom_shed_function.as_ref(),
            );
            let timeout = adaptive_timeout(config.queue_timeout(), state.wait.get());
            self.metrics.increment("overload_requests_queued", 1.0, &[]);
            self.publish_gauges(&state);
            trace!(%id, priority, timeout_ms = timeout.as_millis() as u64, "Queued request");
            (id, rx, timeout)
        };

        let mut waiter = QueuedWaiter {
            controller: self,
            id,
            rx,
            settled: false,
        };
        let answer = match tokio::time::timeout(timeout, &mut waiter.rx).await {
            Ok(received) => received.ok(),
            Err(_) => {
                waiter.settled = true;
                let removed = self.state.lock().queue.remove(id);
                if removed.is_some() {
                    self.metrics.increment("overload_queue_timeout", 1.0, &[]);
                    let state = self.state.lock();
                    self.publish_gauges(&state);
                    debug!(%id, timeout_ms = timeout.as_millis() as u64, "Request timed out in queue");
                    return Err(ProtectionError::Overloaded {
                        reason: OverloadReason::TimeoutInQueue,
                        metadata: self.metadata(&state, None),
                    });
                }
                // Answered between the timer firing and the removal.
                waiter.rx.try_recv().ok()
            }
        };
        waiter.settled = true;

        let state = self.state.lock();
        match answer {
            Some(Ok(waited)) => Ok(ProtectionResult::allowed(self.metadata(&state, Some(waited)))),
            Some(Err(reason)) => Err(ProtectionError::Overloaded {
                reason,
                metadata: self.metadata(&state, None),
            }),
            None => Err(ProtectionError::Overloaded {
                reason: OverloadReason::Shed,
                metadata: self.metadata(&state, None),
            }),
        }
    }

    /// Acquire a slot held by the returned permit until it is dropped.
    pub async fn guard(
        self: &Arc<Self>,
        context: &ProtectionContext,
    ) -> Result<AdmissionPermit, ProtectionError> {
        let result = self.acquire(context, None).await?;
        Ok(AdmissionPermit {
            controller: Arc::clone(self),
            result,
        })
    }

    /// Give back a slot and admit queued requests into the free capacity.
    ///
    /// Extra releases are ignored; the count never goes below zero.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.current_requests = state.current_requests.saturating_sub(1);
        self.drain(&mut state);
        self.publish_gauges(&state);
    }

    /// Run one adaptive adjustment cycle and return the new threshold.
    pub fn adjust_threshold(&self) -> usize {
        let adaptive = &self.config.adaptive;
        let mut state = self.state.lock();
        if !adaptive.enabled {
            return state.adaptive_threshold;
        }

        let min = adaptive.min_threshold;
        let max = adaptive.max_threshold.max(min);
        let threshold = state.adaptive_threshold;
        let utilization = state.current_requests as f64 / threshold.max(1) as f64;
        let slow = match (adaptive.target_latency(), state.wait.get()) {
            (Some(target), Some(avg)) => avg > target,
            _ => false,
        };

        // Steps of 10%: floor when shrinking, ceil when growing.
        let step = threshold.div_ceil(10);
        let next = if (utilization > SHRINK_UTILIZATION || slow) && !state.queue.is_empty() {
            threshold - step
        } else if utilization < GROW_UTILIZATION && state.queue.is_empty() {
            threshold + step
        } else {
            threshold
        }
        .clamp(min, max);

        if next != threshold {
            debug!(from = threshold, to = next, utilization, "Adjusted admission threshold");
        }
        state.adaptive_threshold = next;
        self.metrics
            .gauge("overload_adaptive_threshold", next as f64, &[]);
        if next > threshold {
            self.drain(&mut state);
            self.publish_gauges(&state);
        }
        next
    }

    /// Turn away every queued request with a cleared-queue rejection.
    pub fn clear_queue(&self) -> usize {
        let mut state = self.state.lock();
        let items = state.queue.drain_all();
        let count = items.len();
        for item in items {
            let _ = item.respond(Err(OverloadReason::Cleared));
        }
        self.publish_gauges(&state);
        if count > 0 {
            warn!(count, "Cleared admission queue");
        }
        count
    }

    pub fn status(&self) -> AdmissionStatus {
        let state = self.state.lock();
        let effective_limit = self.effective_limit(&state, &self.config);
        AdmissionStatus {
            current_requests: state.current_requests,
            queue_length: state.queue.len(),
            effective_limit,
            adaptive_threshold: state.adaptive_threshold,
            health_score: state.health_score,
            utilization: self.utilization(&state),
            average_wait: state.wait.get(),
        }
    }

    /// Recompute the health score if it is older than the check interval,
    /// serving queued requests first when the better score raises the limit.
    async fn refresh_health(&self) {
        let due = {
            let mut state = self.state.lock();
            let now = Instant::now();
            match state.last_health_refresh {
                Some(at) if now.duration_since(at) < self.config.health_check_interval() => false,
                _ => {
                    state.last_health_refresh = Some(now);
                    true
                }
            }
        };
        if !due {
            return;
        }

        let score = match &self.config.health_indicator {
            Some(indicator) => match indicator.score().await {
                Ok(score) => clamp_health(score),
                Err(e) => {
                    warn!(error = %e, "Health indicator failed, using fallback score");
                    FALLBACK_HEALTH
                }
            },
            None => {
                let state = self.state.lock();
                let queue_pressure =
                    state.queue.len() as f64 / self.config.max_queue_size.max(1) as f64;
                derived_health(self.utilization(&state), queue_pressure, state.wait.get())
            }
        };

        let mut state = self.state.lock();
        let before = self.effective_limit(&state, &self.config);
        state.health_score = score;
        self.metrics.gauge("overload_health_score", score, &[]);
        if self.effective_limit(&state, &self.config) > before {
            self.drain(&mut state);
            self.publish_gauges(&state);
        }
    }

    fn effective_limit(&self, state: &ControllerState, config: &OverloadConfig) -> usize {
        if self.config.adaptive.enabled {
            ((state.adaptive_threshold as f64 * state.health_score).floor() as usize).max(1)
        } else {
            config.max_concurrent_requests
        }
    }

    fn utilization(&self, state: &ControllerState) -> f64 {
        let capacity = if self.config.adaptive.enabled {
            state.adaptive_threshold
        } else {
            self.config.max_concurrent_requests
        };
        state.current_requests as f64 / capacity.max(1) as f64
    }

    /// Admit queued requests while there is capacity. Answers are sent
    /// under the lock so an abandoning waiter always sees a consistent
    /// queue-or-answered state.
    fn drain(&self, state: &mut ControllerState) {
        let limit = self.effective_limit(state, &self.config);
        while state.current_requests < limit {
            let Some(item) = state.queue.pop_front() else {
                break;
            };
            let waited = item.waited();
            if item.respond(Ok(waited)).is_err() {
                // The caller stopped waiting; its slot stays free.
                continue;
            }
            state.current_requests += 1;
            state.wait.record(waited);
            self.metrics.increment("overload_requests_accepted", 1.0, &[]);
            self.metrics
                .histogram("overload_queue_wait_ms", waited.as_millis() as f64, &[]);
        }
    }

    fn publish_gauges(&self, state: &ControllerState) {
        self.metrics
            .gauge("overload_current_requests", state.current_requests as f64, &[]);
        self.metrics
            .gauge("overload_queue_length", state.queue.len() as f64, &[]);
    }

    fn metadata(&self, state: &ControllerState, waited: Option<Duration>) -> ResultMetadata {
        ResultMetadata {
            queue_wait_time: waited,
            health_score: Some(state.health_score),
            current_requests: Some(state.current_requests),
            queue_length: Some(state.queue.len()),
            ..Default::default()
        }
    }

    /// A queued caller went away: drop its queue place, or hand back the
    /// slot it was already given.
    fn abandon(&self, id: Uuid, rx: &mut oneshot::Receiver<Admitted>) {
        if self.state.lock().queue.remove(id).is_some() {
            trace!(%id, "Queued request abandoned");
            return;
        }
        if let Ok(Ok(_)) = rx.try_recv() {
            self.release();
        }
    }
}

/// Drop guard for a caller waiting in the queue.
struct QueuedWaiter<'a> {
    controller: &'a AdmissionController,
    id: Uuid,
    rx: oneshot::Receiver<Admitted>,
    settled: bool,
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.controller.abandon(self.id, &mut self.rx);
        }
    }
}

/// A held concurrency slot, released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    result: ProtectionResult,
}

impl AdmissionPermit {
    pub fn result(&self) -> &ProtectionResult {
        &self.result
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release();
    }
}

async fn adjust_loop(controller: Weak<AdmissionController>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.adjust_threshold();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{InMemoryMetrics, NoopMetrics};
    use crate::overload::{AdaptiveConfig, ShedStrategy};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> ProtectionContext {
        ProtectionContext::new("GET", "/work")
    }

    fn controller(config: OverloadConfig) -> Arc<AdmissionController> {
        AdmissionController::new(config, Arc::new(NoopMetrics))
    }

    fn adaptive(min: usize, max: usize) -> AdaptiveConfig {
        AdaptiveConfig {
            enabled: true,
            min_threshold: min,
            max_threshold: max,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_queues_then_rejects() {
        let c = controller(OverloadConfig::new(2, 1));
        assert!(c.acquire(&ctx(), None).await.unwrap().allowed);
        assert!(c.acquire(&ctx(), None).await.unwrap().allowed);

        let queued = {
            let c = c.clone();
            tokio::spawn(async move { c.acquire(&ctx(), None).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(c.status().queue_length, 1);

        let err = c.acquire(&ctx(), None).await.unwrap_err();
        assert_eq!(err.overload_reason(), Some(OverloadReason::QueueFull));
        let metadata = err.metadata().unwrap();
        assert_eq!(metadata.current_requests, Some(2));
        assert_eq!(metadata.queue_length, Some(1));

        tokio::time::advance(Duration::from_millis(250)).await;
        c.release();
        let result = queued.await.unwrap().unwrap();
        assert_eq!(
            result.metadata.queue_wait_time,
            Some(Duration::from_millis(250))
        );
        assert_eq!(c.status().current_requests, 2);
        assert_eq!(c.status().queue_length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout() {
        let c = controller(OverloadConfig::new(1, 5).with_queue_timeout(Duration::from_secs(2)));
        c.acquire(&ctx(), None).await.unwrap();

        let err = c.acquire(&ctx(), None).await.unwrap_err();
        assert_eq!(err.overload_reason(), Some(OverloadReason::TimeoutInQueue));
        assert_eq!(c.status().queue_length, 0);
        assert_eq!(c.status().current_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_served_first() {
        let c = controller(OverloadConfig::new(1, 10).with_strategy(ShedStrategy::Priority));
        c.acquire(&ctx(), None).await.unwrap();

        let served = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for priority in [1, 10] {
            let c = c.clone();
            let served = served.clone();
            handles.push(tokio::spawn(async move {
                let context = ctx().with_header("X-Priority", priority.to_string());
                c.acquire(&context, None).await.unwrap();
                served.lock().push(priority);
            }));
            tokio::task::yield_now().await;
        }

        c.release();
        tokio::task::yield_now().await;
        c.release();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*served.lock(), vec![10, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_never_goes_negative() {
        let c = controller(OverloadConfig::new(2, 0));
        c.acquire(&ctx(), None).await.unwrap();
        for _ in 0..5 {
            c.release();
        }
        assert_eq!(c.status().current_requests, 0);
        c.acquire(&ctx(), None).await.unwrap();
        assert_eq!(c.status().current_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_queue_rejects_waiters() {
        let c = controller(OverloadConfig::new(1, 5));
        c.acquire(&ctx(), None).await.unwrap();

        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.acquire(&ctx(), None).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(c.clear_queue(), 1);
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.overload_reason(), Some(OverloadReason::Cleared));
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_frees_queue_place() {
        let c = controller(OverloadConfig::new(1, 1));
        c.acquire(&ctx(), None).await.unwrap();

        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.acquire(&ctx(), None).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(c.status().queue_length, 1);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(c.status().queue_length, 0);

        c.release();
        assert_eq!(c.status().current_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_shed_rejects_dropped_request() {
        let config = OverloadConfig::new(1, 5).with_shed_function(|queue| {
            queue
                .into_iter()
                .filter(|item| item.priority() > 0)
                .collect()
        });
        let c = controller(config);
        c.acquire(&ctx(), None).await.unwrap();

        let err = c
            .acquire(&ctx().with_header("X-Priority", "0"), None)
            .await
            .unwrap_err();
        assert_eq!(err.overload_reason(), Some(OverloadReason::Shed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_releases_on_drop() {
        let c = controller(OverloadConfig::new(1, 0));
        {
            let permit = c.guard(&ctx()).await.unwrap();
            assert!(permit.result().allowed);
            assert_eq!(c.status().current_requests, 1);
            assert!(c.guard(&ctx()).await.is_err());
        }
        assert_eq!(c.status().current_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_grows_when_idle_and_stays_bounded() {
        let c = controller(OverloadConfig::new(10, 10).with_adaptive(adaptive(5, 15)));
        for _ in 0..50 {
            let threshold = c.adjust_threshold();
            assert!((5..=15).contains(&threshold));
        }
        assert_eq!(c.status().adaptive_threshold, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_shrinks_under_pressure() {
        let c = controller(OverloadConfig::new(10, 10).with_adaptive(adaptive(5, 15)));
        for _ in 0..10 {
            c.acquire(&ctx(), None).await.unwrap();
        }
        let _waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.acquire(&ctx(), None).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(c.status().queue_length, 1);

        assert_eq!(c.adjust_threshold(), 9);
        for _ in 0..20 {
            assert!(c.adjust_threshold() >= 5);
        }
        assert_eq!(c.status().adaptive_threshold, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_scales_effective_limit() {
        let config = OverloadConfig::new(10, 10)
            .with_adaptive(adaptive(1, 100))
            .with_health_indicator(|| async { Ok::<_, String>(0.5) });
        let c = controller(config);
        c.acquire(&ctx(), None).await.unwrap();

        let status = c.status();
        assert_eq!(status.health_score, 0.5);
        assert_eq!(status.effective_limit, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovering_health_serves_queue_first() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let config = OverloadConfig::new(10, 10)
            .with_adaptive(adaptive(1, 100))
            .with_health_indicator(move || {
                let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
                async move { Ok::<_, String>(if first { 0.1 } else { 1.0 }) }
            });
        let c = controller(config);
        c.acquire(&ctx(), None).await.unwrap();
        assert_eq!(c.status().effective_limit, 1);

        let queued = {
            let c = c.clone();
            tokio::spawn(async move { c.acquire(&ctx(), None).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(c.status().queue_length, 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        c.acquire(&ctx(), None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let status = c.status();
        assert_eq!(status.queue_length, 0);
        assert_eq!(status.effective_limit, 10);
        assert_eq!(status.current_requests, 3);

        let served = queued.await.unwrap().unwrap();
        assert_eq!(
            served.metadata.queue_wait_time,
            Some(Duration::from_secs(6))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_health_indicator_falls_back() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let config = OverloadConfig::new(10, 10).with_health_indicator(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<f64, _>("probe down") }
        });
        let c = controller(config);

        c.acquire(&ctx(), None).await.unwrap();
        c.acquire(&ctx(), None).await.unwrap();
        assert_eq!(c.status().health_score, FALLBACK_HEALTH);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        c.acquire(&ctx(), None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_emitted() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let c = AdmissionController::new(OverloadConfig::new(1, 0), metrics.clone());
        c.acquire(&ctx(), None).await.unwrap();
        let _ = c.acquire(&ctx(), None).await;

        assert_eq!(metrics.counter("overload_requests_accepted"), 1.0);
        assert_eq!(metrics.counter("overload_queue_full"), 1.0);
        assert_eq!(metrics.gauge_value("overload_current_requests", &[]), Some(1.0));
    }
}
