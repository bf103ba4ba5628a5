//! Keyed registry of circuit breakers.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{BreakerConfig, BreakerManagerConfig, HealthCheck};
use super::events::{spawn_dispatcher, BreakerEvent, BreakerEventKind, EventEmitter, SUBSCRIBER_CAPACITY};
use super::state::{Admission, BreakerStats, CircuitBreaker, CircuitState, FailureKind};
use crate::context::ProtectionContext;
use crate::error::{CallError, ProtectionError};
use crate::metrics::SharedMetrics;

/// Share of the registry evicted when a new key would exceed the cap.
const OVER_CAP_EVICTION_RATIO: f64 = 0.2;

/// A live breaker and its bookkeeping.
#[derive(Debug)]
struct BreakerInstance {
    id: Uuid,
    key: String,
    breaker: CircuitBreaker,
    last_access: Mutex<Instant>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl BreakerInstance {
    fn new(key: &str, config: BreakerConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.to_string(),
            breaker: CircuitBreaker::new(config),
            last_access: Mutex::new(Instant::now()),
            health_task: Mutex::new(None),
        }
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    fn stop_health_check(&self) {
        if let Some(handle) = self.health_task.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for BreakerInstance {
    fn drop(&mut self) {
        self.stop_health_check();
    }
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub evicted: usize,
    pub remaining: usize,
}

/// Creates breakers lazily per key and evicts idle ones.
///
/// Get-or-create goes through the map's entry lock so concurrent first
/// calls for one key always share a single breaker.
#[derive(Debug)]
pub struct CircuitBreakerManager {
    config: BreakerManagerConfig,
    breakers: DashMap<String, Arc<BreakerInstance>>,
    emitter: EventEmitter,
    subscribers: broadcast::Sender<BreakerEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CircuitBreakerManager {
    /// Create the manager and spawn its event dispatcher and sweep loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: BreakerManagerConfig, metrics: SharedMetrics) -> Arc<Self> {
        let (subscribers, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let (emitter, dispatcher) = spawn_dispatcher(metrics, subscribers.clone());
        let sweep_interval = config.sweep_interval();

        let manager = Arc::new(Self {
            config,
            breakers: DashMap::new(),
            emitter,
            subscribers,
            tasks: Mutex::new(vec![dispatcher]),
        });

        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(&manager), sweep_interval));
        manager.tasks.lock().push(sweeper);

        info!(
            max_instances = manager.config.max_instances,
            max_age_secs = manager.config.max_age_secs,
            "Circuit breaker manager started"
        );
        manager
    }

    pub fn config(&self) -> &BreakerManagerConfig {
        &self.config
    }

    /// Run `handler` through the breaker for `key`.
    ///
    /// `config` is used only if this call creates the breaker.
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: &str,
        handler: F,
        context: &ProtectionContext,
        config: Option<&BreakerConfig>,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let instance = self.get_or_create(key, config);
        let breaker = &instance.breaker;

        self.emitter.emit(key, BreakerEventKind::Fire);
        let (admission, transition) = breaker.try_acquire();
        if transition.is_some() {
            debug!(key = %key, "Circuit breaker half-open, admitting trial call");
        }
        self.emitter.emit_transition(key, transition);

        let trial = match admission {
            Admission::Permitted { trial } => trial,
            Admission::Rejected => {
                self.emitter.emit(key, BreakerEventKind::Reject);
                let state = breaker.state();
                debug!(key = %key, path = %context.path(), state = %state, "Circuit breaker rejected call");
                return Err(ProtectionError::CircuitOpen {
                    key: key.to_string(),
                    state,
                    stats: breaker.stats(),
                }
                .into());
            }
        };

        let outcome = match breaker.config().timeout() {
            Some(timeout) if breaker.config().enabled => tokio::time::timeout(timeout, handler())
                .await
                .map_err(|_| timeout),
            _ => Ok(handler().await),
        };

        match outcome {
            Ok(Ok(value)) => {
                self.emitter.emit(key, BreakerEventKind::Success);
                let transition = breaker.record_success(trial);
                if transition.is_some() {
                    info!(key = %key, "Circuit breaker closed");
                }
                self.emitter.emit_transition(key, transition);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.emitter.emit(key, BreakerEventKind::Failure);
                self.record_failure(&instance, FailureKind::Error, trial);
                Err(CallError::Handler(err))
            }
            Err(timeout) => {
                self.emitter.emit(key, BreakerEventKind::Timeout);
                self.record_failure(&instance, FailureKind::Timeout, trial);
                Err(ProtectionError::CircuitTimeout {
                    key: key.to_string(),
                    timeout,
                    stats: breaker.stats(),
                }
                .into())
            }
        }
    }

    /// Like [`execute`](Self::execute), but a failure or rejection is
    /// replaced by the value `fallback` computes from it.
    pub async fn execute_with_fallback<T, E, F, Fut, FB>(
        &self,
        key: &str,
        handler: F,
        context: &ProtectionContext,
        config: Option<&BreakerConfig>,
        fallback: FB,
    ) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(CallError<E>, &ProtectionContext) -> T,
    {
        match self.execute(key, handler, context, config).await {
            Ok(value) => value,
            Err(err) => {
                if let Some(instance) = self.breakers.get(key).map(|e| e.value().clone()) {
                    instance.breaker.record_fallback();
                }
                self.emitter.emit(key, BreakerEventKind::Fallback);
                fallback(err, context)
            }
        }
    }

    /// Push `calls` successful no-op calls through the breaker for `key`
    /// without any state transition.
    pub fn warm_up(&self, key: &str, calls: u64) {
        let instance = self.get_or_create(key, None);
        for _ in 0..calls {
            instance.breaker.record_warm_up_call();
            self.emitter.emit(key, BreakerEventKind::Fire);
            self.emitter.emit(key, BreakerEventKind::Success);
        }
        debug!(key = %key, calls, "Circuit breaker warmed up");
    }

    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.breakers.get(key).map(|e| e.breaker.state())
    }

    pub fn stats(&self, key: &str) -> Option<BreakerStats> {
        self.breakers.get(key).map(|e| e.breaker.stats())
    }

    /// Force the breaker for `key` open, creating it if needed.
    pub fn open(&self, key: &str) {
        let instance = self.get_or_create(key, None);
        let transition = instance.breaker.force_open();
        if transition.is_some() {
            info!(key = %key, "Circuit breaker forced open");
        }
        self.emitter.emit_transition(key, transition);
    }

    /// Force the breaker for `key` closed. Returns false if there is none.
    pub fn close(&self, key: &str) -> bool {
        let Some(instance) = self.breakers.get(key).map(|e| e.value().clone()) else {
            return false;
        };
        let transition = instance.breaker.force_close();
        if transition.is_some() {
            info!(key = %key, "Circuit breaker forced closed");
        }
        self.emitter.emit_transition(key, transition);
        true
    }

    /// Drop the breaker for `key` and stop its health check.
    pub fn remove(&self, key: &str) -> bool {
        match self.breakers.remove(key) {
            Some((_, instance)) => {
                instance.stop_health_check();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.breakers.contains_key(key)
    }

    /// Receive every breaker event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.subscribers.subscribe()
    }

    /// Evict breakers idle for longer than the max age.
    ///
    /// Breakers accessed within the max age are never evicted here, even if
    /// the registry is over its cap.
    pub fn sweep(&self) -> SweepReport {
        let max_age = self.config.max_age();
        let now = Instant::now();
        let mut evicted = 0;

        self.breakers.retain(|_, instance| {
            let idle = now.duration_since(instance.last_access()) > max_age;
            if idle {
                instance.stop_health_check();
                evicted += 1;
            }
            !idle
        });

        let remaining = self.breakers.len();
        if evicted > 0 {
            info!(evicted, remaining, "Evicted idle circuit breakers");
        }
        if remaining > self.config.max_instances {
            warn!(
                remaining,
                max_instances = self.config.max_instances,
                "Circuit breaker registry above capacity with only recently used breakers"
            );
        }
        SweepReport { evicted, remaining }
    }

    /// Stop background tasks and every health check.
    pub fn shutdown(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        for entry in self.breakers.iter() {
            entry.stop_health_check();
        }
        info!("Circuit breaker manager shut down");
    }

    fn get_or_create(&self, key: &str, config: Option<&BreakerConfig>) -> Arc<BreakerInstance> {
        if let Some(instance) = self.breakers.get(key).map(|e| e.value().clone()) {
            instance.touch();
            return instance;
        }

        // Eviction takes shard locks of its own, so it must happen before
        // the entry lock below is held.
        if self.breakers.len() >= self.config.max_instances {
            self.evict_oldest();
        }

        let mut created = false;
        let instance = self
            .breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                created = true;
                let config = config.cloned().unwrap_or_else(|| self.config.defaults.clone());
                Arc::new(BreakerInstance::new(key, config))
            })
            .value()
            .clone();

        if created {
            debug!(key = %key, id = %instance.id, "Created circuit breaker");
            self.start_health_check(&instance);
        } else {
            instance.touch();
        }
        instance
    }

    /// Evict the least recently used share of the registry.
    fn evict_oldest(&self) {
        let mut by_age: Vec<(String, Instant)> = self
            .breakers
            .iter()
            .map(|e| (e.key().clone(), e.last_access()))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);

        let count = ((by_age.len() as f64 * OVER_CAP_EVICTION_RATIO).ceil() as usize).max(1);
        let mut evicted = 0;
        for (key, seen) in by_age.into_iter().take(count) {
            // Skip breakers touched since the snapshot.
            if let Some((_, instance)) = self
                .breakers
                .remove_if(&key, |_, instance| instance.last_access() == seen)
            {
                instance.stop_health_check();
                evicted += 1;
            }
        }
        warn!(
            evicted,
            max_instances = self.config.max_instances,
            "Circuit breaker registry at capacity, evicted least recently used"
        );
    }

    fn start_health_check(&self, instance: &Arc<BreakerInstance>) {
        let config = instance.breaker.config();
        let (Some(check), Some(interval)) = (config.health_check.clone(), config.health_check_interval())
        else {
            return;
        };
        let handle = tokio::spawn(health_check_loop(
            Arc::downgrade(instance),
            check,
            interval,
            self.emitter.clone(),
        ));
        *instance.health_task.lock() = Some(handle);
    }
}

impl Drop for CircuitBreakerManager {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

async fn sweep_loop(manager: Weak<CircuitBreakerManager>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.sweep();
    }
}

async fn health_check_loop(
    instance: Weak<BreakerInstance>,
    check: HealthCheck,
    interval: Duration,
    emitter: EventEmitter,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        if instance.strong_count() == 0 {
            break;
        }
        let healthy = check.check().await;
        let Some(instance) = instance.upgrade() else {
            break;
        };
        if !healthy {
            let transition = instance.breaker.force_open();
            if transition.is_some() {
                warn!(key = %instance.key, "Health check failed, opening circuit breaker");
            }
            emitter.emit_transition(&instance.key, transition);
        }
    }
}

impl CircuitBreakerManager {
    fn record_failure(&self, instance: &BreakerInstance, kind: FailureKind, trial: bool) {
        let transition = instance.breaker.record_failure(kind, trial);
        if transition.is_some() {
            let stats = instance.breaker.stats();
            warn!(
                key = %instance.key,
                error_percentage = stats.error_percentage,
                failures = stats.failures,
                timeouts = stats.timeouts,
                "Circuit breaker opened"
            );
        }
        self.emitter.emit_transition(&instance.key, transition);
    }
}
