//! Breaker state machine with rolling-window statistics.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::config::BreakerConfig;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// A single trial call is allowed to test recovery
    HalfOpen,
    /// Calls fail fast
    Open,
}

impl CircuitState {
    /// Gauge encoding: 0 closed, 0.5 half-open, 1 open.
    pub fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Open => 1.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half-open",
            CircuitState::Open => "open",
        };
        f.write_str(name)
    }
}

/// Counts over the breaker's rolling window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub state: Option<CircuitState>,
    pub fires: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejects: u64,
    pub fallbacks: u64,
    /// Failed share of completed calls, in percent
    pub error_percentage: f64,
}

impl BreakerStats {
    /// Calls that ran to completion (successfully or not).
    pub fn completed(&self) -> u64 {
        self.successes + self.failures + self.timeouts
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    fires: u64,
    successes: u64,
    failures: u64,
    timeouts: u64,
    rejects: u64,
    fallbacks: u64,
}

#[derive(Debug)]
struct RollingWindow {
    window: Duration,
    bucket_width: Duration,
    buckets: VecDeque<(Instant, Bucket)>,
}

impl RollingWindow {
    fn new(window: Duration, bucket_width: Duration) -> Self {
        Self {
            window,
            bucket_width,
            buckets: VecDeque::new(),
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some((start, _)) = self.buckets.front() {
            if *start + self.window <= now {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn current(&mut self, now: Instant) -> &mut Bucket {
        self.expire(now);
        let needs_bucket = self
            .buckets
            .back()
            .map_or(true, |(start, _)| *start + self.bucket_width <= now);
        if needs_bucket {
            self.buckets.push_back((now, Bucket::default()));
        }
        let last = self.buckets.len() - 1;
        &mut self.buckets[last].1
    }

    fn totals(&mut self, now: Instant) -> Bucket {
        self.expire(now);
        self.buckets.iter().fold(Bucket::default(), |mut acc, (_, b)| {
            acc.fires += b.fires;
            acc.successes += b.successes;
            acc.failures += b.failures;
            acc.timeouts += b.timeouts;
            acc.rejects += b.rejects;
            acc.fallbacks += b.fallbacks;
            acc
        })
    }

    fn clear(&mut self) {
        self.buckets.clear();
    }
}

/// How a permitted call ended badly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Error,
    Timeout,
}

/// Admission decision for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Run the call. `trial` is set for the half-open probe.
    Permitted { trial: bool },
    /// Fail fast without running the call.
    Rejected,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    trial_started_at: Option<Instant>,
    created_at: Instant,
}

/// One breaker's state machine.
///
/// CLOSED trips to OPEN once the window holds at least `volume_threshold`
/// completed calls and the error rate exceeds the threshold. After
/// `reset_timeout` the next call is admitted as a HALF-OPEN trial; its
/// success closes the breaker, its failure reopens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: RollingWindow::new(config.rolling_window(), config.bucket_width()),
                opened_at: None,
                trial_started_at: None,
                created_at: now,
            }),
            config,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Decide whether a call may run, recording it as fired or rejected.
    ///
    /// Returns the admission and the new state if the breaker moved to
    /// HALF-OPEN.
    pub fn try_acquire(&self) -> (Admission, Option<CircuitState>) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.window.current(now).fires += 1;

        if !self.config.enabled {
            return (Admission::Permitted { trial: false }, None);
        }

        match inner.state {
            CircuitState::Closed => (Admission::Permitted { trial: false }, None),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.reset_timeout() {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started_at = Some(now);
                    (Admission::Permitted { trial: true }, Some(CircuitState::HalfOpen))
                } else {
                    inner.window.current(now).rejects += 1;
                    (Admission::Rejected, None)
                }
            }
            CircuitState::HalfOpen => {
                // A trial that never reported back (its caller went away)
                // is replaced after another reset timeout.
                let stalled = inner
                    .trial_started_at
                    .map(|at| now.duration_since(at) >= self.config.reset_timeout())
                    .unwrap_or(true);
                if stalled {
                    inner.trial_started_at = Some(now);
                    (Admission::Permitted { trial: true }, None)
                } else {
                    inner.window.current(now).rejects += 1;
                    (Admission::Rejected, None)
                }
            }
        }
    }

    /// Record a successful call. Returns `Closed` if a trial closed the breaker.
    pub fn record_success(&self, trial: bool) -> Option<CircuitState> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.window.current(now).successes += 1;

        if trial && inner.state == CircuitState::HalfOpen {
            Self::transition_closed(&mut inner);
            return Some(CircuitState::Closed);
        }
        None
    }

    /// Record a failed call. Returns `Open` if the breaker tripped.
    pub fn record_failure(&self, kind: FailureKind, trial: bool) -> Option<CircuitState> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        {
            let bucket = inner.window.current(now);
            match kind {
                FailureKind::Error => bucket.failures += 1,
                FailureKind::Timeout => bucket.timeouts += 1,
            }
        }

        if !self.config.enabled {
            return None;
        }

        match inner.state {
            CircuitState::HalfOpen if trial => {
                Self::transition_open(&mut inner, now);
                Some(CircuitState::Open)
            }
            CircuitState::Closed => {
                let warming_up = self.config.allow_warm_up
                    && now.duration_since(inner.created_at) < self.config.rolling_window();
                if warming_up {
                    return None;
                }
                let totals = inner.window.totals(now);
                let completed = totals.successes + totals.failures + totals.timeouts;
                if completed < self.config.volume_threshold.max(1) {
                    return None;
                }
                let error_percentage =
                    (totals.failures + totals.timeouts) as f64 * 100.0 / completed as f64;
                if error_percentage > self.config.error_threshold_percentage {
                    Self::transition_open(&mut inner, now);
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn record_fallback(&self) {
        let now = Instant::now();
        self.inner.lock().window.current(now).fallbacks += 1;
    }

    /// Count a no-op successful call without any state transition.
    pub fn record_warm_up_call(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let bucket = inner.window.current(now);
        bucket.fires += 1;
        bucket.successes += 1;
    }

    /// Force the breaker open. Returns `Open` if it was not already.
    pub fn force_open(&self) -> Option<CircuitState> {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            return None;
        }
        Self::transition_open(&mut inner, Instant::now());
        Some(CircuitState::Open)
    }

    /// Force the breaker closed. Returns `Closed` if it was not already.
    pub fn force_close(&self) -> Option<CircuitState> {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Closed {
            return None;
        }
        Self::transition_closed(&mut inner);
        Some(CircuitState::Closed)
    }

    pub fn stats(&self) -> BreakerStats {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let totals = inner.window.totals(now);
        let completed = totals.successes + totals.failures + totals.timeouts;
        let error_percentage = if completed == 0 {
            0.0
        } else {
            (totals.failures + totals.timeouts) as f64 * 100.0 / completed as f64
        };
        BreakerStats {
            state: Some(inner.state),
            fires: totals.fires,
            successes: totals.successes,
            failures: totals.failures,
            timeouts: totals.timeouts,
            rejects: totals.rejects,
            fallbacks: totals.fallbacks,
            error_percentage,
        }
    }

    fn transition_open(inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.trial_started_at = None;
    }

    fn transition_closed(inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.trial_started_at = None;
        // Stale failures from before the outage must not re-trip a
        // freshly closed breaker.
        inner.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(volume_threshold: u64, reset_timeout_ms: u64) -> BreakerConfig {
        BreakerConfig {
            volume_threshold,
            reset_timeout_ms,
            error_threshold_percentage: 50.0,
            ..Default::default()
        }
    }

    fn fail(cb: &CircuitBreaker) -> Option<CircuitState> {
        let (admission, _) = cb.try_acquire();
        assert_eq!(admission, Admission::Permitted { trial: false });
        cb.record_failure(FailureKind::Error, false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_state() {
        let cb = CircuitBreaker::new(BreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.try_acquire().0, Admission::Permitted { trial: false });
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_threshold_gates_tripping() {
        let cb = CircuitBreaker::new(config(4, 1_000));

        assert_eq!(fail(&cb), None);
        assert_eq!(fail(&cb), None);
        assert_eq!(fail(&cb), None);
        assert_eq!(cb.state(), CircuitState::Closed);

        assert_eq!(fail(&cb), Some(CircuitState::Open));
        assert_eq!(cb.try_acquire().0, Admission::Rejected);
        assert_eq!(cb.stats().rejects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_rate_must_exceed_threshold() {
        let cb = CircuitBreaker::new(config(4, 1_000));
        for _ in 0..2 {
            cb.try_acquire();
            cb.record_success(false);
        }
        // 2 failures of 4 is exactly 50%, not above it.
        assert_eq!(fail(&cb), None);
        assert_eq!(fail(&cb), None);
        assert_eq!(cb.state(), CircuitState::Closed);

        // 3 of 5 is 60%.
        assert_eq!(fail(&cb), Some(CircuitState::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_single_trial() {
        let cb = CircuitBreaker::new(config(1, 1_000));
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(
            cb.try_acquire(),
            (Admission::Permitted { trial: true }, Some(CircuitState::HalfOpen))
        );
        assert_eq!(cb.try_acquire().0, Admission::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_success_closes() {
        let cb = CircuitBreaker::new(config(1, 1_000));
        fail(&cb);
        tokio::time::advance(Duration::from_millis(1_000)).await;
        cb.try_acquire();

        assert_eq!(cb.record_success(true), Some(CircuitState::Closed));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens() {
        let cb = CircuitBreaker::new(config(1, 1_000));
        fail(&cb);
        tokio::time::advance(Duration::from_millis(1_000)).await;
        cb.try_acquire();

        assert_eq!(
            cb.record_failure(FailureKind::Timeout, true),
            Some(CircuitState::Open)
        );
        assert_eq!(cb.try_acquire().0, Admission::Rejected);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(cb.try_acquire().0, Admission::Permitted { trial: true });
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_trial_is_replaced() {
        let cb = CircuitBreaker::new(config(1, 1_000));
        fail(&cb);
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(cb.try_acquire().0, Admission::Permitted { trial: true });

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(cb.try_acquire().0, Admission::Permitted { trial: true });
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_window_forgets_old_failures() {
        let cb = CircuitBreaker::new(config(3, 1_000));
        fail(&cb);
        fail(&cb);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cb.stats().failures, 0);
        assert_eq!(fail(&cb), None);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_warm_up_suppresses_tripping() {
        let cb = CircuitBreaker::new(BreakerConfig {
            allow_warm_up: true,
            ..config(1, 1_000)
        });
        assert_eq!(fail(&cb), None);
        assert_eq!(cb.state(), CircuitState::Closed);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(fail(&cb), Some(CircuitState::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_breaker_never_trips() {
        let cb = CircuitBreaker::new(BreakerConfig {
            enabled: false,
            ..config(1, 1_000)
        });
        for _ in 0..10 {
            assert_eq!(fail(&cb), None);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failures, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_open_and_close() {
        let cb = CircuitBreaker::new(BreakerConfig::default());
        assert_eq!(cb.force_open(), Some(CircuitState::Open));
        assert_eq!(cb.force_open(), None);
        assert_eq!(cb.try_acquire().0, Admission::Rejected);

        assert_eq!(cb.force_close(), Some(CircuitState::Closed));
        assert_eq!(cb.try_acquire().0, Admission::Permitted { trial: false });
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_error_percentage() {
        let cb = CircuitBreaker::new(config(100, 1_000));
        cb.try_acquire();
        cb.record_success(false);
        fail(&cb);
        cb.record_warm_up_call();

        let stats = cb.stats();
        assert_eq!(stats.fires, 3);
        assert_eq!(stats.completed(), 3);
        assert!((stats.error_percentage - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_state_gauge_and_display() {
        assert_eq!(CircuitState::Closed.gauge_value(), 0.0);
        assert_eq!(CircuitState::HalfOpen.gauge_value(), 0.5);
        assert_eq!(CircuitState::Open.gauge_value(), 1.0);
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
    }
}
