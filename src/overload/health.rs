//! Health score and queue-wait statistics.

use std::time::Duration;

/// Smoothing factor for the queue-wait moving average.
const WAIT_SMOOTHING: f64 = 0.1;
/// Average wait at which processing is considered fully degraded.
const WAIT_BASELINE: Duration = Duration::from_secs(30);
/// Score used when a health indicator fails.
pub(crate) const FALLBACK_HEALTH: f64 = 0.5;

/// Exponentially smoothed queue wait time.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WaitAverage {
    secs: Option<f64>,
}

impl WaitAverage {
    pub(crate) fn record(&mut self, wait: Duration) {
        let sample = wait.as_secs_f64();
        self.secs = Some(match self.secs {
            Some(avg) => WAIT_SMOOTHING * sample + (1.0 - WAIT_SMOOTHING) * avg,
            None => sample,
        });
    }

    /// `None` until the first request has left the queue.
    pub(crate) fn get(&self) -> Option<Duration> {
        self.secs.map(Duration::from_secs_f64)
    }
}

/// Health derived from load: `1 - max(utilization, queue pressure) * efficiency`.
///
/// Efficiency grows from 0.5 with no waiting to 1.0 at the wait baseline, so
/// long queue waits pull the score down further.
pub(crate) fn derived_health(utilization: f64, queue_pressure: f64, avg_wait: Option<Duration>) -> f64 {
    let wait_ratio = avg_wait
        .map(|wait| (wait.as_secs_f64() / WAIT_BASELINE.as_secs_f64()).min(1.0))
        .unwrap_or(0.0);
    let efficiency = 0.5 + 0.5 * wait_ratio;
    let load = utilization.max(queue_pressure).clamp(0.0, 1.0);
    (1.0 - load * efficiency).clamp(0.0, 1.0)
}

/// Clamp an indicator's report into `[0, 1]`, treating NaN as failure.
pub(crate) fn clamp_health(score: f64) -> f64 {
    if score.is_nan() {
        FALLBACK_HEALTH
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Per-item queue timeout, stretched or shrunk by recent queue waits.
pub(crate) fn adaptive_timeout(base: Duration, avg_wait: Option<Duration>) -> Duration {
    let Some(avg) = avg_wait else {
        return base;
    };
    if avg < Duration::from_secs(1) {
        (base / 2).max(Duration::from_secs(5))
    } else if avg > Duration::from_secs(10) {
        let factor = (avg.as_secs_f64() / 10.0).min(3.0);
        base.mul_f64(factor).min(Duration::from_secs(120))
    } else {
        (avg * 2).max(base / 2).min(base * 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_average_smooths() {
        let mut avg = WaitAverage::default();
        assert_eq!(avg.get(), None);

        avg.record(Duration::from_secs(10));
        assert_eq!(avg.get(), Some(Duration::from_secs(10)));

        avg.record(Duration::from_secs(0));
        let secs = avg.get().unwrap().as_secs_f64();
        assert!((secs - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_derived_health() {
        assert_eq!(derived_health(0.0, 0.0, None), 1.0);
        assert_eq!(derived_health(1.0, 0.0, None), 0.5);
        assert_eq!(derived_health(0.2, 1.0, Some(Duration::from_secs(60))), 0.0);
        assert!((derived_health(0.5, 0.1, Some(Duration::from_secs(15))) - 0.625).abs() < 1e-9);
    }

    #[test]
    fn test_clamp_health() {
        assert_eq!(clamp_health(1.7), 1.0);
        assert_eq!(clamp_health(-0.2), 0.0);
        assert_eq!(clamp_health(f64::NAN), FALLBACK_HEALTH);
    }

    #[test]
    fn test_adaptive_timeout_rules() {
        let base = Duration::from_secs(30);
        assert_eq!(adaptive_timeout(base, None), base);
        assert_eq!(
            adaptive_timeout(base, Some(Duration::from_millis(200))),
            Duration::from_secs(15)
        );
        assert_eq!(
            adaptive_timeout(Duration::from_secs(4), Some(Duration::from_millis(200))),
            Duration::from_secs(5)
        );
        assert_eq!(
            adaptive_timeout(base, Some(Duration::from_secs(20))),
            Duration::from_secs(60)
        );
        assert_eq!(
            adaptive_timeout(Duration::from_secs(60), Some(Duration::from_secs(50))),
            Duration::from_secs(120)
        );
        assert_eq!(
            adaptive_timeout(base, Some(Duration::from_secs(5))),
            Duration::from_secs(15)
        );
        assert_eq!(
            adaptive_timeout(base, Some(Duration::from_secs(9))),
            Duration::from_secs(18)
        );
    }
}
