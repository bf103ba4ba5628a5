//! Metrics sink contract the engine emits counts and gauges to.
//!
//! Exporters live outside the engine; they implement [`MetricsSink`] and are
//! injected at construction time.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

/// Label set attached to a metric sample.
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Destination for engine metrics.
///
/// Implementations must be cheap and non-blocking; they are called on the
/// decision path.
pub trait MetricsSink: Send + Sync + Debug {
    fn increment(&self, name: &str, value: f64, labels: Labels<'_>);
    fn gauge(&self, name: &str, value: f64, labels: Labels<'_>);
    fn histogram(&self, name: &str, value: f64, labels: Labels<'_>);
}

/// Shareable metrics sink reference.
pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
    fn gauge(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
    fn histogram(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
}

/// Sink that keeps everything in memory.
///
/// Series are keyed by name plus sorted labels, e.g.
/// `rate_limit_consumed{namespace=api}`.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<String, f64>,
    gauges: DashMap<String, f64>,
    histograms: DashMap<String, Vec<f64>>,
}

/// Point-in-time copy of an [`InMemoryMetrics`] sink.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, f64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, Vec<f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of a counter across every label set.
    pub fn counter(&self, name: &str) -> f64 {
        self.counters
            .iter()
            .filter(|entry| series_name(entry.key()) == name)
            .map(|entry| *entry.value())
            .sum()
    }

    /// Value of a counter for one exact label set.
    pub fn counter_with(&self, name: &str, labels: Labels<'_>) -> f64 {
        self.counters
            .get(&series_key(name, labels))
            .map(|v| *v)
            .unwrap_or(0.0)
    }

    /// Most recent value of a gauge for one exact label set.
    pub fn gauge_value(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        self.gauges.get(&series_key(name, labels)).map(|v| *v)
    }

    /// Number of histogram samples recorded across every label set.
    pub fn histogram_count(&self, name: &str) -> usize {
        self.histograms
            .iter()
            .filter(|entry| series_name(entry.key()) == name)
            .map(|entry| entry.value().len())
            .sum()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            histograms: self
                .histograms
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, value: f64, labels: Labels<'_>) {
        *self.counters.entry(series_key(name, labels)).or_insert(0.0) += value;
    }

    fn gauge(&self, name: &str, value: f64, labels: Labels<'_>) {
        self.gauges.insert(series_key(name, labels), value);
    }

    fn histogram(&self, name: &str, value: f64, labels: Labels<'_>) {
        self.histograms
            .entry(series_key(name, labels))
            .or_default()
            .push(value);
    }
}

fn series_key(name: &str, labels: Labels<'_>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_unstable();
    let rendered: Vec<String> = sorted.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}{{{}}}", name, rendered.join(","))
}

fn series_name(key: &str) -> &str {
    key.split('{').next().unwrap_or(key)
}
