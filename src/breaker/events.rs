//! Breaker lifecycle events.
//!
//! Breakers push events onto an unbounded channel so the call path never
//! waits on observers. A dispatcher task turns them into metrics and fans
//! them out to subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::trace;

use super::state::CircuitState;
use crate::metrics::SharedMetrics;

/// Capacity of the subscriber broadcast; slow subscribers lag and skip.
pub(crate) const SUBSCRIBER_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerEventKind {
    Fire,
    Success,
    Failure,
    Timeout,
    Reject,
    Fallback,
    Open,
    HalfOpen,
    Close,
}

impl BreakerEventKind {
    /// Counter incremented for this event, if any.
    pub fn counter(&self) -> Option<&'static str> {
        match self {
            BreakerEventKind::Fire => Some("circuit_breaker_fires"),
            BreakerEventKind::Success => Some("circuit_breaker_successes"),
            BreakerEventKind::Failure => Some("circuit_breaker_failures"),
            BreakerEventKind::Timeout => Some("circuit_breaker_timeouts"),
            BreakerEventKind::Reject => Some("circuit_breaker_rejects"),
            BreakerEventKind::Fallback => Some("circuit_breaker_fallbacks"),
            _ => None,
        }
    }

    /// State entered, for transition events.
    pub fn transition(&self) -> Option<CircuitState> {
        match self {
            BreakerEventKind::Open => Some(CircuitState::Open),
            BreakerEventKind::HalfOpen => Some(CircuitState::HalfOpen),
            BreakerEventKind::Close => Some(CircuitState::Closed),
            _ => None,
        }
    }

    pub(crate) fn from_state(state: CircuitState) -> Self {
        match state {
            CircuitState::Open => BreakerEventKind::Open,
            CircuitState::HalfOpen => BreakerEventKind::HalfOpen,
            CircuitState::Closed => BreakerEventKind::Close,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerEvent {
    pub key: String,
    pub kind: BreakerEventKind,
    pub timestamp: DateTime<Utc>,
}

/// Non-blocking event sender handed to every breaker.
#[derive(Debug, Clone)]
pub(crate) struct EventEmitter {
    tx: mpsc::UnboundedSender<BreakerEvent>,
}

impl EventEmitter {
    pub(crate) fn emit(&self, key: &str, kind: BreakerEventKind) {
        let event = BreakerEvent {
            key: key.to_string(),
            kind,
            timestamp: Utc::now(),
        };
        // The dispatcher is gone only after shutdown.
        let _ = self.tx.send(event);
    }

    pub(crate) fn emit_transition(&self, key: &str, state: Option<CircuitState>) {
        if let Some(state) = state {
            self.emit(key, BreakerEventKind::from_state(state));
        }
    }
}

/// Spawn the dispatcher. Must be called from within a tokio runtime.
pub(crate) fn spawn_dispatcher(
    metrics: SharedMetrics,
    subscribers: broadcast::Sender<BreakerEvent>,
) -> (EventEmitter, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(dispatch(rx, metrics, subscribers));
    (EventEmitter { tx }, handle)
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<BreakerEvent>,
    metrics: SharedMetrics,
    subscribers: broadcast::Sender<BreakerEvent>,
) {
    while let Some(event) = rx.recv().await {
        let labels = [("key", event.key.as_str())];
        if let Some(name) = event.kind.counter() {
            metrics.increment(name, 1.0, &labels);
        }
        if let Some(state) = event.kind.transition() {
            metrics.gauge("circuit_breaker_state", state.gauge_value(), &labels);
        }
        trace!(key = %event.key, kind = ?event.kind, "Breaker event");
        // No subscribers is the common case.
        let _ = subscribers.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_dispatcher_records_metrics_and_broadcasts() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let (subscribers, mut rx) = broadcast::channel(16);
        let (emitter, handle) = spawn_dispatcher(metrics.clone(), subscribers);

        emitter.emit("payments", BreakerEventKind::Fire);
        emitter.emit("payments", BreakerEventKind::Failure);
        emitter.emit_transition("payments", Some(CircuitState::Open));
        emitter.emit_transition("payments", None);

        let kinds: Vec<_> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|e| e.kind)
        .collect();
        assert_eq!(
            kinds,
            vec![
                BreakerEventKind::Fire,
                BreakerEventKind::Failure,
                BreakerEventKind::Open
            ]
        );

        assert_eq!(metrics.counter("circuit_breaker_fires"), 1.0);
        assert_eq!(metrics.counter("circuit_breaker_failures"), 1.0);
        assert_eq!(
            metrics.gauge_value("circuit_breaker_state", &[("key", "payments")]),
            Some(1.0)
        );

        drop(emitter);
        handle.await.unwrap();
    }

    #[test]
    fn test_kind_mappings() {
        assert_eq!(BreakerEventKind::Reject.counter(), Some("circuit_breaker_rejects"));
        assert_eq!(BreakerEventKind::Close.counter(), None);
        assert_eq!(
            BreakerEventKind::HalfOpen.transition(),
            Some(CircuitState::HalfOpen)
        );
        assert_eq!(
            BreakerEventKind::from_state(CircuitState::Closed),
            BreakerEventKind::Close
        );
    }
}
