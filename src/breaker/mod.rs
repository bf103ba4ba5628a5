//! Keyed circuit breakers with rolling-window error rates.

mod config;
mod events;
mod manager;
mod state;

pub use config::{BreakerConfig, BreakerManagerConfig, HealthCheck};
pub use events::{BreakerEvent, BreakerEventKind};
pub use manager::{CircuitBreakerManager, SweepReport};
pub use state::{Admission, BreakerStats, CircuitBreaker, CircuitState, FailureKind};
