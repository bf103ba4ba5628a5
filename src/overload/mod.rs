//! Overload protection: concurrency limits, a shedding queue and an
//! adaptive, health-scaled threshold.

mod config;
mod controller;
mod health;
mod queue;

pub use config::{
    AdaptiveConfig, HealthIndicator, OverloadConfig, ShedFunction, ShedStrategy, DEFAULT_PRIORITY,
};
pub use controller::{AdmissionController, AdmissionPermit, AdmissionStatus};
pub use queue::QueuedRequest;
