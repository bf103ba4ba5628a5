//! Warden - Request Protection Engine
//!
//! This crate decides whether a unit of work may proceed. It combines a
//! fixed-window rate limiter and a sliding throttle, both counting through a
//! pluggable storage adapter, with in-process circuit breakers and an
//! admission controller that queues and sheds work under overload.

pub mod breaker;
pub mod callback;
pub mod clock;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod overload;
pub mod ratelimit;
pub mod storage;
pub mod throttle;

pub use breaker::{BreakerConfig, BreakerStats, CircuitBreakerManager, CircuitState};
pub use config::{EngineConfig, GuardKind};
pub use context::{Outcome, ProtectionContext, ProtectionResult, ResultMetadata};
pub use engine::{ProtectionEngine, ProtectionEngineBuilder};
pub use error::{CallError, OverloadReason, ProtectionError, Result, WardenError};
pub use overload::{AdmissionController, OverloadConfig, ShedStrategy};
pub use ratelimit::{RateLimitOptions, RateLimiter};
pub use storage::{InMemoryStorage, StorageAdapter};
pub use throttle::{Throttle, ThrottleOptions};
