//! Error types for the Warden engine.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::breaker::{BreakerStats, CircuitState};
use crate::context::ResultMetadata;
use crate::storage::StorageError;

/// Main error type for infrastructure operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage adapter errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Warden infrastructure operations.
pub type Result<T> = std::result::Result<T, WardenError>;

/// Why the admission controller turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverloadReason {
    /// No concurrency slot and no room left in the queue.
    QueueFull,
    /// The request waited in the queue longer than its timeout.
    TimeoutInQueue,
    /// The queue was force-cleared while the request was waiting.
    Cleared,
    /// A custom shedding function dropped the request from the queue.
    Shed,
}

impl fmt::Display for OverloadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            OverloadReason::QueueFull => "queue is full",
            OverloadReason::TimeoutInQueue => "timeout in queue",
            OverloadReason::Cleared => "queue cleared",
            OverloadReason::Shed => "request shed from queue",
        };
        f.write_str(reason)
    }
}

/// A protection decision that rejected the operation.
///
/// These always propagate to the caller unchanged; the engine never
/// swallows a rejection.
#[derive(Error, Debug, Clone)]
pub enum ProtectionError {
    /// The fixed-window rate limit was exceeded or the key is blocked.
    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after: Duration,
        metadata: ResultMetadata,
    },

    /// The sliding throttle window was exceeded.
    #[error("Throttled: {message}")]
    Throttled {
        message: String,
        retry_after: Duration,
        metadata: ResultMetadata,
    },

    /// The circuit breaker rejected the call without running it.
    #[error("Circuit breaker '{key}' is {state}")]
    CircuitOpen {
        key: String,
        state: CircuitState,
        stats: BreakerStats,
    },

    /// The wrapped call exceeded the breaker's timeout.
    #[error("Circuit breaker '{key}' call timed out after {timeout:?}")]
    CircuitTimeout {
        key: String,
        timeout: Duration,
        stats: BreakerStats,
    },

    /// The admission controller could not serve the request.
    #[error("Service overloaded: {reason}")]
    Overloaded {
        reason: OverloadReason,
        metadata: ResultMetadata,
    },
}

impl ProtectionError {
    /// Retry hint for the caller, where one applies.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProtectionError::RateLimited { retry_after, .. }
            | ProtectionError::Throttled { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Decision metadata carried by the rejection, if any.
    pub fn metadata(&self) -> Option<&ResultMetadata> {
        match self {
            ProtectionError::RateLimited { metadata, .. }
            | ProtectionError::Throttled { metadata, .. }
            | ProtectionError::Overloaded { metadata, .. } => Some(metadata),
            _ => None,
        }
    }

    /// Breaker statistics carried by the rejection, if any.
    pub fn breaker_stats(&self) -> Option<&BreakerStats> {
        match self {
            ProtectionError::CircuitOpen { stats, .. }
            | ProtectionError::CircuitTimeout { stats, .. } => Some(stats),
            _ => None,
        }
    }

    /// The overload reason, if this is an admission rejection.
    pub fn overload_reason(&self) -> Option<OverloadReason> {
        match self {
            ProtectionError::Overloaded { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Whether a retry later may succeed. Everything except a force-cleared
    /// queue is transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProtectionError::Overloaded {
                reason: OverloadReason::Cleared,
                ..
            }
        )
    }
}

/// Error from a call wrapped by the engine.
#[derive(Error, Debug)]
pub enum CallError<E> {
    /// A protection component rejected the call.
    #[error(transparent)]
    Protection(#[from] ProtectionError),

    /// The wrapped operation itself failed.
    #[error("{0}")]
    Handler(E),
}

impl<E> CallError<E> {
    /// The rejection, if the call was turned away by a protection component.
    pub fn protection(&self) -> Option<&ProtectionError> {
        match self {
            CallError::Protection(err) => Some(err),
            CallError::Handler(_) => None,
        }
    }

    /// The wrapped operation's own error, if it ran and failed.
    pub fn into_handler(self) -> Option<E> {
        match self {
            CallError::Handler(err) => Some(err),
            CallError::Protection(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overload_reason_messages() {
        assert_eq!(OverloadReason::QueueFull.to_string(), "queue is full");
        assert_eq!(OverloadReason::TimeoutInQueue.to_string(), "timeout in queue");
        assert_eq!(OverloadReason::Cleared.to_string(), "queue cleared");
    }

    #[test]
    fn test_retry_after_only_for_window_rejections() {
        let limited = ProtectionError::RateLimited {
            message: "slow down".into(),
            retry_after: Duration::from_secs(12),
            metadata: ResultMetadata::default(),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(12)));
        assert!(limited.metadata().is_some());

        let overloaded = ProtectionError::Overloaded {
            reason: OverloadReason::QueueFull,
            metadata: ResultMetadata::default(),
        };
        assert_eq!(overloaded.retry_after(), None);
        assert_eq!(overloaded.overload_reason(), Some(OverloadReason::QueueFull));
        assert!(overloaded.is_retryable());
        assert_eq!(overloaded.to_string(), "Service overloaded: queue is full");
    }

    #[test]
    fn test_cleared_queue_is_not_retryable() {
        let cleared = ProtectionError::Overloaded {
            reason: OverloadReason::Cleared,
            metadata: ResultMetadata::default(),
        };
        assert!(!cleared.is_retryable());
    }
}
