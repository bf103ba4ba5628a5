//! Sliding first-request throttling over the storage adapter.

mod options;
mod throttler;

pub use options::{ThrottleOptions, UserAgentMatcher};
pub use throttler::{Throttle, ThrottleRecord};
