//! Fixed-window rate limiting over the storage adapter.

mod key;
mod limiter;
mod options;

pub use key::{block_key, WindowKey};
pub use limiter::{BlockRecord, RateLimitStatus, RateLimiter};
pub use options::RateLimitOptions;

pub(crate) use limiter::retry_after_from;
