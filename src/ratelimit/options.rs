//! Rate limiter options.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::callback::{KeyGenerator, ResponseMessage};
use crate::context::ProtectionContext;

/// Default number of requests allowed per window.
const DEFAULT_POINTS: u64 = 100;
/// Default window length.
const DEFAULT_DURATION_SECS: u64 = 60;
/// Default storage namespace.
const DEFAULT_NAMESPACE: &str = "rate_limit";
/// Message used when no custom response message is configured.
pub(crate) const DEFAULT_MESSAGE: &str = "Too many requests, please try again later";

/// Configuration for a fixed-window rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitOptions {
    /// Requests allowed per window
    #[serde(default = "default_points")]
    pub points: u64,

    /// Window length in seconds
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,

    /// When set, exceeding the limit also blocks the key for this long
    #[serde(default)]
    pub block_duration_secs: Option<u64>,

    /// Prefix for every storage key written by this limiter
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Give the point back when the protected operation succeeds
    #[serde(default)]
    pub skip_successful_requests: bool,

    /// Give the point back when the protected operation fails
    #[serde(default)]
    pub skip_failed_requests: bool,

    /// Extra headers merged into every decision's metadata
    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,

    #[serde(skip)]
    pub key_generator: Option<KeyGenerator>,

    #[serde(skip)]
    pub custom_response_message: Option<ResponseMessage>,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            points: DEFAULT_POINTS,
            duration_secs: DEFAULT_DURATION_SECS,
            block_duration_secs: None,
            namespace: default_namespace(),
            skip_successful_requests: false,
            skip_failed_requests: false,
            custom_headers: BTreeMap::new(),
            key_generator: None,
            custom_response_message: None,
        }
    }
}

fn default_points() -> u64 {
    DEFAULT_POINTS
}

fn default_duration_secs() -> u64 {
    DEFAULT_DURATION_SECS
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl RateLimitOptions {
    /// Options allowing `points` requests every `duration_secs` seconds.
    pub fn new(points: u64, duration_secs: u64) -> Self {
        Self {
            points,
            duration_secs,
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_block_duration(mut self, secs: u64) -> Self {
        self.block_duration_secs = Some(secs);
        self
    }

    pub fn with_key_generator(
        mut self,
        f: impl Fn(&ProtectionContext) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_generator = Some(KeyGenerator::new(f));
        self
    }

    pub fn with_response_message(
        mut self,
        f: impl Fn(&ProtectionContext) -> String + Send + Sync + 'static,
    ) -> Self {
        self.custom_response_message = Some(ResponseMessage::new(f));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    pub fn skip_successful(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    pub fn skip_failed(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn block_duration(&self) -> Option<Duration> {
        self.block_duration_secs.map(Duration::from_secs)
    }

    /// Counting identity for the request.
    pub fn key_for(&self, context: &ProtectionContext) -> String {
        match &self.key_generator {
            Some(generator) => generator.call(context),
            None => context.default_key(),
        }
    }

    /// Message for a rejection of the request.
    pub fn message_for(&self, context: &ProtectionContext) -> String {
        match &self.custom_response_message {
            Some(message) => message.call(context),
            None => DEFAULT_MESSAGE.to_string(),
        }
    }

    /// Check the options for values that cannot work.
    pub fn validate(&self) -> Result<(), String> {
        if self.points == 0 {
            return Err("rate_limit.points must be greater than zero".into());
        }
        if self.duration_secs == 0 {
            return Err("rate_limit.duration_secs must be greater than zero".into());
        }
        if self.block_duration_secs == Some(0) {
            return Err("rate_limit.block_duration_secs must be greater than zero when set".into());
        }
        Ok(())
    }
}
