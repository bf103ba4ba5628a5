//! Per-request context and decision results.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header consulted for a request's queue priority.
pub const PRIORITY_HEADER: &str = "x-priority";
/// Metadata field consulted for a request's queue priority.
pub const PRIORITY_METADATA_KEY: &str = "priority";

/// Immutable snapshot of a protected operation.
///
/// Built once by the caller and only ever read by the engine. Header names
/// are stored lower-cased so lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtectionContext {
    method: String,
    path: String,
    source: Option<String>,
    user_agent: Option<String>,
    headers: HashMap<String, String>,
    metadata: HashMap<String, Value>,
}

impl ProtectionContext {
    /// Create a context for the given method and path.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the source address of the request.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the user agent of the request.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Add a request header.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        let name = name.as_ref().to_ascii_lowercase();
        if name == "user-agent" && self.user_agent.is_none() {
            let value = value.into();
            self.user_agent = Some(value.clone());
            self.headers.insert(name, value);
        } else {
            self.headers.insert(name, value.into());
        }
        self
    }

    /// Attach an arbitrary metadata value.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// Look up a header by name, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Priority carried by the request, from the priority header first and
    /// the `priority` metadata field second.
    pub fn priority(&self) -> Option<i64> {
        if let Some(value) = self.header(PRIORITY_HEADER) {
            if let Ok(priority) = value.trim().parse::<i64>() {
                return Some(priority);
            }
        }

        match self.metadata.get(PRIORITY_METADATA_KEY)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Default identity for counting: `source:path:method`.
    pub fn default_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.source.as_deref().unwrap_or("unknown"),
            self.path,
            self.method
        )
    }
}

/// Decision metadata returned on success and carried by rejections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    /// Start of the rate limit window the request was counted in, epoch millis
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_start: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_wait_time: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_requests: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_length: Option<usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl ResultMetadata {
    /// Fill in fields this metadata does not carry yet from `other`.
    ///
    /// Headers are unioned; existing entries win.
    pub fn merge(&mut self, other: ResultMetadata) {
        self.remaining = self.remaining.or(other.remaining);
        self.limit = self.limit.or(other.limit);
        self.reset_at = self.reset_at.or(other.reset_at);
        self.window_start = self.window_start.or(other.window_start);
        self.queue_wait_time = self.queue_wait_time.or(other.queue_wait_time);
        self.health_score = self.health_score.or(other.health_score);
        self.current_requests = self.current_requests.or(other.current_requests);
        self.queue_length = self.queue_length.or(other.queue_length);
        for (name, value) in other.headers {
            self.headers.entry(name).or_insert(value);
        }
    }
}

/// Outcome of a successful protection decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtectionResult {
    pub allowed: bool,
    pub metadata: ResultMetadata,
}

impl ProtectionResult {
    /// An allowed decision carrying the given metadata.
    pub fn allowed(metadata: ResultMetadata) -> Self {
        Self {
            allowed: true,
            metadata,
        }
    }

    /// An allowed decision with no metadata (bypass or fail-open).
    pub fn pass() -> Self {
        Self::allowed(ResultMetadata::default())
    }
}

/// How the protected operation ended, reported back after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

/// Convert epoch milliseconds to a UTC timestamp.
pub(crate) fn millis_to_datetime(millis: u64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(i64::try_from(millis).ok()?)
}
