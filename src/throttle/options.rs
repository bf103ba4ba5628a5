//! Throttle options.

use std::collections::BTreeMap;
use std::time::Duration;

use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::callback::{KeyGenerator, ResponseMessage};
use crate::context::ProtectionContext;

const DEFAULT_LIMIT: u64 = 10;
const DEFAULT_TTL_SECS: u64 = 60;
const DEFAULT_NAMESPACE: &str = "throttle";
const DEFAULT_MESSAGE: &str = "Too many requests";

/// Configuration for a sliding first-request throttle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleOptions {
    /// Requests allowed per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in seconds, measured from the first request
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Prefix for every storage key written by this throttle
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Regex patterns; a matching user agent bypasses throttling entirely
    #[serde(default)]
    pub ignore_user_agents: Vec<String>,

    /// Extra headers merged into every decision's metadata
    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,

    #[serde(skip)]
    pub key_generator: Option<KeyGenerator>,

    #[serde(skip)]
    pub custom_response_message: Option<ResponseMessage>,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            ttl_secs: DEFAULT_TTL_SECS,
            namespace: default_namespace(),
            ignore_user_agents: Vec::new(),
            custom_headers: BTreeMap::new(),
            key_generator: None,
            custom_response_message: None,
        }
    }
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_ttl_secs() -> u64 {
    DEFAULT_TTL_SECS
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl ThrottleOptions {
    /// Options allowing `limit` requests within `ttl_secs` of the first one.
    pub fn new(limit: u64, ttl_secs: u64) -> Self {
        Self {
            limit,
            ttl_secs,
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn ignore_user_agent(mut self, pattern: impl Into<String>) -> Self {
        self.ignore_user_agents.push(pattern.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), value.into());
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

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn key_for(&self, context: &ProtectionContext) -> String {
        match &self.key_generator {
            Some(generator) => generator.call(context),
            None => context.default_key(),
        }
    }

    pub fn message_for(&self, context: &ProtectionContext) -> String {
        match &self.custom_response_message {
            Some(message) => message.call(context),
            None => DEFAULT_MESSAGE.to_string(),
        }
    }

    /// Compile the ignored user-agent patterns.
    pub fn user_agent_matcher(&self) -> Result<UserAgentMatcher, regex::Error> {
        UserAgentMatcher::new(&self.ignore_user_agents)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.limit == 0 {
            return Err("throttle.limit must be greater than zero".into());
        }
        if self.ttl_secs == 0 {
            return Err("throttle.ttl_secs must be greater than zero".into());
        }
        self.user_agent_matcher()
            .map(|_| ())
            .map_err(|e| format!("throttle.ignore_user_agents: {}", e))
    }
}

/// Compiled set of user-agent patterns that bypass throttling.
#[derive(Debug, Clone)]
pub struct UserAgentMatcher {
    set: Option<RegexSet>,
}

impl UserAgentMatcher {
    pub fn new(patterns: &[String]) -> Result<Self, regex::Error> {
        if patterns.is_empty() {
            return Ok(Self::none());
        }
        Ok(Self {
            set: Some(RegexSet::new(patterns)?),
        })
    }

    /// Matcher that ignores no user agent.
    pub fn none() -> Self {
        Self { set: None }
    }

    /// Whether the request's user agent matches any pattern.
    pub fn is_ignored(&self, context: &ProtectionContext) -> bool {
        match (&self.set, context.user_agent()) {
            (Some(set), Some(agent)) => set.is_match(agent),
            _ => false,
        }
    }
}
