//! Storage key layout for window counters and block records.

/// Key identifying one fixed-window counter in storage.
///
/// Format: `{namespace}:{key}:{window_start}`, where `window_start` is epoch
/// milliseconds floored to the window boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// Namespace separating limiters that share one storage backend
    pub namespace: String,
    /// The request identity produced by the key generator
    pub key: String,
    /// Start of the window, epoch milliseconds
    pub window_start: u64,
}

impl WindowKey {
    /// Create the key for the window containing `now` (epoch millis).
    pub fn for_instant(namespace: &str, key: &str, now: u64, window_ms: u64) -> Self {
        let window_ms = window_ms.max(1);
        Self {
            namespace: namespace.to_string(),
            key: key.to_string(),
            window_start: (now / window_ms) * window_ms,
        }
    }

    /// Convert to the storage key string.
    pub fn to_storage_key(&self) -> String {
        format!("{}:{}:{}", self.namespace, self.key, self.window_start)
    }

    /// Parse from a storage key string.
    ///
    /// The window is split off from the right, so keys containing `:` survive.
    pub fn from_storage_key(raw: &str) -> Option<Self> {
        let last_sep = raw.rfind(':')?;
        let window_start: u64 = raw[last_sep + 1..].parse().ok()?;
        let before_window = &raw[..last_sep];
        let first_sep = before_window.find(':')?;

        Some(Self {
            namespace: before_window[..first_sep].to_string(),
            key: before_window[first_sep + 1..].to_string(),
            window_start,
        })
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_storage_key())
    }
}

/// Storage key of the block record for `key`.
pub fn block_key(namespace: &str, key: &str) -> String {
    format!("{}:block:{}", namespace, key)
}
