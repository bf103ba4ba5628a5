//! Caller-supplied hooks attached to component options.
//!
//! Hooks are not serializable; configuration files carry the plain values
//! and code attaches hooks through the options' builder methods.

use std::fmt;
use std::sync::Arc;

use crate::context::ProtectionContext;

/// A function evaluated against the request context.
pub struct ContextFn<T>(Arc<dyn Fn(&ProtectionContext) -> T + Send + Sync>);

impl<T> ContextFn<T> {
    pub fn new(f: impl Fn(&ProtectionContext) -> T + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, context: &ProtectionContext) -> T {
        (self.0)(context)
    }
}

impl<T> Clone for ContextFn<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> fmt::Debug for ContextFn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContextFn(..)")
    }
}

/// Derives the counting identity of a request.
pub type KeyGenerator = ContextFn<String>;

/// Builds the message carried by a rejection.
pub type ResponseMessage = ContextFn<String>;

/// Computes the queue priority of a request; higher is served first.
pub type PriorityFunction = ContextFn<i64>;
