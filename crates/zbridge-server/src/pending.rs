//! Routing for `input_response` frames.
//!
//! A walker step (or any server-side operation) that needs an ad-hoc value
//! from the client registers a waiter keyed by the request token it sent
//! out. The matching `input_response` frame resolves the waiter; responses
//! with no waiter are dropped with a warning.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

/// Keyed set of one-shot waiters for client-supplied input values.
#[derive(Default)]
pub struct PendingInputs {
    waiters: DashMap<String, oneshot::Sender<Value>>,
}

impl PendingInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Correlation tokens are opaque JSON values; key waiters by their
    /// canonical serialization so `7` and `"7"` stay distinct.
    fn key(token: &Value) -> String {
        token.to_string()
    }

    /// Register a waiter for the given request token. A second registration
    /// under the same token replaces the first; the replaced waiter's
    /// receiver resolves with a channel-closed error.
    pub fn register(&self, token: &Value) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(Self::key(token), tx);
        rx
    }

    /// Resolve a waiter with the client's value. Returns `false` when no
    /// waiter was registered for the token (late or unsolicited response).
    pub fn resolve(&self, token: &Value, value: Value) -> bool {
        match self.waiters.remove(&Self::key(token)) {
            Some((_, tx)) => tx.send(value).is_ok(),
            None => {
                tracing::warn!(token = %token, "input_response with no pending waiter, dropping");
                false
            }
        }
    }

    /// Drop a waiter without resolving it.
    pub fn cancel(&self, token: &Value) {
        self.waiters.remove(&Self::key(token));
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
