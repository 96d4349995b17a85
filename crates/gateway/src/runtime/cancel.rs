//! Cooperative cancellation for in-flight Agent Loop invocations.
//!
//! Cancellation is checked at suspension points (a `text_delta`, a
//! `tool_call_complete`, a raw stream-chunk boundary) rather than delivered
//! as an OS-level interrupt. Setting a token never stops in-flight work by
//! itself; the loop has to look.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One active token per session. Starting a new invocation cancels and
/// replaces whatever token was registered for that session before it.
#[derive(Default)]
pub struct CancelMap {
    inner: RwLock<HashMap<String, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, session_id: &str) -> CancelToken {
        let mut guard = self.inner.write();
        if let Some(existing) = guard.get(session_id) {
            existing.cancel();
        }
        let token = CancelToken::new();
        guard.insert(session_id.to_string(), token.clone());
        token
    }

    pub fn cancel(&self, session_id: &str) {
        if let Some(token) = self.inner.read().get(session_id) {
            token.cancel();
        }
    }

    pub fn end(&self, session_id: &str) {
        self.inner.write().remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_cancels_any_prior_token_for_the_same_session() {
        let map = CancelMap::new();
        let first = map.begin("s1");
        assert!(!first.is_cancelled());
        let second = map.begin("s1");
        assert!(first.is_cancelled(), "starting a new invocation must cancel the old one");
        assert!(!second.is_cancelled());
    }

    #[test]
    fn begin_for_different_sessions_does_not_interfere() {
        let map = CancelMap::new();
        let a = map.begin("s1");
        let _b = map.begin("s2");
        assert!(!a.is_cancelled());
    }

    #[test]
    fn end_removes_the_token_so_cancel_is_a_no_op() {
        let map = CancelMap::new();
        let token = map.begin("s1");
        map.end("s1");
        map.cancel("s1");
        assert!(!token.is_cancelled());
    }
}
