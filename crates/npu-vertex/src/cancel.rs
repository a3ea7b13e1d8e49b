// SPDX-License-Identifier: AGPL-3.0-only

//! Cancellation tokens for interruptible waits

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    parents: Vec<CancelToken>,
}

/// Cloneable cancellation flag.
///
/// A caller passes its token into every blocking operation; cancelling it
/// plays the role of a pending signal. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Create a token that is not cancelled
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that is cancelled when either `self` or `other` is
    #[must_use]
    pub fn join(&self, other: &Self) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parents: vec![self.clone(), other.clone()],
            }),
        }
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Whether this token or any parent is cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
            || self.inner.parents.iter().any(Self::is_cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_cancellation() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
    }

    #[test]
    fn join_observes_either_parent() {
        let caller = CancelToken::new();
        let stream = CancelToken::new();
        let wait = caller.join(&stream);
        assert!(!wait.is_cancelled());
        stream.cancel();
        assert!(wait.is_cancelled());
        assert!(!caller.is_cancelled());
    }

    #[test]
    fn cancelling_joined_token_leaves_parents() {
        let a = CancelToken::new();
        let b = CancelToken::new();
        let j = a.join(&b);
        j.cancel();
        assert!(j.is_cancelled());
        assert!(!a.is_cancelled() && !b.is_cancelled());
    }
}
