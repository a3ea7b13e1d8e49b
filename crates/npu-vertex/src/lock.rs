// SPDX-License-Identifier: AGPL-3.0-only

//! Interruptible blocking mutex
//!
//! Ownership is tracked by a `held` flag behind a small std mutex and condvar.
//! A contended waiter wakes every [`WAIT_TICK`] to look at the caller's
//! [`CancelToken`] and gives up with `Interrupted` once it is cancelled.
//! The uncontended path never looks at the token.

use crate::cancel::CancelToken;
use crate::error::{Result, VertexError};
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How often a blocked waiter re-checks its cancellation token
pub const WAIT_TICK: Duration = Duration::from_millis(5);

/// Mutex whose wait can be cancelled
#[derive(Debug, Default)]
pub struct InterruptibleMutex<T> {
    held: Mutex<bool>,
    released: Condvar,
    data: Mutex<T>,
}

/// RAII guard for [`InterruptibleMutex`]
#[derive(Debug)]
pub struct InterruptibleGuard<'a, T> {
    owner: &'a InterruptibleMutex<T>,
    data: MutexGuard<'a, T>,
}

impl<T> InterruptibleMutex<T> {
    /// Wrap `value`
    pub fn new(value: T) -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
            data: Mutex::new(value),
        }
    }

    /// Acquire, giving up if `cx` is cancelled while waiting.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted { op }` if the wait was cancelled.
    pub fn lock(&self, cx: &CancelToken, op: &'static str) -> Result<InterruptibleGuard<'_, T>> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while *held {
            if cx.is_cancelled() {
                tracing::error!("{op}: interrupted waiting for lock");
                return Err(VertexError::interrupted(op));
            }
            held = self
                .released
                .wait_timeout(held, WAIT_TICK)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *held = true;
        drop(held);
        Ok(self.enter())
    }

    /// Acquire without honouring cancellation
    pub fn lock_uninterruptible(&self) -> InterruptibleGuard<'_, T> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while *held {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *held = true;
        drop(held);
        self.enter()
    }

    fn enter(&self) -> InterruptibleGuard<'_, T> {
        InterruptibleGuard {
            owner: self,
            data: self.data.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn leave(&self) {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.released.notify_one();
    }
}

impl<T> Deref for InterruptibleGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for InterruptibleGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

impl<T> Drop for InterruptibleGuard<'_, T> {
    fn drop(&mut self) {
        // The next owner may block briefly on `data` until this guard's
        // field is dropped right after this body.
        self.owner.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn uncontended_lock_ignores_cancelled_token() {
        let m = InterruptibleMutex::new(1);
        let cx = CancelToken::new();
        cx.cancel();
        let mut g = m.lock(&cx, "test").unwrap();
        *g += 1;
        drop(g);
        assert_eq!(*m.lock_uninterruptible(), 2);
    }

    #[test]
    fn contended_wait_is_interrupted() {
        let m = Arc::new(InterruptibleMutex::new(()));
        let held = m.lock_uninterruptible();

        let cx = CancelToken::new();
        let waiter = {
            let m = Arc::clone(&m);
            let cx = cx.clone();
            thread::spawn(move || {
                let result = m.lock(&cx, "s_graph").map(drop);
                result
            })
        };

        thread::sleep(Duration::from_millis(20));
        cx.cancel();
        let result = waiter.join().unwrap();
        assert_eq!(result, Err(VertexError::interrupted("s_graph")));
        drop(held);
    }

    #[test]
    fn waiter_proceeds_after_release() {
        let m = Arc::new(InterruptibleMutex::new(0u32));
        let held = m.lock_uninterruptible();
        let start = Instant::now();

        let waiter = {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                let mut g = m.lock(&CancelToken::new(), "qbuf").unwrap();
                *g += 1;
            })
        };

        thread::sleep(Duration::from_millis(10));
        drop(held);
        waiter.join().unwrap();
        assert_eq!(*m.lock_uninterruptible(), 1);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn many_threads_serialize() {
        let m = Arc::new(InterruptibleMutex::new(0u64));
        thread::scope(|s| {
            for _ in 0..8 {
                let m = Arc::clone(&m);
                s.spawn(move || {
                    let cx = CancelToken::new();
                    for _ in 0..100 {
                        *m.lock(&cx, "inc").unwrap() += 1;
                    }
                });
            }
        });
        assert_eq!(*m.lock_uninterruptible(), 800);
    }
}
