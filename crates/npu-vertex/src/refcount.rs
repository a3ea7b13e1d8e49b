// SPDX-License-Identifier: AGPL-3.0-only

//! Reference-counted activation domains
//!
//! An [`ActivationDomain`] guards a shared resource behind a counter: the
//! first acquire activates it and the last release deactivates it. The vertex
//! owns three of them (open, boot and start).
//!
//! The counter is atomic but the hooks run outside of it. Callers serialize
//! acquire/release pairs with their own lock when the hooks are not
//! reentrant, and compensate a failed activation by releasing.

use crate::error::Result;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Activation or deactivation side effect
pub type Hook = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// Counted gate with first-acquire / last-release hooks
pub struct ActivationDomain {
    name: &'static str,
    count: AtomicUsize,
    on_first: Hook,
    on_last: Hook,
}

impl ActivationDomain {
    /// Create a domain with its activation pair
    pub fn new<F, L>(name: &'static str, on_first: F, on_last: L) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
        L: Fn() -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name,
            count: AtomicUsize::new(0),
            on_first: Box::new(on_first),
            on_last: Box::new(on_last),
        }
    }

    /// Domain name used in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Take a reference, activating on the 0 → 1 transition.
    ///
    /// The count stays incremented even when `on_first` fails.
    ///
    /// # Errors
    ///
    /// Returns whatever `on_first` returned.
    pub fn acquire(&self) -> Result<()> {
        if self.count.fetch_add(1, Ordering::AcqRel) == 0 {
            tracing::debug!("{}: first reference, activating", self.name);
            (self.on_first)()
        } else {
            Ok(())
        }
    }

    /// Drop a reference, deactivating on the 1 → 0 transition.
    ///
    /// # Errors
    ///
    /// Returns whatever `on_last` returned.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero.
    pub fn release(&self) -> Result<()> {
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .unwrap_or_else(|_| panic!("{}: reference count underflow", self.name));

        if previous == 1 {
            tracing::debug!("{}: last reference, deactivating", self.name);
            (self.on_last)()
        } else {
            Ok(())
        }
    }

    /// Current reference count
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Force the count back to zero without running any hook.
    pub(crate) fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }
}

impl fmt::Debug for ActivationDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationDomain")
            .field("name", &self.name)
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VertexError;
    use std::sync::Arc;

    fn counted() -> (ActivationDomain, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let firsts = Arc::new(AtomicUsize::new(0));
        let lasts = Arc::new(AtomicUsize::new(0));
        let (f, l) = (Arc::clone(&firsts), Arc::clone(&lasts));
        let domain = ActivationDomain::new(
            "test",
            move || {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            move || {
                l.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        (domain, firsts, lasts)
    }

    #[test]
    fn hooks_fire_once_per_full_cycle() {
        let (domain, firsts, lasts) = counted();

        for depth in 1..=5 {
            for _ in 0..depth {
                domain.acquire().unwrap();
            }
            assert_eq!(domain.count(), depth);
            for _ in 0..depth {
                domain.release().unwrap();
            }
            assert_eq!(domain.count(), 0);
        }

        assert_eq!(firsts.load(Ordering::SeqCst), 5);
        assert_eq!(lasts.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn interleaved_depth_does_not_refire() {
        let (domain, firsts, lasts) = counted();
        domain.acquire().unwrap();
        domain.acquire().unwrap();
        domain.release().unwrap();
        domain.acquire().unwrap();
        domain.release().unwrap();
        assert_eq!(firsts.load(Ordering::SeqCst), 1);
        assert_eq!(lasts.load(Ordering::SeqCst), 0);
        domain.release().unwrap();
        assert_eq!(lasts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_activation_leaves_count_for_caller_to_compensate() {
        let domain = ActivationDomain::new(
            "failing",
            || Err(VertexError::domain("bootup", "no power")),
            || Ok(()),
        );
        assert!(domain.acquire().is_err());
        assert_eq!(domain.count(), 1);
        domain.release().unwrap();
        assert_eq!(domain.count(), 0);
    }

    #[test]
    fn release_returns_on_last_result() {
        let domain = ActivationDomain::new(
            "stop",
            || Ok(()),
            || Err(VertexError::domain("stop", "timeout")),
        );
        domain.acquire().unwrap();
        domain.acquire().unwrap();
        assert!(domain.release().is_ok());
        assert!(domain.release().is_err());
    }

    #[test]
    #[should_panic(expected = "reference count underflow")]
    fn underflow_panics() {
        let (domain, _, _) = counted();
        let _ = domain.release();
    }

    #[test]
    fn reset_skips_hooks() {
        let (domain, _, lasts) = counted();
        domain.acquire().unwrap();
        domain.reset();
        assert_eq!(domain.count(), 0);
        assert_eq!(lasts.load(Ordering::SeqCst), 0);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// `true` acquires; `false` releases when a reference is held.
            /// Hooks fire exactly on the 0 -> 1 and 1 -> 0 edges.
            #[test]
            fn hooks_track_zero_crossings(ops in proptest::collection::vec(any::<bool>(), 0..200)) {
                let (domain, firsts, lasts) = counted();
                let (mut held, mut rises, mut falls) = (0usize, 0usize, 0usize);

                for acquire in ops {
                    if acquire {
                        rises += usize::from(held == 0);
                        held += 1;
                        prop_assert!(domain.acquire().is_ok());
                    } else if held > 0 {
                        held -= 1;
                        falls += usize::from(held == 0);
                        prop_assert!(domain.release().is_ok());
                    }
                    prop_assert_eq!(domain.count(), held);
                }

                prop_assert_eq!(firsts.load(Ordering::SeqCst), rises);
                prop_assert_eq!(lasts.load(Ordering::SeqCst), falls);

                while held > 0 {
                    held -= 1;
                    prop_assert!(domain.release().is_ok());
                }
                prop_assert_eq!(domain.count(), 0);
                prop_assert_eq!(firsts.load(Ordering::SeqCst), lasts.load(Ordering::SeqCst));
            }
        }
    }
}
