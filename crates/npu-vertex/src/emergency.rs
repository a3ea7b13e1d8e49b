// SPDX-License-Identifier: AGPL-3.0-only

//! Device-wide fatal fault latch
//!
//! The fault detector latches the guard; a recovery procedure outside this
//! crate clears it. Vertex operations only read it.

use crate::error::{Result, VertexError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared emergency flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct EmergencyGuard {
    latched: Arc<AtomicBool>,
}

impl EmergencyGuard {
    /// Create an unlatched guard
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the fault (fault-detection side)
    pub fn latch(&self) {
        if !self.latched.swap(true, Ordering::AcqRel) {
            tracing::error!("NPU emergency fault latched");
        }
    }

    /// Clear the fault (recovery side)
    pub fn clear(&self) {
        if self.latched.swap(false, Ordering::AcqRel) {
            tracing::info!("NPU emergency fault cleared");
        }
    }

    /// Whether a fault is latched
    #[must_use]
    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }

    /// Refuse with [`VertexError::EmergencyRestricted`] if latched.
    ///
    /// # Errors
    ///
    /// Returns `EmergencyRestricted` while the fault is latched.
    pub fn check(&self) -> Result<()> {
        if self.is_latched() {
            tracing::warn!("EMERGENCY ERROR STATE");
            return Err(VertexError::EmergencyRestricted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clear() {
        let guard = EmergencyGuard::new();
        assert!(!guard.is_latched());
        assert!(guard.check().is_ok());
    }

    #[test]
    fn clones_share_the_flag() {
        let guard = EmergencyGuard::new();
        let detector = guard.clone();
        detector.latch();
        assert_eq!(guard.check(), Err(VertexError::EmergencyRestricted));
        detector.clear();
        assert!(guard.check().is_ok());
    }

    #[test]
    fn latch_is_idempotent() {
        let guard = EmergencyGuard::new();
        guard.latch();
        guard.latch();
        assert!(guard.is_latched());
    }
}
