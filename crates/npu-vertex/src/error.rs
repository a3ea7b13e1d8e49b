// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for vertex session operations

use crate::state::StateSet;
use thiserror::Error;

/// Result type alias for vertex operations
pub type Result<T> = std::result::Result<T, VertexError>;

/// Errors that can occur during vertex and session operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VertexError {
    /// Operation attempted without the state bits it requires
    #[error("{op}: invalid state {state}")]
    InvalidState {
        /// Operation that was refused
        op: &'static str,
        /// Session state at the time of the call
        state: StateSet,
    },

    /// Request is malformed for this device or session
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Reason for rejection
        reason: String,
    },

    /// Device-wide fatal fault is latched
    #[error("Device in emergency state, access restricted")]
    EmergencyRestricted,

    /// Operation could not complete now; the caller may retry later
    #[error("{op}: would block")]
    WouldBlock {
        /// Operation that would have blocked
        op: &'static str,
    },

    /// Wait was cancelled before the operation could proceed
    #[error("{op}: interrupted while waiting")]
    Interrupted {
        /// Operation that was waiting
        op: &'static str,
    },

    /// Failure reported by the queue, session or hardware layer
    #[error("{op} failed: {reason}")]
    Domain {
        /// Operation that failed
        op: &'static str,
        /// Reason for failure
        reason: String,
    },
}

/// Errno values returned through a character-device surface.
mod errno {
    pub const EIO: i32 = 5;
    pub const EAGAIN: i32 = 11;
    pub const EINTR: i32 = 4;
    pub const EINVAL: i32 = 22;
    pub const ELIBACC: i32 = 79;
}

impl VertexError {
    /// Create an invalid state error
    pub const fn invalid_state(op: &'static str, state: StateSet) -> Self {
        Self::InvalidState { op, state }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a would-block error
    pub const fn would_block(op: &'static str) -> Self {
        Self::WouldBlock { op }
    }

    /// Create an interrupted error
    pub const fn interrupted(op: &'static str) -> Self {
        Self::Interrupted { op }
    }

    /// Create a domain error
    pub fn domain(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Domain {
            op,
            reason: reason.into(),
        }
    }

    /// Whether this is the "nothing ready" / "retry later" signal
    #[must_use]
    pub const fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock { .. })
    }

    /// Negative errno equivalent of this error.
    ///
    /// `EWOULDBLOCK` and `EAGAIN` share a value on Linux.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        let code = match self {
            Self::InvalidState { .. } | Self::InvalidArgument { .. } => errno::EINVAL,
            Self::EmergencyRestricted => errno::ELIBACC,
            Self::WouldBlock { .. } => errno::EAGAIN,
            Self::Interrupted { .. } => errno::EINTR,
            Self::Domain { .. } => errno::EIO,
        };
        -code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VertexState;

    #[test]
    fn errno_codes_are_distinct_per_class() {
        let state = StateSet::from(VertexState::Open);
        assert_eq!(VertexError::invalid_state("streamon", state).errno(), -22);
        assert_eq!(VertexError::EmergencyRestricted.errno(), -79);
        assert_eq!(VertexError::would_block("dqbuf").errno(), -11);
        assert_eq!(VertexError::interrupted("open").errno(), -4);
        assert_eq!(VertexError::domain("load", "rejected").errno(), -5);
    }

    #[test]
    fn invalid_state_message_shows_bits() {
        let state = StateSet::from(VertexState::Open);
        let msg = VertexError::invalid_state("s_format", state).to_string();
        assert_eq!(msg, "s_format: invalid state 0x1");
    }
}
