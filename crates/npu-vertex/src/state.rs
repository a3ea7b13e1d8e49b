// SPDX-License-Identifier: AGPL-3.0-only

//! Session state bits
//!
//! A session's state is a set of bits that accumulate as configuration
//! progresses, not a single current state: a streaming session still satisfies
//! the GRAPH and FORMAT preconditions. Only the STREAMON → STREAMOFF transition
//! and failure rollbacks clear bits.

use std::fmt;

/// One bit of session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexState {
    /// Handle opened, session allocated
    Open,
    /// Hardware booted and power-notified for this session
    Power,
    /// Network graph accepted
    Graph,
    /// Output format set and network loaded
    Format,
    /// Streaming
    StreamOn,
    /// Streaming stopped
    StreamOff,
    /// Teardown complete
    Close,
}

impl VertexState {
    /// Unwind priority, lowest first. CLOSE never participates.
    const PRIORITY: [Self; 6] = [
        Self::Open,
        Self::Power,
        Self::Graph,
        Self::Format,
        Self::StreamOn,
        Self::StreamOff,
    ];

    /// Bit mask for this state
    #[must_use]
    pub const fn bit(self) -> u32 {
        1 << self as u32
    }
}

impl fmt::Display for VertexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "OPEN",
            Self::Power => "POWER",
            Self::Graph => "GRAPH",
            Self::Format => "FORMAT",
            Self::StreamOn => "STREAMON",
            Self::StreamOff => "STREAMOFF",
            Self::Close => "CLOSE",
        };
        f.write_str(name)
    }
}

/// Cumulative set of [`VertexState`] bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StateSet(u32);

impl StateSet {
    /// No bits set
    pub const EMPTY: Self = Self(0);

    /// Raw bit mask
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether `state` is set
    #[must_use]
    pub const fn contains(self, state: VertexState) -> bool {
        self.0 & state.bit() != 0
    }

    /// Whether at least one of `states` is set
    #[must_use]
    pub fn contains_any(self, states: &[VertexState]) -> bool {
        states.iter().any(|s| self.contains(*s))
    }

    /// Whether every one of `states` is set
    #[must_use]
    pub fn contains_all(self, states: &[VertexState]) -> bool {
        states.iter().all(|s| self.contains(*s))
    }

    /// Set `state`
    pub fn insert(&mut self, state: VertexState) {
        self.0 |= state.bit();
    }

    /// Clear `state`
    pub fn remove(&mut self, state: VertexState) {
        self.0 &= !state.bit();
    }

    /// Highest-priority bit reached, which selects the teardown path.
    ///
    /// Bits are checked from OPEN up to STREAMOFF and the last match wins, so
    /// STREAMOFF outranks STREAMON even when both are set.
    #[must_use]
    pub fn done_state(self) -> Option<VertexState> {
        VertexState::PRIORITY
            .iter()
            .copied()
            .filter(|s| self.contains(*s))
            .last()
    }
}

impl From<VertexState> for StateSet {
    fn from(state: VertexState) -> Self {
        Self(state.bit())
    }
}

impl FromIterator<VertexState> for StateSet {
    fn from_iter<I: IntoIterator<Item = VertexState>>(iter: I) -> Self {
        let mut set = Self::EMPTY;
        for state in iter {
            set.insert(state);
        }
        set
    }
}

impl fmt::Display for StateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use VertexState::*;

    fn set(states: &[VertexState]) -> StateSet {
        states.iter().copied().collect()
    }

    #[test]
    fn bits_follow_declaration_order() {
        assert_eq!(Open.bit(), 0x01);
        assert_eq!(Power.bit(), 0x02);
        assert_eq!(Graph.bit(), 0x04);
        assert_eq!(Format.bit(), 0x08);
        assert_eq!(StreamOn.bit(), 0x10);
        assert_eq!(StreamOff.bit(), 0x20);
        assert_eq!(Close.bit(), 0x40);
    }

    #[test]
    fn done_state_of_empty_is_none() {
        assert_eq!(StateSet::EMPTY.done_state(), None);
        assert_eq!(set(&[Close]).done_state(), None);
    }

    #[test]
    fn done_state_takes_last_match() {
        assert_eq!(set(&[Open]).done_state(), Some(Open));
        assert_eq!(set(&[Open, Power]).done_state(), Some(Power));
        assert_eq!(set(&[Open, Power, Graph]).done_state(), Some(Graph));
        assert_eq!(set(&[Open, Graph, Format]).done_state(), Some(Format));
        assert_eq!(set(&[Open, Graph, Format, StreamOn]).done_state(), Some(StreamOn));
    }

    #[test]
    fn streamoff_outranks_streamon() {
        let both = set(&[Open, Graph, Format, StreamOn, StreamOff]);
        assert_eq!(both.done_state(), Some(StreamOff));
    }

    #[test]
    fn power_alone_without_open_is_power() {
        assert_eq!(set(&[Power]).done_state(), Some(Power));
    }

    #[test]
    fn insert_and_remove() {
        let mut s = StateSet::from(Open);
        s.insert(StreamOn);
        assert!(s.contains_all(&[Open, StreamOn]));
        s.remove(StreamOn);
        assert!(!s.contains(StreamOn));
        assert!(s.contains_any(&[Graph, Open]));
        assert_eq!(s.to_string(), "0x1");
    }
}
