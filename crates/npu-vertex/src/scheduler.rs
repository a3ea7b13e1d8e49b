// SPDX-License-Identifier: AGPL-3.0-only

//! Scheduler / DVFS hooks consulted at boost points

use crate::error::Result;
use std::fmt::Debug;
use std::time::Duration;

/// Maximum operating frequencies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrequencyInfo {
    /// NPU core maximum in kHz
    pub npu_khz: u32,
    /// DSP core maximum in kHz
    pub dsp_khz: u32,
}

/// Power/performance scheduler
pub trait Scheduler: Debug + Send + Sync {
    /// Raise clocks for a latency-sensitive control operation
    fn boost_on(&self);

    /// Drop the boost after `timeout` unless re-armed
    fn boost_off_timeout(&self, timeout: Duration);

    /// An OUTPUT container was queued by `session`
    fn qbuf_dvfs(&self, session: u32);

    /// An OUTPUT container was dequeued by `session`
    fn dqbuf_dvfs(&self, session: u32);

    /// Maximum frequencies the platform allows
    ///
    /// # Errors
    ///
    /// Returns error if the frequency table is unavailable.
    fn max_frequency(&self) -> Result<FrequencyInfo>;
}
