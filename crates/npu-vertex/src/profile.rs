// SPDX-License-Identifier: AGPL-3.0-only

//! Per-session frame latency profiling
//!
//! While a profile level is set, each queued container is timestamped and the
//! matching dequeue records the queue → dequeue latency.

use crate::error::{Result, VertexError};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Summary returned by profile-off
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileReport {
    /// Frames measured
    pub frames: u64,
    /// Latency of the most recent frame
    pub last: Duration,
    /// Longest latency seen
    pub max: Duration,
    /// Mean latency
    pub mean: Duration,
    /// Frames queued and not yet dequeued
    pub pending: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Profiler {
    level: u32,
    prepared: bool,
    in_flight: HashMap<u32, Instant>,
    frames: u64,
    total: Duration,
    last: Duration,
    max: Duration,
}

impl Profiler {
    pub(crate) fn prepare(&mut self, level: u32) -> Result<()> {
        if level == 0 {
            return Err(VertexError::invalid_argument("profile level must be non-zero"));
        }
        *self = Self {
            level,
            prepared: true,
            ..Self::default()
        };
        Ok(())
    }

    pub(crate) fn unprepare(&mut self) -> Result<()> {
        if !self.prepared {
            return Err(VertexError::domain("profile_unprepare", "profiler not prepared"));
        }
        self.prepared = false;
        self.level = 0;
        self.in_flight.clear();
        Ok(())
    }

    pub(crate) const fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub(crate) fn is_active(&self) -> bool {
        self.prepared && self.level > 0
    }

    pub(crate) fn frame_queued(&mut self, id: u32) {
        if self.is_active() {
            self.in_flight.insert(id, Instant::now());
        }
    }

    pub(crate) fn frame_done(&mut self, id: u32) {
        if let Some(start) = self.in_flight.remove(&id) {
            let elapsed = start.elapsed();
            self.frames += 1;
            self.total += elapsed;
            self.last = elapsed;
            self.max = self.max.max(elapsed);
        }
    }

    /// Forget frames the queue dropped when streaming stopped
    pub(crate) fn discard_in_flight(&mut self) {
        self.in_flight.clear();
    }

    pub(crate) fn report(&self) -> ProfileReport {
        let mean = u32::try_from(self.frames)
            .ok()
            .and_then(|n| self.total.checked_div(n))
            .unwrap_or_default();
        ProfileReport {
            frames: self.frames,
            last: self.last,
            max: self.max,
            mean,
            pending: self.in_flight.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_profiler_ignores_frames() {
        let mut p = Profiler::default();
        p.frame_queued(1);
        p.frame_done(1);
        assert_eq!(p.report().frames, 0);
    }

    #[test]
    fn measures_queue_to_dequeue() {
        let mut p = Profiler::default();
        p.prepare(1).unwrap();
        p.frame_queued(7);
        std::thread::sleep(Duration::from_millis(2));
        p.frame_done(7);
        let r = p.report();
        assert_eq!(r.frames, 1);
        assert!(r.last >= Duration::from_millis(2));
        assert_eq!(r.max, r.last);
        assert_eq!(r.mean, r.last);
    }

    #[test]
    fn unprepare_requires_prepare() {
        let mut p = Profiler::default();
        assert!(p.unprepare().is_err());
        p.prepare(2).unwrap();
        assert!(p.unprepare().is_ok());
        assert!(!p.is_active());
    }

    #[test]
    fn discarded_frames_are_not_measured() {
        let mut p = Profiler::default();
        p.prepare(1).unwrap();
        p.frame_queued(1);
        p.frame_queued(2);
        assert_eq!(p.report().pending, 2);

        p.discard_in_flight();
        p.frame_done(1);
        let r = p.report();
        assert_eq!((r.frames, r.pending), (0, 0));
    }

    #[test]
    fn zero_level_rejected() {
        let mut p = Profiler::default();
        assert!(p.prepare(0).is_err());
    }
}
