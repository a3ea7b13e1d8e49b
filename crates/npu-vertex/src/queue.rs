// SPDX-License-Identifier: AGPL-3.0-only

//! Buffer queue abstraction
//!
//! The queue owns buffer exchange with the hardware. It is shared between the
//! session lock holder and a blocking dequeuer that waits outside the session
//! lock, so implementations synchronize internally.

use crate::cancel::CancelToken;
use crate::error::Result;
use bytes::Bytes;
use std::fmt::{self, Debug};

/// Buffer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host → device (input feature maps)
    Input,
    /// Device → host (output feature maps)
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "IN"),
            Self::Output => write!(f, "OT"),
        }
    }
}

/// One feature-map format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Format {
    /// Feature-map target id
    pub target: u32,
    /// Pixel/element format code
    pub format: u32,
    /// Plane count
    pub plane: u32,
    /// Width in elements
    pub width: u32,
    /// Height in elements
    pub height: u32,
    /// Row stride in bytes
    pub stride: u32,
    /// Channel stride in bytes
    pub cstride: u32,
    /// Channel count
    pub channels: u32,
    /// Pixel format code
    pub pixel_format: u32,
}

/// Formats for one direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatList {
    /// Direction the formats apply to
    pub direction: Direction,
    /// One entry per feature map
    pub formats: Vec<Format>,
}

impl FormatList {
    /// Number of feature maps described
    #[must_use]
    pub fn count(&self) -> usize {
        self.formats.len()
    }
}

/// A set of buffers exchanged as one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Frame id
    pub id: u32,
    /// Slot index within the queue
    pub index: u32,
    /// Direction of the buffers
    pub direction: Direction,
    /// Buffer contents
    pub buffers: Vec<Bytes>,
}

/// Whether dequeue may sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueMode {
    /// Return `WouldBlock` immediately when nothing is ready
    NonBlocking,
    /// Sleep until a container is ready or the wait is cancelled
    Blocking,
}

/// Poll result for a session handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Handle cannot be polled in its current state
    Error,
    /// Nothing ready
    Pending,
    /// A completed container can be dequeued
    Readable,
}

/// Per-session buffer queue
pub trait NpuQueue: Debug + Send + Sync {
    /// Record the formats for one direction
    ///
    /// # Errors
    ///
    /// Returns error if the formats are unsupported.
    fn s_format(&self, formats: &FormatList) -> Result<()>;

    /// Begin accepting buffers
    ///
    /// # Errors
    ///
    /// Returns error if the queue has no formats or cannot start.
    fn start(&self) -> Result<()>;

    /// Stop accepting new buffers ahead of a stream-off command
    ///
    /// # Errors
    ///
    /// Returns error if in-flight work cannot be drained.
    fn streamoff(&self) -> Result<()>;

    /// Stop the queue; `forced` discards in-flight buffers
    ///
    /// # Errors
    ///
    /// Returns error if the queue cannot stop.
    fn stop(&self, forced: bool) -> Result<()>;

    /// Queue a container
    ///
    /// # Errors
    ///
    /// Returns error if the queue is not started or the container is invalid.
    fn qbuf(&self, container: Container) -> Result<()>;

    /// Dequeue a completed container for `direction`.
    ///
    /// A blocking wait ends with `Interrupted` once `cancel` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `WouldBlock` for an empty non-blocking dequeue, `Interrupted`
    /// for a cancelled wait, or a domain error.
    fn dqbuf(&self, direction: Direction, mode: DequeueMode, cancel: &CancelToken)
        -> Result<Container>;

    /// Map buffers ahead of use
    ///
    /// # Errors
    ///
    /// Returns error if the buffers cannot be mapped.
    fn prepare(&self, container: &Container) -> Result<()>;

    /// Unmap previously prepared buffers
    ///
    /// # Errors
    ///
    /// Returns error if the buffers were not prepared.
    fn unprepare(&self, container: &Container) -> Result<()>;

    /// Current readiness
    fn poll(&self) -> Readiness;
}
