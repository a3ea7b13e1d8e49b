// SPDX-License-Identifier: AGPL-3.0-only

//! Device and session service abstraction
//!
//! The vertex never touches hardware itself. Device-level activation, hardware
//! bootup and the per-session network commands sit behind these traits; the
//! software backend implements them for CI and the CLI.

use crate::error::Result;
use crate::queue::NpuQueue;
use bytes::Bytes;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Bitmask of accelerator sub-devices a session claims at bootup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HwIds(u32);

impl HwIds {
    /// No sub-device
    pub const NONE: Self = Self(0);
    /// Neural core
    pub const NPU: Self = Self(0x1);
    /// DSP core
    pub const DSP: Self = Self(0x2);

    /// From a raw mask
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw mask
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Whether no sub-device is claimed
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for HwIds {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for HwIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// Network graph submitted with set-graph
#[derive(Debug, Clone)]
pub struct GraphDesc {
    /// Caller-chosen graph id
    pub id: u32,
    /// Compiled network (Bytes enables zero-copy cloning for large models)
    pub model: Bytes,
    /// Input feature maps the graph expects
    pub input_count: u32,
    /// Output feature maps the graph produces
    pub output_count: u32,
}

/// Feature-map counts accepted by the session service for a graph
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphInfo {
    /// Input feature maps
    pub ifm_count: u32,
    /// Output feature maps
    pub ofm_count: u32,
}

/// One set-param entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    /// Parameter target id
    pub target: u32,
    /// Parameter value
    pub value: u64,
}

/// Scheduling parameters for a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedParam {
    /// Priority (lower is more urgent)
    pub priority: u32,
    /// Core binding hint
    pub bound_core: u32,
    /// Maximum NPU cores the session may use
    pub max_npu_core: u32,
}

/// Version report for query-version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Driver (this crate) version
    pub driver: &'static str,
    /// Hardware revision
    pub hardware: String,
    /// Firmware version, only reported once a graph is set
    pub firmware: Option<String>,
}

/// Device-level services behind the vertex.
///
/// The three activation pairs (`open`/`close`, `bootup`/`shutdown`,
/// `start`/`stop`) are only ever invoked from the first/last transition of
/// the matching activation domain.
pub trait NpuDevice: Debug + Send + Sync {
    /// Activate the device for its first opener
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be brought up.
    fn open(&self) -> Result<()>;

    /// Deactivate the device after its last closer
    ///
    /// # Errors
    ///
    /// Returns error if teardown fails.
    fn close(&self) -> Result<()>;

    /// Power up the shared boot domain
    ///
    /// # Errors
    ///
    /// Returns error if firmware boot fails.
    fn bootup(&self) -> Result<()>;

    /// Power down the shared boot domain
    ///
    /// # Errors
    ///
    /// Returns error if shutdown fails.
    fn shutdown(&self) -> Result<()>;

    /// Start shared streaming resources
    ///
    /// # Errors
    ///
    /// Returns error if streaming cannot start.
    fn start(&self) -> Result<()>;

    /// Stop shared streaming resources
    ///
    /// # Errors
    ///
    /// Returns error if streaming cannot stop.
    fn stop(&self) -> Result<()>;

    /// Tear the device down after a fault latched mid-activation
    fn recovery_close(&self);

    /// Boot the given sub-devices (refcounted per sub-device by the hardware layer)
    ///
    /// # Errors
    ///
    /// Returns error if any sub-device fails to boot.
    fn hw_bootup(&self, ids: HwIds) -> Result<()>;

    /// Shut down the given sub-devices
    ///
    /// # Errors
    ///
    /// Returns error if any sub-device fails to shut down.
    fn hw_shutdown(&self, ids: HwIds) -> Result<()>;

    /// Register a newly opened handle with the session manager
    ///
    /// # Errors
    ///
    /// Returns error if the session manager has no free slot.
    fn open_session(&self, id: u32) -> Result<Box<dyn SessionOps>>;

    /// Create the buffer queue for a session
    ///
    /// # Errors
    ///
    /// Returns error if queue memory cannot be set up.
    fn open_queue(&self, id: u32) -> Result<Arc<dyn NpuQueue>>;

    /// Hardware revision string
    fn hw_version(&self) -> String;

    /// Loaded firmware version, if known
    fn fw_version(&self) -> Option<String>;
}

/// Per-session network command channel.
///
/// Called with the session lock held.
pub trait SessionOps: Debug + Send {
    /// Accept a graph and report its feature-map counts
    ///
    /// # Errors
    ///
    /// Returns error if the graph is rejected.
    fn s_graph(&mut self, graph: &GraphDesc) -> Result<GraphInfo>;

    /// Load the network on the device
    ///
    /// # Errors
    ///
    /// Returns error if the load command or its result reports failure.
    fn load(&mut self) -> Result<()>;

    /// Unload the network
    ///
    /// # Errors
    ///
    /// Returns error if the unload command fails.
    fn unload(&mut self) -> Result<()>;

    /// Stream-on command
    ///
    /// # Errors
    ///
    /// Returns error if the command or its result reports failure.
    fn stream_on(&mut self) -> Result<()>;

    /// Stream-off command
    ///
    /// # Errors
    ///
    /// Returns error if the command or its result reports failure.
    fn stream_off(&mut self) -> Result<()>;

    /// Tell the firmware this session is powered (`true`) or released (`false`)
    ///
    /// # Errors
    ///
    /// Returns error if the notification is rejected.
    fn power_notify(&mut self, on: bool) -> Result<()>;

    /// Register with the session manager's hardware list
    fn register_hw(&mut self);

    /// Unregister from the session manager's hardware list
    fn unregister_hw(&mut self);

    /// Apply parameters
    ///
    /// # Errors
    ///
    /// Returns error if a parameter is rejected.
    fn s_param(&mut self, params: &[Param]) -> Result<()>;

    /// Apply scheduling parameters
    ///
    /// # Errors
    ///
    /// Returns error if the parameters are rejected.
    fn sched_param(&mut self, param: &SchedParam) -> Result<()>;

    /// Drop pending work after abnormal termination
    ///
    /// # Errors
    ///
    /// Returns error if pending work cannot be flushed.
    fn flush(&mut self) -> Result<()>;

    /// Release the session
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be released.
    fn close(&mut self) -> Result<()>;

    /// Undo a half-finished open
    fn undo_open(&mut self);
}
