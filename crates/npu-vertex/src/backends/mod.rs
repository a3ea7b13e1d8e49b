// SPDX-License-Identifier: AGPL-3.0-only

//! Device backends behind the vertex
//!
//! Only the software device ships here. Hardware backends implement
//! [`NpuDevice`](crate::NpuDevice), [`NpuQueue`](crate::NpuQueue) and
//! [`Scheduler`](crate::Scheduler) in their own crates.

pub mod software;

pub use software::{
    FaultAction, FaultPoint, SchedulerStats, SoftwareDevice, SoftwareQueue, SoftwareRig,
    SoftwareScheduler, SoftwareSession, StatsSnapshot,
};
