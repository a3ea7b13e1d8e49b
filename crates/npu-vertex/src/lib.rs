//! Session and vertex control core for an NPU character device.
//!
//! This crate owns the part of an NPU driver that sits between client handles
//! and the hardware layer: per-session state tracking, the device-shared
//! activation domains, emergency-fault gating, and the close/flush unwind.
//! Hardware access stays behind the [`NpuDevice`], [`SessionOps`],
//! [`NpuQueue`] and [`Scheduler`] traits.
//!
//! # Layering
//!
//! ```text
//! Vertex        - one per device: open / close / bootup, device lock,
//!                 open_cnt / boot_cnt / start_cnt activation domains
//!   Session     - one per handle: graph, format, streaming, buffers,
//!                 per-session lock, cumulative state bits
//!     lifecycle - best-effort close / flush unwind by done state
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use npu_vertex::prelude::*;
//!
//! # fn main() -> npu_vertex::Result<()> {
//! let rig = SoftwareRig::new(VertexConfig::from_env());
//! let cx = CancelToken::new();
//!
//! let session = rig.vertex.open(&cx)?;
//! rig.vertex.bootup(&session, HwIds::NPU, &cx)?;
//! println!("state {}, counts {:?}", session.state(), rig.vertex.counts());
//! rig.vertex.close(&session, &cx)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Result codes
//!
//! | Error | errno |
//! |-------|-------|
//! | `InvalidState`, `InvalidArgument` | `-EINVAL` |
//! | `EmergencyRestricted` | `-ELIBACC` |
//! | `WouldBlock` | `-EWOULDBLOCK` |
//! | `Interrupted` | `-EINTR` |
//! | `Domain` | `-EIO` |

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backends;
mod cancel;
mod config;
mod device;
mod emergency;
mod error;
mod lifecycle;
mod lock;
mod profile;
mod queue;
mod refcount;
mod scheduler;
mod session;
mod state;
mod vertex;

pub use cancel::CancelToken;
pub use config::{
    VertexConfig, ENV_BOOST_TIMEOUT_MS, ENV_DSP_VIA_VERTEX, ENV_FM_SHARED_SLACK,
    ENV_STREAMOFF_DELAY_MS,
};
pub use device::{
    GraphDesc, GraphInfo, HwIds, NpuDevice, Param, SchedParam, SessionOps, VersionInfo,
};
pub use emergency::EmergencyGuard;
pub use error::{Result, VertexError};
pub use lock::{InterruptibleGuard, InterruptibleMutex, WAIT_TICK};
pub use profile::ProfileReport;
pub use queue::{Container, DequeueMode, Direction, Format, FormatList, NpuQueue, Readiness};
pub use refcount::{ActivationDomain, Hook};
pub use scheduler::{FrequencyInfo, Scheduler};
pub use session::Session;
pub use state::{StateSet, VertexState};
pub use vertex::{DomainCounts, Vertex};

/// Commonly used types.
pub mod prelude {
    pub use crate::backends::SoftwareRig;
    pub use crate::{
        CancelToken, Container, DequeueMode, Direction, EmergencyGuard, Format, FormatList,
        GraphDesc, HwIds, Result, Session, StateSet, Vertex, VertexConfig, VertexError,
        VertexState,
    };
}
