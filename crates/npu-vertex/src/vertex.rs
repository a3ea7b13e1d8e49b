// SPDX-License-Identifier: AGPL-3.0-only

//! Device-shared vertex controller
//!
//! One [`Vertex`] exists per physical NPU. It owns the three activation
//! domains and the device lock that totally orders open, close and bootup
//! across every session. The lock is held across the hardware calls those
//! operations make.

use crate::cancel::CancelToken;
use crate::config::VertexConfig;
use crate::device::{HwIds, NpuDevice, VersionInfo};
use crate::emergency::EmergencyGuard;
use crate::error::{Result, VertexError};
use crate::lifecycle;
use crate::lock::InterruptibleMutex;
use crate::refcount::ActivationDomain;
use crate::scheduler::{FrequencyInfo, Scheduler};
use crate::session::{Session, SessionCtx};
use crate::state::VertexState;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Snapshot of the three activation domain counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainCounts {
    /// Open handles
    pub open: usize,
    /// Powered sessions
    pub boot: usize,
    /// Streaming sessions
    pub start: usize,
}

/// State shared by the vertex and every session opened on it
#[derive(Debug)]
pub(crate) struct VertexCore {
    pub(crate) device: Arc<dyn NpuDevice>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) emergency: EmergencyGuard,
    pub(crate) config: VertexConfig,
    /// Serializes open, close, bootup and version queries
    pub(crate) lock: InterruptibleMutex<()>,
    /// Serializes start-domain transitions between sessions
    pub(crate) stream_lock: Mutex<()>,
    pub(crate) open_cnt: ActivationDomain,
    pub(crate) boot_cnt: ActivationDomain,
    pub(crate) start_cnt: ActivationDomain,
    next_id: AtomicU32,
}

impl VertexCore {
    pub(crate) fn counts(&self) -> DomainCounts {
        DomainCounts {
            open: self.open_cnt.count(),
            boot: self.boot_cnt.count(),
            start: self.start_cnt.count(),
        }
    }
}

/// Release a domain reference during rollback, logging instead of failing.
pub(crate) fn release_logged(domain: &ActivationDomain) {
    if let Err(e) = domain.release() {
        warn!("{}: release during rollback failed: {e}", domain.name());
    }
}

/// Per-device controller
#[derive(Debug, Clone)]
pub struct Vertex {
    core: Arc<VertexCore>,
}

impl Vertex {
    /// Set up the vertex for a probed device.
    ///
    /// `emergency` is the flag the device's fault handler latches.
    pub fn probe(
        device: Arc<dyn NpuDevice>,
        scheduler: Arc<dyn Scheduler>,
        emergency: EmergencyGuard,
        config: VertexConfig,
    ) -> Self {
        let domain = |name, first: fn(&dyn NpuDevice) -> Result<()>, last: fn(&dyn NpuDevice) -> Result<()>| {
            let (up, down) = (Arc::clone(&device), Arc::clone(&device));
            ActivationDomain::new(name, move || first(&*up), move || last(&*down))
        };

        let open_cnt = domain("open", |d| d.open(), |d| d.close());
        let boot_cnt = domain("boot", |d| d.bootup(), |d| d.shutdown());
        let start_cnt = domain("start", |d| d.start(), |d| d.stop());

        info!("Probed NPU vertex ({})", device.hw_version());

        Self {
            core: Arc::new(VertexCore {
                device,
                scheduler,
                emergency,
                config,
                lock: InterruptibleMutex::new(()),
                stream_lock: Mutex::new(()),
                open_cnt,
                boot_cnt,
                start_cnt,
                next_id: AtomicU32::new(0),
            }),
        }
    }

    /// Emergency flag shared with the fault handler
    #[must_use]
    pub fn emergency(&self) -> &EmergencyGuard {
        &self.core.emergency
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &VertexConfig {
        &self.core.config
    }

    /// Current activation domain counts
    #[must_use]
    pub fn counts(&self) -> DomainCounts {
        self.core.counts()
    }

    /// Refuse a session opened on another vertex
    fn check_owner(&self, session: &Session, op: &'static str) -> Result<()> {
        if Arc::ptr_eq(&self.core, session.core()) {
            return Ok(());
        }
        error!("[{}] {op}: session belongs to another vertex", session.id());
        Err(VertexError::invalid_argument(format!(
            "{op}: session {} was opened on another vertex",
            session.id()
        )))
    }

    /// Open a new session handle.
    ///
    /// The first opener activates the device.
    ///
    /// # Errors
    ///
    /// - `EmergencyRestricted` if the fault flag is latched on entry
    /// - `Interrupted` if `cx` is cancelled while waiting for the device lock
    /// - `WouldBlock` if a fault latched during activation (rolled back)
    /// - domain errors from device activation or session setup
    pub fn open(&self, cx: &CancelToken) -> Result<Session> {
        let core = &self.core;

        if let Err(e) = core.emergency.check() {
            warn!("Open in emergency recovery");
            return Err(e);
        }

        let guard = core.lock.lock(cx, "open")?;
        let result = self.open_locked();
        drop(guard);

        core.scheduler.boost_off_timeout(core.config.boost_timeout);

        match &result {
            Ok(session) => info!("[{}] open: open_ref({})", session.id(), core.open_cnt.count()),
            Err(e) => error!("open failed: {e}"),
        }
        result
    }

    fn open_locked(&self) -> Result<Session> {
        let core = &self.core;

        let activated = core.open_cnt.acquire();
        if core.emergency.is_latched() {
            error!("open: emergency fault during activation, starting recovery");
            release_logged(&core.open_cnt);
            core.device.recovery_close();
            return Err(VertexError::would_block("open"));
        }
        if let Err(e) = activated {
            error!("open: device activation failed: {e}");
            release_logged(&core.open_cnt);
            return Err(e);
        }
        if core.open_cnt.count() == 1 {
            // Freshly activated device: no session can be streaming on it
            core.start_cnt.reset();
        }

        let id = core.next_id.fetch_add(1, Ordering::Relaxed);

        let mut ops = match core.device.open_session(id) {
            Ok(ops) => ops,
            Err(e) => {
                error!("[{id}] open: session setup failed: {e}");
                release_logged(&core.open_cnt);
                return Err(e);
            }
        };

        let queue = match core.device.open_queue(id) {
            Ok(queue) => queue,
            Err(e) => {
                error!("[{id}] open: queue setup failed: {e}");
                ops.undo_open();
                release_logged(&core.open_cnt);
                return Err(e);
            }
        };

        Ok(Session::new(id, Arc::clone(core), ops, queue))
    }

    /// Tear a session down from whatever state it reached.
    ///
    /// Every unwind step is attempted; the first failure is returned.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if the session was opened on another vertex
    /// - `Interrupted` if `cx` is cancelled while waiting for a lock
    /// - `InvalidState` if the session is already closed or never opened
    /// - the first domain error hit during unwind
    pub fn close(&self, session: &Session, cx: &CancelToken) -> Result<()> {
        let core = &self.core;
        self.check_owner(session, "close")?;
        let _device = core.lock.lock(cx, "close")?;
        let mut ctx = session.lock(cx, "close")?;

        let result = lifecycle::close(core, session.id(), session.queue(), &mut ctx);

        info!(
            "[{}] close: boot_ref({}), open_ref({})",
            session.id(),
            core.boot_cnt.count(),
            core.open_cnt.count()
        );
        result
    }

    /// Boot the hardware a session needs and mark it powered.
    ///
    /// # Errors
    ///
    /// - `EmergencyRestricted` if the fault flag is latched on entry
    /// - `InvalidArgument` for an empty id set, DSP-only ids when not enabled,
    ///   or a session opened on another vertex
    /// - `Interrupted` if `cx` is cancelled while waiting for a lock
    /// - `InvalidState` if the session is closed or already powered
    /// - `WouldBlock` if a fault latched during boot-domain activation
    /// - domain errors from hardware bootup or power notification
    pub fn bootup(&self, session: &Session, hw_ids: HwIds, cx: &CancelToken) -> Result<()> {
        let core = &self.core;
        let id = session.id();

        core.emergency.check()?;
        self.check_owner(session, "bootup")?;

        if hw_ids.is_empty() {
            return Err(VertexError::invalid_argument("bootup without hardware ids"));
        }
        if hw_ids == HwIds::DSP && !core.config.dsp_via_vertex {
            error!("[{id}] bootup: DSP-only bootup is not handled by this vertex");
            return Err(VertexError::invalid_argument(format!(
                "hardware ids {hw_ids} not supported"
            )));
        }

        let _device = core.lock.lock(cx, "bootup")?;
        let mut ctx = session.lock(cx, "bootup")?;

        if ctx.state.contains(VertexState::Close) || ctx.state.contains(VertexState::Power) {
            error!("[{id}] bootup: invalid state({})", ctx.state);
            return Err(VertexError::invalid_state("bootup", ctx.state));
        }

        let result = self.bootup_locked(id, &mut ctx, hw_ids);

        info!("[{id}] bootup: boot_ref({})", core.boot_cnt.count());
        result
    }

    fn bootup_locked(&self, id: u32, ctx: &mut SessionCtx, hw_ids: HwIds) -> Result<()> {
        let core = &self.core;

        if let Err(e) = core.device.hw_bootup(hw_ids) {
            error!("[{id}] bootup: hw ids {hw_ids} failed: {e}");
            return Err(e);
        }
        ctx.hw_ids = ctx.hw_ids | hw_ids;

        let activated = core.boot_cnt.acquire();
        if core.emergency.is_latched() {
            error!("[{id}] bootup: emergency fault during activation, starting recovery");
            release_logged(&core.boot_cnt);
            core.device.recovery_close();
            return Err(VertexError::would_block("bootup"));
        }
        if let Err(e) = activated {
            error!("[{id}] bootup: boot domain activation failed: {e}");
            release_logged(&core.boot_cnt);
            return Err(e);
        }

        ctx.ops.register_hw();
        if let Err(e) = ctx.ops.power_notify(true) {
            error!("[{id}] bootup: power notify failed: {e}");
            ctx.ops.unregister_hw();
            release_logged(&core.boot_cnt);
            return Err(e);
        }

        ctx.state.insert(VertexState::Power);
        Ok(())
    }

    /// Driver, hardware and (once a graph is set) firmware versions
    ///
    /// # Errors
    ///
    /// Returns `EmergencyRestricted`, `Interrupted`, or `InvalidArgument` for
    /// a session opened on another vertex.
    pub fn version(&self, session: &Session, cx: &CancelToken) -> Result<VersionInfo> {
        let core = &self.core;
        core.emergency.check()?;
        self.check_owner(session, "version")?;

        let _device = core.lock.lock(cx, "version")?;
        let ctx = session.lock(cx, "version")?;

        Ok(VersionInfo {
            driver: env!("CARGO_PKG_VERSION"),
            hardware: core.device.hw_version(),
            firmware: if ctx.state.contains(VertexState::Graph) {
                core.device.fw_version()
            } else {
                None
            },
        })
    }

    /// Platform frequency ceiling; not gated by session state or faults
    ///
    /// # Errors
    ///
    /// Returns the scheduler's error if the table is unavailable.
    pub fn max_frequency(&self) -> Result<FrequencyInfo> {
        self.core.scheduler.max_frequency().map_err(|e| {
            error!("max frequency query failed: {e}");
            e
        })
    }
}
