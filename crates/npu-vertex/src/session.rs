// SPDX-License-Identifier: AGPL-3.0-only

//! Per-handle session state machine
//!
//! Every operation checks the emergency flag first, then takes the session
//! lock and checks the state bits it needs. Streaming operations use only the
//! session lock; open, close and bootup go through the [`Vertex`](crate::Vertex).
//!
//! | Operation | Requires | Sets |
//! |-----------|----------|------|
//! | `s_graph` | OPEN | GRAPH |
//! | `s_format` (OUTPUT) | GRAPH or FORMAT | FORMAT (clears GRAPH on failure) |
//! | `streamon` | GRAPH, FORMAT; not STREAMON/STREAMOFF | STREAMON |
//! | `qbuf` / `dqbuf` | STREAMON | none |
//! | `streamoff` | STREAMON, GRAPH, FORMAT | STREAMOFF, clears STREAMON |

use crate::cancel::CancelToken;
use crate::device::{GraphDesc, GraphInfo, HwIds, Param, SchedParam, SessionOps};
use crate::error::{Result, VertexError};
use crate::lifecycle;
use crate::lock::{InterruptibleGuard, InterruptibleMutex};
use crate::profile::{ProfileReport, Profiler};
use crate::queue::{Container, DequeueMode, Direction, FormatList, NpuQueue, Readiness};
use crate::state::{StateSet, VertexState};
use crate::vertex::{release_logged, VertexCore};
use std::sync::{Arc, PoisonError};
use tracing::{debug, error, info, warn};

/// Mutable per-session state, guarded by the session lock
#[derive(Debug)]
pub(crate) struct SessionCtx {
    pub(crate) state: StateSet,
    pub(crate) hw_ids: HwIds,
    pub(crate) graph: Option<GraphInfo>,
    pub(crate) ops: Box<dyn SessionOps>,
    /// Cancelled when the current streaming period ends
    pub(crate) stream: CancelToken,
    /// This session holds a start-domain reference
    pub(crate) start_ref: bool,
    pub(crate) profiler: Profiler,
}

impl SessionCtx {
    /// Refuse unless every bit in `needed` is set and the session is not closed
    fn require(&self, id: u32, op: &'static str, needed: &[VertexState]) -> Result<()> {
        if self.state.contains(VertexState::Close) || !self.state.contains_all(needed) {
            error!("[{id}] {op}: invalid state({})", self.state);
            return Err(VertexError::invalid_state(op, self.state));
        }
        Ok(())
    }
}

/// An open session handle
#[derive(Debug)]
pub struct Session {
    id: u32,
    core: Arc<VertexCore>,
    queue: Arc<dyn NpuQueue>,
    ctx: InterruptibleMutex<SessionCtx>,
}

impl Session {
    pub(crate) fn new(
        id: u32,
        core: Arc<VertexCore>,
        ops: Box<dyn SessionOps>,
        queue: Arc<dyn NpuQueue>,
    ) -> Self {
        Self {
            id,
            core,
            queue,
            ctx: InterruptibleMutex::new(SessionCtx {
                state: StateSet::from(VertexState::Open),
                hw_ids: HwIds::NONE,
                graph: None,
                ops,
                stream: CancelToken::new(),
                start_ref: false,
                profiler: Profiler::default(),
            }),
        }
    }

    /// Session id assigned at open
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Current state bits
    pub fn state(&self) -> StateSet {
        self.ctx.lock_uninterruptible().state
    }

    /// Hardware ids claimed at bootup
    pub fn hw_ids(&self) -> HwIds {
        self.ctx.lock_uninterruptible().hw_ids
    }

    pub(crate) fn core(&self) -> &Arc<VertexCore> {
        &self.core
    }

    pub(crate) fn queue(&self) -> &dyn NpuQueue {
        self.queue.as_ref()
    }

    pub(crate) fn lock(
        &self,
        cx: &CancelToken,
        op: &'static str,
    ) -> Result<InterruptibleGuard<'_, SessionCtx>> {
        self.ctx.lock(cx, op).map_err(|e| {
            error!("[{}] {op}: lock wait interrupted", self.id);
            e
        })
    }

    /// Emergency check, then the session lock
    fn enter(&self, cx: &CancelToken, op: &'static str) -> Result<InterruptibleGuard<'_, SessionCtx>> {
        self.core.emergency.check()?;
        self.lock(cx, op)
    }

    /// Submit the network graph.
    ///
    /// # Errors
    ///
    /// `EmergencyRestricted`, `Interrupted`, `InvalidState` without OPEN, or
    /// the session service's rejection.
    pub fn s_graph(&self, graph: &GraphDesc, cx: &CancelToken) -> Result<()> {
        let mut ctx = self.enter(cx, "s_graph")?;
        ctx.require(self.id, "s_graph", &[VertexState::Open])?;

        let info = ctx.ops.s_graph(graph).map_err(|e| {
            error!("[{}] s_graph: graph {} rejected: {e}", self.id, graph.id);
            e
        })?;

        debug!(
            "[{}] s_graph: graph {} ifm({}) ofm({})",
            self.id, graph.id, info.ifm_count, info.ofm_count
        );
        ctx.graph = Some(info);
        ctx.state.insert(VertexState::Graph);
        Ok(())
    }

    /// Set formats for one direction; OUTPUT formats also load the network.
    ///
    /// Any failure after the state check clears GRAPH.
    ///
    /// # Errors
    ///
    /// `EmergencyRestricted`, `Interrupted`, `InvalidState` without GRAPH or
    /// FORMAT, `InvalidArgument` for a feature-map count mismatch, or the
    /// queue's / network load's failure.
    pub fn s_format(&self, formats: &FormatList, cx: &CancelToken) -> Result<()> {
        let scheduler = &self.core.scheduler;
        scheduler.boost_on();
        let result = self.s_format_boosted(formats, cx);
        scheduler.boost_off_timeout(self.core.config.boost_timeout);
        result
    }

    fn s_format_boosted(&self, formats: &FormatList, cx: &CancelToken) -> Result<()> {
        let mut ctx = self.enter(cx, "s_format")?;

        if ctx.state.contains(VertexState::Close)
            || !ctx.state.contains_any(&[VertexState::Graph, VertexState::Format])
        {
            error!("[{}] s_format: invalid state({})", self.id, ctx.state);
            return Err(VertexError::invalid_state("s_format", ctx.state));
        }

        let result = self.apply_format(&mut ctx, formats);
        match &result {
            Ok(()) => info!("[{}] s_format: {} done", self.id, formats.direction),
            Err(e) => {
                error!("[{}] s_format: {} failed: {e}", self.id, formats.direction);
                ctx.state.remove(VertexState::Graph);
            }
        }
        result
    }

    fn apply_format(&self, ctx: &mut SessionCtx, formats: &FormatList) -> Result<()> {
        if ctx.hw_ids.contains(HwIds::NPU) {
            let graph = ctx.graph.unwrap_or_default();
            let expected = match formats.direction {
                Direction::Input => graph.ifm_count,
                Direction::Output => graph.ofm_count,
            };
            let count = u32::try_from(formats.count()).unwrap_or(u32::MAX);
            let slack = self.core.config.fm_shared_slack;
            if expected > count || expected.saturating_add(slack) < count {
                return Err(VertexError::invalid_argument(format!(
                    "{} feature maps: graph has {expected}, list has {count}",
                    formats.direction
                )));
            }
        }

        for (i, f) in formats.formats.iter().enumerate() {
            debug!(
                "[{}] s_format {} #{i}: target({}) format({}) plane({}) {}x{} stride({}) cstride({}) channels({}) pixel_format({})",
                self.id, formats.direction, f.target, f.format, f.plane, f.width, f.height,
                f.stride, f.cstride, f.channels, f.pixel_format
            );
        }

        self.queue.s_format(formats)?;

        if formats.direction == Direction::Output {
            ctx.ops.load()?;
            ctx.state.insert(VertexState::Format);
        }
        Ok(())
    }

    /// Apply session parameters
    ///
    /// # Errors
    ///
    /// `EmergencyRestricted`, `Interrupted`, `InvalidState` without OPEN, or
    /// the session service's rejection.
    pub fn s_param(&self, params: &[Param], cx: &CancelToken) -> Result<()> {
        let mut ctx = self.enter(cx, "s_param")?;
        ctx.require(self.id, "s_param", &[VertexState::Open])?;
        ctx.ops.s_param(params).map_err(|e| {
            error!("[{}] s_param: {e}", self.id);
            e
        })
    }

    /// Apply scheduling parameters
    ///
    /// # Errors
    ///
    /// `EmergencyRestricted`, `Interrupted`, `InvalidState` without OPEN, or
    /// the session service's rejection.
    pub fn sched_param(&self, param: &SchedParam, cx: &CancelToken) -> Result<()> {
        let mut ctx = self.enter(cx, "sched_param")?;
        ctx.require(self.id, "sched_param", &[VertexState::Open])?;
        let result = ctx.ops.sched_param(param);
        info!("[{}] sched_param: {result:?}", self.id);
        result
    }

    /// Queue a container for processing
    ///
    /// # Errors
    ///
    /// `EmergencyRestricted`, `Interrupted`, `InvalidState` without STREAMON,
    /// or the queue's failure.
    pub fn qbuf(&self, container: Container, cx: &CancelToken) -> Result<()> {
        let mut ctx = self.enter(cx, "qbuf")?;
        ctx.require(self.id, "qbuf", &[VertexState::StreamOn])?;

        let (frame, direction) = (container.id, container.direction);
        if direction == Direction::Output {
            self.core.scheduler.qbuf_dvfs(self.id);
        }

        self.queue.qbuf(container).map_err(|e| {
            error!("[{}] qbuf: ({direction}) frame {frame} failed: {e}", self.id);
            e
        })?;

        ctx.profiler.frame_queued(frame);
        Ok(())
    }

    /// Dequeue a completed container.
    ///
    /// A blocking dequeue releases the session lock while it waits, so
    /// streamoff, flush or close on this session can cancel it.
    ///
    /// # Errors
    ///
    /// `EmergencyRestricted`, `InvalidState` without STREAMON, `WouldBlock`
    /// when nothing is ready in non-blocking mode, `Interrupted` when the wait
    /// is cancelled, or the queue's failure.
    pub fn dqbuf(&self, direction: Direction, mode: DequeueMode, cx: &CancelToken) -> Result<Container> {
        let mut ctx = self.enter(cx, "dqbuf")?;
        ctx.require(self.id, "dqbuf", &[VertexState::StreamOn])?;

        let result = match mode {
            DequeueMode::NonBlocking => self.queue.dqbuf(direction, mode, &ctx.stream),
            DequeueMode::Blocking => {
                let wait = cx.join(&ctx.stream);
                drop(ctx);
                let result = self.queue.dqbuf(direction, mode, &wait);
                ctx = self.ctx.lock_uninterruptible();
                result
            }
        };

        match result {
            Ok(container) => {
                if direction == Direction::Output {
                    self.core.scheduler.dqbuf_dvfs(self.id);
                }
                ctx.profiler.frame_done(container.id);
                Ok(container)
            }
            Err(e) => {
                if !e.is_would_block() {
                    error!("[{}] dqbuf: ({direction}) failed: {e}", self.id);
                }
                Err(e)
            }
        }
    }

    /// Map a container's buffers ahead of use
    ///
    /// # Errors
    ///
    /// `EmergencyRestricted`, `Interrupted`, `InvalidState` without FORMAT, or
    /// the queue's failure.
    pub fn prepare(&self, container: &Container, cx: &CancelToken) -> Result<()> {
        let ctx = self.enter(cx, "prepare")?;
        ctx.require(self.id, "prepare", &[VertexState::Format])?;
        self.queue.prepare(container).map_err(|e| {
            error!("[{}] prepare: ({}) failed: {e}", self.id, container.direction);
            e
        })
    }

    /// Unmap a container's buffers
    ///
    /// # Errors
    ///
    /// `EmergencyRestricted`, `Interrupted`, `InvalidState` without FORMAT, or
    /// the queue's failure.
    pub fn unprepare(&self, container: &Container, cx: &CancelToken) -> Result<()> {
        let ctx = self.enter(cx, "unprepare")?;
        ctx.require(self.id, "unprepare", &[VertexState::Format])?;
        self.queue.unprepare(container).map_err(|e| {
            error!("[{}] unprepare: ({}) failed: {e}", self.id, container.direction);
            e
        })
    }

    /// Start streaming.
    ///
    /// A failure after the start domain was acquired leaves the reference
    /// with the session; a retry reuses it and close or flush releases it.
    ///
    /// # Errors
    ///
    /// `EmergencyRestricted`, `Interrupted`, `InvalidState` (already
    /// streaming, stopped, or missing GRAPH/FORMAT), or the start domain's,
    /// queue's or stream-on command's failure.
    pub fn streamon(&self, cx: &CancelToken) -> Result<()> {
        let mut ctx = self.enter(cx, "streamon")?;

        if ctx.state.contains_any(&[VertexState::StreamOn, VertexState::StreamOff]) {
            error!("[{}] streamon: invalid state({})", self.id, ctx.state);
            return Err(VertexError::invalid_state("streamon", ctx.state));
        }
        ctx.require(self.id, "streamon", &[VertexState::Format, VertexState::Graph])?;

        let result = self.streamon_locked(&mut ctx);
        info!(
            "[{}] streamon: {result:?}, start_ref({})",
            self.id,
            self.core.start_cnt.count()
        );
        result
    }

    fn streamon_locked(&self, ctx: &mut SessionCtx) -> Result<()> {
        let core = &self.core;
        if !ctx.start_ref {
            let _stream = core.stream_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = core.start_cnt.acquire() {
                error!("[{}] streamon: start domain activation failed: {e}", self.id);
                release_logged(&core.start_cnt);
                return Err(e);
            }
            ctx.start_ref = true;
        }
        ctx.stream = CancelToken::new();

        self.queue.start()?;
        ctx.ops.stream_on()?;
        ctx.state.insert(VertexState::StreamOn);
        Ok(())
    }

    /// Stop streaming
    ///
    /// # Errors
    ///
    /// `EmergencyRestricted`, `Interrupted`, `InvalidState` without
    /// STREAMON/GRAPH/FORMAT, or the queue's, stream-off command's or start
    /// domain's failure.
    pub fn streamoff(&self, cx: &CancelToken) -> Result<()> {
        let mut ctx = self.enter(cx, "streamoff")?;
        ctx.require(self.id, "streamoff", &[VertexState::StreamOn])?;
        ctx.require(self.id, "streamoff", &[VertexState::Format, VertexState::Graph])?;

        let result = self.streamoff_locked(&mut ctx);
        info!(
            "[{}] streamoff: {result:?}, start_ref({})",
            self.id,
            self.core.start_cnt.count()
        );
        result
    }

    fn streamoff_locked(&self, ctx: &mut SessionCtx) -> Result<()> {
        self.queue.streamoff()?;
        ctx.ops.stream_off()?;

        ctx.state.insert(VertexState::StreamOff);
        ctx.state.remove(VertexState::StreamOn);
        ctx.stream.cancel();
        ctx.profiler.discard_in_flight();

        self.queue.stop(false)?;
        lifecycle::release_start(&self.core, ctx)
    }

    /// Arm the profiler at `level`
    ///
    /// # Errors
    ///
    /// `EmergencyRestricted`, `Interrupted`, `InvalidState` once closed, or
    /// `InvalidArgument` for level 0.
    pub fn profile_on(&self, level: u32, cx: &CancelToken) -> Result<()> {
        let mut ctx = self.enter(cx, "profile_on")?;
        ctx.require(self.id, "profile_on", &[])?;
        ctx.profiler.prepare(level).map_err(|e| {
            error!("[{}] profile_on: {e}", self.id);
            e
        })
    }

    /// Report frame latencies gathered since profile-on
    ///
    /// # Errors
    ///
    /// `EmergencyRestricted` or `Interrupted`.
    pub fn profile_off(&self, cx: &CancelToken) -> Result<ProfileReport> {
        let ctx = self.enter(cx, "profile_off")?;
        Ok(ctx.profiler.report())
    }

    /// Readiness for a poll-style wait; `Error` until streaming
    pub fn poll(&self) -> Readiness {
        let streaming = self.state().contains(VertexState::StreamOn);
        if streaming {
            self.queue.poll()
        } else {
            Readiness::Error
        }
    }

    /// Flush after abnormal termination of the owning process.
    ///
    /// Does nothing unless `fatal`. Stops streaming if needed and drops the
    /// session's pending work; the handle stays open.
    ///
    /// # Errors
    ///
    /// The first failure of forced streamoff or the session flush.
    pub fn flush(&self, fatal: bool) -> Result<()> {
        if !fatal {
            debug!("[{}] flush: nothing to do", self.id);
            return Ok(());
        }
        let mut ctx = self.ctx.lock_uninterruptible();
        lifecycle::flush(&self.core, self.id, self.queue(), &mut ctx)
    }
}

/// A handle dropped without [`Vertex::close`](crate::Vertex::close) is closed
/// here, so its domain references are never leaked.
impl Drop for Session {
    fn drop(&mut self) {
        let core = &self.core;
        let _device = core.lock.lock_uninterruptible();
        let mut ctx = self.ctx.lock_uninterruptible();
        if ctx.state.contains(VertexState::Close) {
            return;
        }

        info!("[{}] release: closing dropped session", self.id);
        if let Err(e) = lifecycle::close(core, self.id, self.queue.as_ref(), &mut ctx) {
            warn!("[{}] release: close failed: {e}", self.id);
        }
    }
}
