// SPDX-License-Identifier: AGPL-3.0-only

//! Close and flush unwinding
//!
//! Teardown is best-effort: every step is attempted even when an earlier one
//! failed, each failure is logged, and the first one is returned.

use crate::error::{Result, VertexError};
use crate::queue::NpuQueue;
use crate::session::SessionCtx;
use crate::state::VertexState;
use crate::vertex::VertexCore;
use std::sync::PoisonError;
use std::thread;
use tracing::{debug, info, warn};

/// Collects the first failure of a best-effort sequence
struct Unwind {
    id: u32,
    op: &'static str,
    first: Option<VertexError>,
}

impl Unwind {
    const fn new(id: u32, op: &'static str) -> Self {
        Self { id, op, first: None }
    }

    fn step(&mut self, what: &str, result: Result<()>) {
        if let Err(e) = result {
            warn!("[{}] {}: {what} failed: {e}", self.id, self.op);
            self.first.get_or_insert(e);
        }
    }

    fn finish(self) -> Result<()> {
        self.first.map_or(Ok(()), Err)
    }
}

/// Drop the session's start-domain reference, if it holds one
pub(crate) fn release_start(core: &VertexCore, ctx: &mut SessionCtx) -> Result<()> {
    if !ctx.start_ref {
        return Ok(());
    }
    let _stream = core.stream_lock.lock().unwrap_or_else(PoisonError::into_inner);
    ctx.start_ref = false;
    core.start_cnt.release()
}

/// Stop streaming regardless of the normal streamoff preconditions.
///
/// With the emergency flag latched the stream-off command is replaced by a
/// settle delay.
fn force_streamoff(
    core: &VertexCore,
    queue: &dyn NpuQueue,
    ctx: &mut SessionCtx,
    unwind: &mut Unwind,
) {
    ctx.stream.cancel();
    unwind.step("queue streamoff", queue.streamoff());

    if core.emergency.is_latched() {
        let delay = core.config.streamoff_delay_on_emergency;
        info!(
            "[{}] {}: emergency latched, waiting {delay:?} instead of stream-off",
            unwind.id, unwind.op
        );
        thread::sleep(delay);
    } else {
        unwind.step("stream-off command", ctx.ops.stream_off());
    }

    ctx.state.insert(VertexState::StreamOff);
    ctx.state.remove(VertexState::StreamOn);
    ctx.profiler.discard_in_flight();

    unwind.step("queue stop", queue.stop(true));
    unwind.step("start domain release", release_start(core, ctx));
}

/// A streamon that failed partway leaves its start reference behind
fn drop_stale_start(core: &VertexCore, queue: &dyn NpuQueue, ctx: &mut SessionCtx, unwind: &mut Unwind) {
    if ctx.start_ref {
        debug!("[{}] {}: releasing stale start reference", unwind.id, unwind.op);
        ctx.stream.cancel();
        unwind.step("queue stop", queue.stop(true));
        unwind.step("start domain release", release_start(core, ctx));
    }
}

/// Unwind a session from its done state. Caller holds the device and session
/// locks.
pub(crate) fn close(
    core: &VertexCore,
    id: u32,
    queue: &dyn NpuQueue,
    ctx: &mut SessionCtx,
) -> Result<()> {
    if ctx.state.contains(VertexState::Close) {
        warn!("[{id}] close: already closed");
        return Err(VertexError::invalid_state("close", ctx.state));
    }
    let Some(done) = ctx.state.done_state() else {
        warn!("[{id}] close: invalid state({})", ctx.state);
        return Err(VertexError::invalid_state("close", ctx.state));
    };

    info!("[{id}] close: done state {done}, state({})", ctx.state);
    let mut unwind = Unwind::new(id, "close");

    match done {
        VertexState::StreamOn => {
            force_streamoff(core, queue, ctx, &mut unwind);
            unwind.step("network unload", ctx.ops.unload());
        }
        VertexState::StreamOff => unwind.step("network unload", ctx.ops.unload()),
        _ => {}
    }
    drop_stale_start(core, queue, ctx, &mut unwind);

    let powered = ctx.state.contains(VertexState::Power);
    if powered {
        ctx.ops.unregister_hw();
        unwind.step("power notify off", ctx.ops.power_notify(false));
    }
    if ctx.profiler.is_prepared() {
        if let Err(e) = ctx.profiler.unprepare() {
            debug!("[{id}] close: profiler unprepare: {e}");
        }
    }
    unwind.step("session close", ctx.ops.close());
    if powered {
        unwind.step("boot domain release", core.boot_cnt.release());
    }

    if core.emergency.is_latched() {
        warn!("[{id}] close: emergency latched, skipping hardware shutdown");
    } else if !ctx.hw_ids.is_empty() {
        unwind.step("hardware shutdown", core.device.hw_shutdown(ctx.hw_ids));
    }

    unwind.step("open domain release", core.open_cnt.release());

    ctx.stream.cancel();
    ctx.state.insert(VertexState::Close);
    unwind.finish()
}

/// Stop streaming and drop pending work after the owner died. Caller holds
/// the session lock.
pub(crate) fn flush(core: &VertexCore, id: u32, queue: &dyn NpuQueue, ctx: &mut SessionCtx) -> Result<()> {
    if ctx.state.contains(VertexState::Close) {
        debug!("[{id}] flush: session already closed");
        return Ok(());
    }

    let mut unwind = Unwind::new(id, "flush");
    if ctx.state.contains(VertexState::StreamOn) && !ctx.state.contains(VertexState::StreamOff) {
        force_streamoff(core, queue, ctx, &mut unwind);
    }
    drop_stale_start(core, queue, ctx, &mut unwind);
    unwind.step("session flush", ctx.ops.flush());

    info!(
        "[{id}] flush: state({}), start_ref({})",
        ctx.state,
        core.start_cnt.count()
    );
    unwind.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwind_keeps_first_error() {
        let mut unwind = Unwind::new(3, "close");
        unwind.step("a", Ok(()));
        unwind.step("b", Err(VertexError::domain("b", "first")));
        unwind.step("c", Err(VertexError::domain("c", "second")));
        assert_eq!(unwind.finish(), Err(VertexError::domain("b", "first")));
    }

    #[test]
    fn clean_unwind_is_ok() {
        let mut unwind = Unwind::new(0, "flush");
        unwind.step("a", Ok(()));
        assert!(unwind.finish().is_ok());
    }
}
