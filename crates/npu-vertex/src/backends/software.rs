// SPDX-License-Identifier: AGPL-3.0-only

//! Software (simulated) NPU device
//!
//! Implements every collaborator trait in memory so the vertex and session
//! state machine run without hardware. This enables:
//!
//! 1. **CI without hardware**: integration tests drive full lifecycles and
//!    check each device hook ran the expected number of times.
//!
//! 2. **Fault drills**: any hook can be armed to fail once, or to latch the
//!    emergency flag mid-call the way a firmware fault interrupt would.
//!
//! 3. **Operator dry runs**: `npuctl` scripts run against this device.
//!
//! The queue is a loopback: every queued container completes immediately and
//! is handed back by dequeue in the same direction.

use crate::cancel::CancelToken;
use crate::config::VertexConfig;
use crate::device::{GraphDesc, GraphInfo, HwIds, NpuDevice, Param, SchedParam, SessionOps};
use crate::emergency::EmergencyGuard;
use crate::error::{Result, VertexError};
use crate::lock::WAIT_TICK;
use crate::queue::{Container, DequeueMode, Direction, FormatList, NpuQueue, Readiness};
use crate::scheduler::{FrequencyInfo, Scheduler};
use crate::vertex::Vertex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hook that can be armed with a one-shot fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `NpuDevice::open`
    DeviceOpen,
    /// `NpuDevice::close`
    DeviceClose,
    /// `NpuDevice::bootup`
    DeviceBootup,
    /// `NpuDevice::shutdown`
    DeviceShutdown,
    /// `NpuDevice::start`
    DeviceStart,
    /// `NpuDevice::stop`
    DeviceStop,
    /// `NpuDevice::hw_bootup`
    HwBootup,
    /// `NpuDevice::hw_shutdown`
    HwShutdown,
    /// `NpuDevice::open_session`
    OpenSession,
    /// `NpuDevice::open_queue`
    OpenQueue,
    /// `SessionOps::s_graph`
    Graph,
    /// `SessionOps::load`
    Load,
    /// `SessionOps::unload`
    Unload,
    /// `SessionOps::stream_on`
    StreamOn,
    /// `SessionOps::stream_off`
    StreamOff,
    /// `SessionOps::power_notify`
    PowerNotify,
    /// `SessionOps::close`
    SessionClose,
    /// `SessionOps::flush`
    Flush,
    /// `NpuQueue::s_format`
    QueueFormat,
    /// `NpuQueue::start`
    QueueStart,
    /// `NpuQueue::streamoff`
    QueueStreamOff,
    /// `NpuQueue::stop`
    QueueStop,
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DeviceOpen => "device open",
            Self::DeviceClose => "device close",
            Self::DeviceBootup => "device bootup",
            Self::DeviceShutdown => "device shutdown",
            Self::DeviceStart => "device start",
            Self::DeviceStop => "device stop",
            Self::HwBootup => "hw bootup",
            Self::HwShutdown => "hw shutdown",
            Self::OpenSession => "session open",
            Self::OpenQueue => "queue open",
            Self::Graph => "set graph",
            Self::Load => "network load",
            Self::Unload => "network unload",
            Self::StreamOn => "stream-on",
            Self::StreamOff => "stream-off",
            Self::PowerNotify => "power notify",
            Self::SessionClose => "session close",
            Self::Flush => "session flush",
            Self::QueueFormat => "queue format",
            Self::QueueStart => "queue start",
            Self::QueueStreamOff => "queue streamoff",
            Self::QueueStop => "queue stop",
        };
        f.write_str(name)
    }
}

/// What an armed fault does when its hook runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Hook returns a domain error
    Fail,
    /// Hook latches the emergency flag, then succeeds
    LatchEmergency,
}

/// Hook invocation counts
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub device_opens: usize,
    pub device_closes: usize,
    pub device_bootups: usize,
    pub device_shutdowns: usize,
    pub device_starts: usize,
    pub device_stops: usize,
    pub recovery_closes: usize,
    pub hw_bootups: usize,
    pub hw_shutdowns: usize,
    pub sessions_opened: usize,
    pub sessions_closed: usize,
    pub undo_opens: usize,
    pub loads: usize,
    pub unloads: usize,
    pub stream_ons: usize,
    pub stream_offs: usize,
    pub power_on: usize,
    pub power_off: usize,
    pub hw_registered: usize,
    pub hw_unregistered: usize,
    pub flushes: usize,
    pub queue_starts: usize,
    pub queue_streamoffs: usize,
    pub queue_stops: usize,
    pub forced_stops: usize,
}

/// State shared by the device and every session and queue it creates
#[derive(Debug)]
struct Shared {
    emergency: EmergencyGuard,
    stats: Mutex<StatsSnapshot>,
    faults: Mutex<HashMap<FaultPoint, FaultAction>>,
}

impl Shared {
    fn record(&self, f: impl FnOnce(&mut StatsSnapshot)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Fire the armed fault for `point`, if any
    fn hit(&self, point: FaultPoint) -> Result<()> {
        let armed = self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&point);
        match armed {
            None => Ok(()),
            Some(FaultAction::Fail) => {
                warn!("SoftwareDevice: injected failure at {point}");
                Err(VertexError::domain("software", format!("injected fault at {point}")))
            }
            Some(FaultAction::LatchEmergency) => {
                warn!("SoftwareDevice: injected emergency at {point}");
                self.emergency.latch();
                Ok(())
            }
        }
    }
}

/// In-memory NPU device
#[derive(Debug)]
pub struct SoftwareDevice {
    shared: Arc<Shared>,
}

impl SoftwareDevice {
    /// Device whose injected emergencies latch `emergency`
    pub fn new(emergency: EmergencyGuard) -> Self {
        Self {
            shared: Arc::new(Shared {
                emergency,
                stats: Mutex::new(StatsSnapshot::default()),
                faults: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Arm a one-shot fault at `point`
    pub fn inject(&self, point: FaultPoint, action: FaultAction) {
        debug!("SoftwareDevice: arming {action:?} at {point}");
        self.shared
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(point, action);
    }

    /// Disarm every pending fault
    pub fn clear_faults(&self) {
        self.shared
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Current hook counts
    pub fn stats(&self) -> StatsSnapshot {
        *self.shared.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn counted(&self, point: FaultPoint, f: impl FnOnce(&mut StatsSnapshot)) -> Result<()> {
        self.shared.record(f);
        self.shared.hit(point)
    }
}

impl NpuDevice for SoftwareDevice {
    fn open(&self) -> Result<()> {
        self.counted(FaultPoint::DeviceOpen, |s| s.device_opens += 1)
    }

    fn close(&self) -> Result<()> {
        self.counted(FaultPoint::DeviceClose, |s| s.device_closes += 1)
    }

    fn bootup(&self) -> Result<()> {
        self.counted(FaultPoint::DeviceBootup, |s| s.device_bootups += 1)
    }

    fn shutdown(&self) -> Result<()> {
        self.counted(FaultPoint::DeviceShutdown, |s| s.device_shutdowns += 1)
    }

    fn start(&self) -> Result<()> {
        self.counted(FaultPoint::DeviceStart, |s| s.device_starts += 1)
    }

    fn stop(&self) -> Result<()> {
        self.counted(FaultPoint::DeviceStop, |s| s.device_stops += 1)
    }

    fn recovery_close(&self) {
        info!("SoftwareDevice: recovery close");
        self.shared.record(|s| s.recovery_closes += 1);
    }

    fn hw_bootup(&self, ids: HwIds) -> Result<()> {
        debug!("SoftwareDevice: hw bootup {ids}");
        self.counted(FaultPoint::HwBootup, |s| s.hw_bootups += 1)
    }

    fn hw_shutdown(&self, ids: HwIds) -> Result<()> {
        debug!("SoftwareDevice: hw shutdown {ids}");
        self.counted(FaultPoint::HwShutdown, |s| s.hw_shutdowns += 1)
    }

    fn open_session(&self, id: u32) -> Result<Box<dyn SessionOps>> {
        self.shared.hit(FaultPoint::OpenSession)?;
        self.shared.record(|s| s.sessions_opened += 1);
        Ok(Box::new(SoftwareSession {
            id,
            shared: Arc::clone(&self.shared),
            graph: None,
            loaded: false,
        }))
    }

    fn open_queue(&self, id: u32) -> Result<Arc<dyn NpuQueue>> {
        self.shared.hit(FaultPoint::OpenQueue)?;
        Ok(Arc::new(SoftwareQueue::new(id, Arc::clone(&self.shared))))
    }

    fn hw_version(&self) -> String {
        "software-npu r0".to_string()
    }

    fn fw_version(&self) -> Option<String> {
        Some(format!("sim-{}", env!("CARGO_PKG_VERSION")))
    }
}

/// Per-session command channel of the software device
#[derive(Debug)]
pub struct SoftwareSession {
    id: u32,
    shared: Arc<Shared>,
    graph: Option<GraphInfo>,
    loaded: bool,
}

impl SessionOps for SoftwareSession {
    fn s_graph(&mut self, graph: &GraphDesc) -> Result<GraphInfo> {
        self.shared.hit(FaultPoint::Graph)?;
        if graph.model.is_empty() {
            return Err(VertexError::invalid_argument(format!(
                "graph {} has an empty model",
                graph.id
            )));
        }
        let info = GraphInfo {
            ifm_count: graph.input_count,
            ofm_count: graph.output_count,
        };
        self.graph = Some(info);
        Ok(info)
    }

    fn load(&mut self) -> Result<()> {
        self.shared.record(|s| s.loads += 1);
        self.shared.hit(FaultPoint::Load)?;
        if self.graph.is_none() {
            return Err(VertexError::domain("load", "no graph set"));
        }
        self.loaded = true;
        Ok(())
    }

    fn unload(&mut self) -> Result<()> {
        self.shared.record(|s| s.unloads += 1);
        self.shared.hit(FaultPoint::Unload)?;
        self.loaded = false;
        Ok(())
    }

    fn stream_on(&mut self) -> Result<()> {
        self.shared.record(|s| s.stream_ons += 1);
        self.shared.hit(FaultPoint::StreamOn)?;
        if !self.loaded {
            return Err(VertexError::domain("stream_on", "network not loaded"));
        }
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.shared.record(|s| s.stream_offs += 1);
        self.shared.hit(FaultPoint::StreamOff)
    }

    fn power_notify(&mut self, on: bool) -> Result<()> {
        self.shared.record(|s| {
            if on {
                s.power_on += 1;
            } else {
                s.power_off += 1;
            }
        });
        self.shared.hit(FaultPoint::PowerNotify)
    }

    fn register_hw(&mut self) {
        self.shared.record(|s| s.hw_registered += 1);
    }

    fn unregister_hw(&mut self) {
        self.shared.record(|s| s.hw_unregistered += 1);
    }

    fn s_param(&mut self, params: &[Param]) -> Result<()> {
        debug!("[{}] SoftwareSession: {} params", self.id, params.len());
        Ok(())
    }

    fn sched_param(&mut self, param: &SchedParam) -> Result<()> {
        if param.max_npu_core == 0 {
            return Err(VertexError::invalid_argument("max_npu_core must be at least 1"));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.shared.record(|s| s.flushes += 1);
        self.shared.hit(FaultPoint::Flush)
    }

    fn close(&mut self) -> Result<()> {
        self.shared.record(|s| s.sessions_closed += 1);
        self.shared.hit(FaultPoint::SessionClose)
    }

    fn undo_open(&mut self) {
        self.shared.record(|s| s.undo_opens += 1);
    }
}

#[derive(Debug, Default)]
struct QueueState {
    streaming: bool,
    input: Option<FormatList>,
    output: Option<FormatList>,
    completed: HashMap<Direction, VecDeque<Container>>,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.completed.values().map(VecDeque::len).sum()
    }
}

/// Loopback buffer queue
#[derive(Debug)]
pub struct SoftwareQueue {
    id: u32,
    shared: Arc<Shared>,
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl SoftwareQueue {
    fn new(id: u32, shared: Arc<Shared>) -> Self {
        Self {
            id,
            shared,
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NpuQueue for SoftwareQueue {
    fn s_format(&self, formats: &FormatList) -> Result<()> {
        self.shared.hit(FaultPoint::QueueFormat)?;
        if formats.formats.is_empty() {
            return Err(VertexError::invalid_argument("empty format list"));
        }
        let mut state = self.state();
        match formats.direction {
            Direction::Input => state.input = Some(formats.clone()),
            Direction::Output => state.output = Some(formats.clone()),
        }
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.shared.record(|s| s.queue_starts += 1);
        self.shared.hit(FaultPoint::QueueStart)?;
        let mut state = self.state();
        if state.input.is_none() || state.output.is_none() {
            return Err(VertexError::domain("queue start", "formats not set"));
        }
        state.streaming = true;
        Ok(())
    }

    fn streamoff(&self) -> Result<()> {
        self.shared.record(|s| s.queue_streamoffs += 1);
        self.shared.hit(FaultPoint::QueueStreamOff)?;
        self.state().streaming = false;
        self.ready.notify_all();
        Ok(())
    }

    fn stop(&self, forced: bool) -> Result<()> {
        self.shared.record(|s| {
            s.queue_stops += 1;
            if forced {
                s.forced_stops += 1;
            }
        });
        self.shared.hit(FaultPoint::QueueStop)?;
        let mut state = self.state();
        state.streaming = false;
        let dropped = state.pending();
        state.completed.clear();
        drop(state);
        if dropped > 0 {
            debug!("[{}] SoftwareQueue: stop dropped {dropped} containers", self.id);
        }
        self.ready.notify_all();
        Ok(())
    }

    fn qbuf(&self, container: Container) -> Result<()> {
        let mut state = self.state();
        if !state.streaming {
            return Err(VertexError::domain("qbuf", "queue not streaming"));
        }
        state
            .completed
            .entry(container.direction)
            .or_default()
            .push_back(container);
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    fn dqbuf(&self, direction: Direction, mode: DequeueMode, cancel: &CancelToken) -> Result<Container> {
        let mut state = self.state();
        loop {
            if let Some(c) = state.completed.get_mut(&direction).and_then(VecDeque::pop_front) {
                return Ok(c);
            }
            if mode == DequeueMode::NonBlocking {
                return Err(VertexError::would_block("dqbuf"));
            }
            if cancel.is_cancelled() {
                return Err(VertexError::interrupted("dqbuf"));
            }
            state = self
                .ready
                .wait_timeout(state, WAIT_TICK)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn prepare(&self, container: &Container) -> Result<()> {
        if container.buffers.is_empty() {
            return Err(VertexError::invalid_argument(format!(
                "container {} has no buffers",
                container.id
            )));
        }
        Ok(())
    }

    fn unprepare(&self, container: &Container) -> Result<()> {
        debug!("[{}] SoftwareQueue: unprepare container {}", self.id, container.id);
        Ok(())
    }

    fn poll(&self) -> Readiness {
        if self.state().pending() > 0 {
            Readiness::Readable
        } else {
            Readiness::Pending
        }
    }
}

/// Scheduler call counts
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub boosts: usize,
    pub deboosts: usize,
    pub last_deboost_timeout: Duration,
    pub qbuf_dvfs: usize,
    pub dqbuf_dvfs: usize,
}

/// Scheduler that records every boost and DVFS call
#[derive(Debug)]
pub struct SoftwareScheduler {
    frequency: FrequencyInfo,
    stats: Mutex<SchedulerStats>,
}

impl SoftwareScheduler {
    /// Scheduler reporting `frequency` as the platform ceiling
    pub fn new(frequency: FrequencyInfo) -> Self {
        Self {
            frequency,
            stats: Mutex::new(SchedulerStats::default()),
        }
    }

    /// Current call counts
    pub fn stats(&self) -> SchedulerStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, f: impl FnOnce(&mut SchedulerStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl Default for SoftwareScheduler {
    fn default() -> Self {
        Self::new(FrequencyInfo {
            npu_khz: 1_066_000,
            dsp_khz: 800_000,
        })
    }
}

impl Scheduler for SoftwareScheduler {
    fn boost_on(&self) {
        self.record(|s| s.boosts += 1);
    }

    fn boost_off_timeout(&self, timeout: Duration) {
        self.record(|s| {
            s.deboosts += 1;
            s.last_deboost_timeout = timeout;
        });
    }

    fn qbuf_dvfs(&self, _session: u32) {
        self.record(|s| s.qbuf_dvfs += 1);
    }

    fn dqbuf_dvfs(&self, _session: u32) {
        self.record(|s| s.dqbuf_dvfs += 1);
    }

    fn max_frequency(&self) -> Result<FrequencyInfo> {
        Ok(self.frequency)
    }
}

/// A vertex wired to a fresh software device and scheduler
#[derive(Debug, Clone)]
pub struct SoftwareRig {
    /// The controller under test
    pub vertex: Vertex,
    /// Its device
    pub device: Arc<SoftwareDevice>,
    /// Its scheduler
    pub scheduler: Arc<SoftwareScheduler>,
}

impl SoftwareRig {
    /// Probe a software vertex with `config`
    pub fn new(config: VertexConfig) -> Self {
        let emergency = EmergencyGuard::new();
        let device = Arc::new(SoftwareDevice::new(emergency.clone()));
        let scheduler = Arc::new(SoftwareScheduler::default());
        let vertex = Vertex::probe(
            Arc::clone(&device) as Arc<dyn NpuDevice>,
            Arc::clone(&scheduler) as Arc<dyn Scheduler>,
            emergency,
            config,
        );
        Self {
            vertex,
            device,
            scheduler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Format;
    use bytes::Bytes;
    use std::thread;

    fn formats(direction: Direction, n: usize) -> FormatList {
        FormatList {
            direction,
            formats: vec![Format::default(); n],
        }
    }

    fn container(id: u32, direction: Direction) -> Container {
        Container {
            id,
            index: 0,
            direction,
            buffers: vec![Bytes::from_static(b"fm")],
        }
    }

    fn streaming_queue() -> SoftwareQueue {
        let device = SoftwareDevice::new(EmergencyGuard::new());
        let q = SoftwareQueue::new(0, Arc::clone(&device.shared));
        q.s_format(&formats(Direction::Input, 1)).unwrap();
        q.s_format(&formats(Direction::Output, 1)).unwrap();
        q.start().unwrap();
        q
    }

    #[test]
    fn injected_fault_fires_once() {
        let device = SoftwareDevice::new(EmergencyGuard::new());
        device.inject(FaultPoint::DeviceOpen, FaultAction::Fail);
        assert!(device.open().is_err());
        assert!(device.open().is_ok());
        assert_eq!(device.stats().device_opens, 2);
    }

    #[test]
    fn injected_emergency_latches_shared_flag() {
        let emergency = EmergencyGuard::new();
        let device = SoftwareDevice::new(emergency.clone());
        device.inject(FaultPoint::DeviceBootup, FaultAction::LatchEmergency);
        assert!(device.bootup().is_ok());
        assert!(emergency.is_latched());
    }

    #[test]
    fn queue_needs_both_formats_to_start() {
        let device = SoftwareDevice::new(EmergencyGuard::new());
        let q = SoftwareQueue::new(1, Arc::clone(&device.shared));
        q.s_format(&formats(Direction::Output, 1)).unwrap();
        assert!(q.start().is_err());
    }

    #[test]
    fn loopback_returns_in_direction_order() {
        let q = streaming_queue();
        let cx = CancelToken::new();
        q.qbuf(container(1, Direction::Input)).unwrap();
        q.qbuf(container(2, Direction::Input)).unwrap();
        q.qbuf(container(3, Direction::Output)).unwrap();
        assert_eq!(q.poll(), Readiness::Readable);
        assert_eq!(q.dqbuf(Direction::Input, DequeueMode::NonBlocking, &cx).unwrap().id, 1);
        assert_eq!(q.dqbuf(Direction::Output, DequeueMode::NonBlocking, &cx).unwrap().id, 3);
        assert_eq!(q.dqbuf(Direction::Input, DequeueMode::NonBlocking, &cx).unwrap().id, 2);
    }

    #[test]
    fn empty_nonblocking_dequeue_would_block() {
        let q = streaming_queue();
        let err = q
            .dqbuf(Direction::Output, DequeueMode::NonBlocking, &CancelToken::new())
            .unwrap_err();
        assert!(err.is_would_block());
        assert_eq!(q.poll(), Readiness::Pending);
    }

    #[test]
    fn blocking_dequeue_wakes_on_qbuf() {
        let q = streaming_queue();
        let cx = CancelToken::new();
        thread::scope(|s| {
            let waiter = s.spawn(|| q.dqbuf(Direction::Output, DequeueMode::Blocking, &cx));
            thread::sleep(Duration::from_millis(20));
            q.qbuf(container(9, Direction::Output)).unwrap();
            assert_eq!(waiter.join().unwrap().unwrap().id, 9);
        });
    }

    #[test]
    fn blocking_dequeue_honours_cancel() {
        let q = streaming_queue();
        let cx = CancelToken::new();
        thread::scope(|s| {
            let waiter = s.spawn(|| q.dqbuf(Direction::Input, DequeueMode::Blocking, &cx));
            thread::sleep(Duration::from_millis(20));
            cx.cancel();
            let err = waiter.join().unwrap().unwrap_err();
            assert_eq!(err, VertexError::interrupted("dqbuf"));
        });
    }

    #[test]
    fn forced_stop_drops_completed() {
        let q = streaming_queue();
        q.qbuf(container(1, Direction::Output)).unwrap();
        q.stop(true).unwrap();
        assert_eq!(q.poll(), Readiness::Pending);
        assert!(q.qbuf(container(2, Direction::Output)).is_err());
        assert_eq!(q.shared.stats.lock().unwrap().forced_stops, 1);
    }

    #[test]
    fn empty_model_rejected() {
        let device = SoftwareDevice::new(EmergencyGuard::new());
        let mut session = device.open_session(0).unwrap();
        let graph = GraphDesc {
            id: 1,
            model: Bytes::new(),
            input_count: 1,
            output_count: 1,
        };
        assert!(matches!(
            session.s_graph(&graph),
            Err(VertexError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn scheduler_records_deboost_timeout() {
        let sched = SoftwareScheduler::default();
        sched.boost_on();
        sched.boost_off_timeout(Duration::from_millis(40));
        let stats = sched.stats();
        assert_eq!((stats.boosts, stats.deboosts), (1, 1));
        assert_eq!(stats.last_deboost_timeout, Duration::from_millis(40));
    }
}
