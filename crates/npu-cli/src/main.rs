//! `npuctl` - drive NPU vertex sessions against the software device.
//!
//! ```text
//! USAGE:
//!   npuctl run [STEP]...                  Run a scripted session lifecycle
//!   npuctl stress --sessions N --frames M Concurrent sessions, full lifecycle each
//!   npuctl info                           Versions and frequency ceiling
//! ```
//!
//! Steps: `open`, `graph[=IN,OUT]`, `format-in[=N]`, `format-out[=N]`,
//! `bootup[=HEX]`, `streamon`, `qbuf`, `dqbuf`, `dqbuf-nb`, `poll`,
//! `profile-on`, `profile-off`, `streamoff`, `flush`, `version`, `close`,
//! `fault=POINT`, `fault-emergency=POINT`, `emergency`, `recover`.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use npu_vertex::backends::{FaultAction, FaultPoint, SoftwareRig};
use npu_vertex::{
    CancelToken, Container, DequeueMode, Direction, Format, FormatList, GraphDesc, HwIds,
    Session, VertexConfig,
};
use std::str::FromStr;
use std::thread;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_SCRIPT: &[&str] = &[
    "open", "graph", "format-in", "format-out", "bootup", "streamon", "qbuf", "dqbuf", "close",
];

#[derive(Parser)]
#[command(name = "npuctl", about = "NPU vertex session driver", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a scripted lifecycle on one session (default: open through close).
    Run {
        /// Steps to execute in order.
        steps: Vec<String>,
    },
    /// Open many sessions concurrently and stream frames through each.
    Stress {
        /// Concurrent sessions.
        #[arg(long, default_value_t = 4)]
        sessions: u32,
        /// Frames per session.
        #[arg(long, default_value_t = 16)]
        frames: u32,
    },
    /// Print driver, hardware and firmware versions and the frequency ceiling.
    Info,
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Open,
    Graph { inputs: u32, outputs: u32 },
    Format { direction: Direction, count: usize },
    Bootup(HwIds),
    StreamOn,
    Qbuf,
    Dqbuf(DequeueMode),
    Poll,
    ProfileOn,
    ProfileOff,
    StreamOff,
    Flush,
    Version,
    Close,
    Fault(FaultPoint, FaultAction),
    Emergency,
    Recover,
}

fn parse_fault_point(name: &str) -> Result<FaultPoint> {
    let point = match name {
        "device-open" => FaultPoint::DeviceOpen,
        "device-close" => FaultPoint::DeviceClose,
        "device-bootup" => FaultPoint::DeviceBootup,
        "device-shutdown" => FaultPoint::DeviceShutdown,
        "device-start" => FaultPoint::DeviceStart,
        "device-stop" => FaultPoint::DeviceStop,
        "hw-bootup" => FaultPoint::HwBootup,
        "hw-shutdown" => FaultPoint::HwShutdown,
        "open-session" => FaultPoint::OpenSession,
        "open-queue" => FaultPoint::OpenQueue,
        "graph" => FaultPoint::Graph,
        "load" => FaultPoint::Load,
        "unload" => FaultPoint::Unload,
        "stream-on" => FaultPoint::StreamOn,
        "stream-off" => FaultPoint::StreamOff,
        "power-notify" => FaultPoint::PowerNotify,
        "session-close" => FaultPoint::SessionClose,
        "flush" => FaultPoint::Flush,
        "queue-format" => FaultPoint::QueueFormat,
        "queue-start" => FaultPoint::QueueStart,
        "queue-streamoff" => FaultPoint::QueueStreamOff,
        "queue-stop" => FaultPoint::QueueStop,
        other => bail!("unknown fault point: {other}"),
    };
    Ok(point)
}

impl FromStr for Step {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, arg) = match s.split_once('=') {
            Some((name, arg)) => (name, Some(arg)),
            None => (s, None),
        };
        let count = |default: usize| -> Result<usize> {
            arg.map_or(Ok(default), |a| a.parse().with_context(|| format!("bad count in {s}")))
        };

        let step = match name {
            "open" => Self::Open,
            "graph" => {
                let (inputs, outputs) = match arg {
                    Some(a) => {
                        let (i, o) = a.split_once(',').ok_or_else(|| anyhow!("expected graph=IN,OUT"))?;
                        (i.parse()?, o.parse()?)
                    }
                    None => (1, 1),
                };
                Self::Graph { inputs, outputs }
            }
            "format-in" => Self::Format { direction: Direction::Input, count: count(1)? },
            "format-out" => Self::Format { direction: Direction::Output, count: count(1)? },
            "bootup" => {
                let bits = match arg {
                    Some(a) => u32::from_str_radix(a.trim_start_matches("0x"), 16)
                        .with_context(|| format!("bad hardware ids in {s}"))?,
                    None => HwIds::NPU.bits(),
                };
                Self::Bootup(HwIds::from_bits(bits))
            }
            "streamon" => Self::StreamOn,
            "qbuf" => Self::Qbuf,
            "dqbuf" => Self::Dqbuf(DequeueMode::Blocking),
            "dqbuf-nb" => Self::Dqbuf(DequeueMode::NonBlocking),
            "poll" => Self::Poll,
            "profile-on" => Self::ProfileOn,
            "profile-off" => Self::ProfileOff,
            "streamoff" => Self::StreamOff,
            "flush" => Self::Flush,
            "version" => Self::Version,
            "close" => Self::Close,
            "fault" | "fault-emergency" => {
                let point = parse_fault_point(arg.ok_or_else(|| anyhow!("{name} needs =POINT"))?)?;
                let action = if name == "fault" {
                    FaultAction::Fail
                } else {
                    FaultAction::LatchEmergency
                };
                Self::Fault(point, action)
            }
            "emergency" => Self::Emergency,
            "recover" => Self::Recover,
            other => bail!("unknown step: {other}"),
        };
        Ok(step)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let rig = SoftwareRig::new(VertexConfig::from_env());

    match cli.command {
        Cmd::Run { steps } => cmd_run(&rig, &steps)?,
        Cmd::Stress { sessions, frames } => cmd_stress(&rig, sessions, frames)?,
        Cmd::Info => cmd_info(&rig)?,
    }

    Ok(())
}

fn formats(direction: Direction, count: usize) -> FormatList {
    FormatList {
        direction,
        formats: vec![
            Format {
                width: 224,
                height: 224,
                channels: 3,
                stride: 224 * 3,
                ..Format::default()
            };
            count
        ],
    }
}

fn frame(id: u32, direction: Direction) -> Container {
    Container {
        id,
        index: id % 8,
        direction,
        buffers: vec![vec![0u8; 224 * 224 * 3].into()],
    }
}

/// Output of one executed step, or why it failed
fn execute(
    rig: &SoftwareRig,
    session: &mut Option<Session>,
    step: Step,
    frame_id: &mut u32,
    cx: &CancelToken,
) -> Result<String> {
    let out = match step {
        Step::Open => {
            let opened = rig.vertex.open(cx)?;
            let msg = format!("session {}", opened.id());
            *session = Some(opened);
            msg
        }
        Step::Fault(point, action) => {
            rig.device.inject(point, action);
            format!("armed {action:?} at {point}")
        }
        Step::Emergency => {
            rig.vertex.emergency().latch();
            "emergency latched".to_string()
        }
        Step::Recover => {
            rig.vertex.emergency().clear();
            rig.device.clear_faults();
            "emergency cleared".to_string()
        }
        _ => {
            let Some(s) = session.as_ref() else {
                bail!("no open session");
            };
            match step {
                Step::Graph { inputs, outputs } => {
                    let graph = GraphDesc {
                        id: 1,
                        model: vec![0xA5u8; 4096].into(),
                        input_count: inputs,
                        output_count: outputs,
                    };
                    s.s_graph(&graph, cx)?;
                    format!("graph ifm({inputs}) ofm({outputs})")
                }
                Step::Format { direction, count } => {
                    s.s_format(&formats(direction, count), cx)?;
                    format!("{direction} x{count}")
                }
                Step::Bootup(ids) => {
                    rig.vertex.bootup(s, ids, cx)?;
                    format!("hw ids {ids}")
                }
                Step::StreamOn => s.streamon(cx).map(|()| String::new())?,
                Step::Qbuf => {
                    *frame_id += 1;
                    s.qbuf(frame(*frame_id, Direction::Output), cx)?;
                    format!("frame {frame_id}")
                }
                Step::Dqbuf(mode) => {
                    let c = s.dqbuf(Direction::Output, mode, cx)?;
                    format!("frame {}", c.id)
                }
                Step::Poll => format!("{:?}", s.poll()),
                Step::ProfileOn => s.profile_on(1, cx).map(|()| String::new())?,
                Step::ProfileOff => format!("{:?}", s.profile_off(cx)?),
                Step::StreamOff => s.streamoff(cx).map(|()| String::new())?,
                Step::Flush => s.flush(true).map(|()| String::new())?,
                Step::Version => {
                    let v = rig.vertex.version(s, cx)?;
                    format!(
                        "driver {} hardware {} firmware {}",
                        v.driver,
                        v.hardware,
                        v.firmware.as_deref().unwrap_or("-")
                    )
                }
                Step::Close => rig.vertex.close(s, cx).map(|()| String::new())?,
                Step::Open | Step::Fault(..) | Step::Emergency | Step::Recover => String::new(),
            }
        }
    };
    Ok(out)
}

fn cmd_run(rig: &SoftwareRig, steps: &[String]) -> Result<()> {
    let script: Vec<Step> = if steps.is_empty() {
        DEFAULT_SCRIPT.iter().map(|s| s.parse()).collect::<Result<_>>()?
    } else {
        steps.iter().map(|s| s.parse()).collect::<Result<_>>()?
    };

    info!("Running {} steps", script.len());
    let cx = CancelToken::new();
    let mut session = None;
    let mut frame_id = 0;
    let mut failures = 0;

    for (i, step) in script.into_iter().enumerate() {
        let result = execute(rig, &mut session, step, &mut frame_id, &cx);
        let state = session
            .as_ref()
            .map_or_else(|| "-".to_string(), |s| s.state().to_string());
        let counts = rig.vertex.counts();
        let counts = format!("open={} boot={} start={}", counts.open, counts.boot, counts.start);

        let name = format!("{step:?}");
        match result {
            Ok(detail) => println!("[{i:>2}] {name:<24} ok    state {state:<6} {counts}  {detail}"),
            Err(e) => {
                failures += 1;
                let errno = e
                    .downcast_ref::<npu_vertex::VertexError>()
                    .map_or(0, npu_vertex::VertexError::errno);
                println!("[{i:>2}] {name:<24} err   state {state:<6} {counts}  {e} ({errno})");
            }
        }
    }

    let stats = rig.device.stats();
    println!();
    println!("Device hooks : open {} / close {}", stats.device_opens, stats.device_closes);
    println!("               bootup {} / shutdown {}", stats.device_bootups, stats.device_shutdowns);
    println!("               start {} / stop {}", stats.device_starts, stats.device_stops);
    println!("Recoveries   : {}", stats.recovery_closes);
    println!("Failed steps : {failures}");

    Ok(())
}

fn cmd_stress(rig: &SoftwareRig, sessions: u32, frames: u32) -> Result<()> {
    info!("Stress run: {sessions} sessions x {frames} frames");
    let cx = &CancelToken::new();
    let start = Instant::now();

    let results: Vec<Result<u32>> = thread::scope(|s| {
        let workers: Vec<_> = (0..sessions)
            .map(move |_| {
                s.spawn(move || -> Result<u32> {
                    let mut session = None;
                    let mut frame_id = 0;
                    let setup = [
                        Step::Open,
                        Step::Graph { inputs: 1, outputs: 1 },
                        Step::Format { direction: Direction::Input, count: 1 },
                        Step::Format { direction: Direction::Output, count: 1 },
                        Step::Bootup(HwIds::NPU),
                        Step::StreamOn,
                    ];
                    for step in setup {
                        execute(rig, &mut session, step, &mut frame_id, cx)?;
                    }
                    for _ in 0..frames {
                        execute(rig, &mut session, Step::Qbuf, &mut frame_id, cx)?;
                        execute(rig, &mut session, Step::Dqbuf(DequeueMode::Blocking), &mut frame_id, cx)?;
                    }
                    execute(rig, &mut session, Step::Close, &mut frame_id, cx)?;
                    Ok(frames)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().unwrap_or_else(|_| Err(anyhow!("worker panicked"))))
            .collect()
    });

    let elapsed = start.elapsed();
    let mut total = 0u64;
    for (i, r) in results.iter().enumerate() {
        match r {
            Ok(n) => total += u64::from(*n),
            Err(e) => {
                warn!("session worker {i} failed: {e:#}");
                println!("session worker {i}: {e}");
            }
        }
    }

    let counts = rig.vertex.counts();
    println!("Sessions     : {sessions}");
    println!("Frames       : {total} in {elapsed:.2?}");
    println!(
        "Domains      : open={} boot={} start={}",
        counts.open, counts.boot, counts.start
    );
    if counts.open + counts.boot + counts.start != 0 {
        bail!("activation domains not released after stress run");
    }
    Ok(())
}

fn cmd_info(rig: &SoftwareRig) -> Result<()> {
    let cx = CancelToken::new();
    let session = rig.vertex.open(&cx)?;
    let version = rig.vertex.version(&session, &cx)?;
    rig.vertex.close(&session, &cx)?;

    let freq = rig.vertex.max_frequency()?;
    let config = rig.vertex.config();

    println!("Driver       : {}", version.driver);
    println!("Hardware     : {}", version.hardware);
    println!("Max freq     : NPU {} kHz, DSP {} kHz", freq.npu_khz, freq.dsp_khz);
    println!("Config       : streamoff delay {:?}, boost timeout {:?}", config.streamoff_delay_on_emergency, config.boost_timeout);
    println!("               fm slack {}, dsp via vertex {}", config.fm_shared_slack, config.dsp_via_vertex);
    Ok(())
}
