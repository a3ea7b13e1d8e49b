//! Cross-thread tests: shared activation domains, lock interruption and
//! cancellation of blocking dequeues.

use bytes::Bytes;
use npu_vertex::backends::SoftwareRig;
use npu_vertex::{
    CancelToken, Container, DequeueMode, Direction, DomainCounts, Format, FormatList, GraphDesc,
    HwIds, Session, VertexConfig, VertexError, VertexState,
};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn rig() -> SoftwareRig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    SoftwareRig::new(VertexConfig::default().with_streamoff_delay(Duration::from_millis(200)))
}

fn streaming(rig: &SoftwareRig, cx: &CancelToken) -> Session {
    let graph = GraphDesc {
        id: 1,
        model: Bytes::from_static(b"net"),
        input_count: 1,
        output_count: 1,
    };
    let session = rig.vertex.open(cx).expect("open");
    session.s_graph(&graph, cx).expect("s_graph");
    for direction in [Direction::Input, Direction::Output] {
        let list = FormatList {
            direction,
            formats: vec![Format::default()],
        };
        session.s_format(&list, cx).expect("s_format");
    }
    rig.vertex.bootup(&session, HwIds::NPU, cx).expect("bootup");
    session.streamon(cx).expect("streamon");
    session
}

fn output_frame(id: u32) -> Container {
    Container {
        id,
        index: 0,
        direction: Direction::Output,
        buffers: vec![Bytes::from_static(b"ofm")],
    }
}

#[test]
fn test_two_sessions_share_domains() {
    let rig = rig();
    let cx = CancelToken::new();

    let (a, b) = thread::scope(|s| {
        let a = s.spawn(|| rig.vertex.open(&cx).expect("open a"));
        let b = s.spawn(|| rig.vertex.open(&cx).expect("open b"));
        (a.join().unwrap(), b.join().unwrap())
    });
    assert_eq!(rig.vertex.counts().open, 2);

    thread::scope(|s| {
        s.spawn(|| rig.vertex.bootup(&a, HwIds::NPU, &cx).expect("bootup a"));
        s.spawn(|| rig.vertex.bootup(&b, HwIds::NPU, &cx).expect("bootup b"));
    });
    assert_eq!(rig.vertex.counts().boot, 2);
    assert_eq!(rig.device.stats().device_bootups, 1);

    thread::scope(|s| {
        s.spawn(|| rig.vertex.close(&a, &cx).expect("close a"));
        s.spawn(|| rig.vertex.close(&b, &cx).expect("close b"));
    });

    let stats = rig.device.stats();
    assert_eq!(rig.vertex.counts(), DomainCounts::default());
    assert_eq!((stats.device_opens, stats.device_closes), (1, 1));
    assert_eq!((stats.device_bootups, stats.device_shutdowns), (1, 1));
}

#[test]
fn test_many_sessions_streaming_concurrently() {
    let rig = SoftwareRig::new(VertexConfig::default());
    let cx = CancelToken::new();

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for round in 0..20 {
                    let session = streaming(&rig, &cx);
                    session.qbuf(output_frame(round), &cx).expect("qbuf");
                    let done = session
                        .dqbuf(Direction::Output, DequeueMode::Blocking, &cx)
                        .expect("dqbuf");
                    assert_eq!(done.id, round);
                    if round % 2 == 0 {
                        session.streamoff(&cx).expect("streamoff");
                    }
                    rig.vertex.close(&session, &cx).expect("close");
                }
            });
        }
    });

    let stats = rig.device.stats();
    assert_eq!(rig.vertex.counts(), DomainCounts::default());
    assert_eq!(stats.device_opens, stats.device_closes);
    assert_eq!(stats.device_bootups, stats.device_shutdowns);
    assert_eq!(stats.device_starts, stats.device_stops);
    assert_eq!(stats.sessions_closed, 160);
}

#[test]
fn test_blocking_dequeue_receives_frame_from_other_thread() {
    let rig = rig();
    let cx = CancelToken::new();
    let session = streaming(&rig, &cx);

    thread::scope(|s| {
        let waiter = s.spawn(|| session.dqbuf(Direction::Output, DequeueMode::Blocking, &cx));
        thread::sleep(Duration::from_millis(30));
        // The waiter does not hold the session lock
        session.qbuf(output_frame(42), &cx).expect("qbuf");
        assert_eq!(waiter.join().unwrap().expect("dqbuf").id, 42);
    });

    rig.vertex.close(&session, &cx).expect("close");
}

#[test]
fn test_streamoff_cancels_blocking_dequeue() {
    let rig = rig();
    let cx = CancelToken::new();
    let session = streaming(&rig, &cx);

    thread::scope(|s| {
        let waiter = s.spawn(|| session.dqbuf(Direction::Output, DequeueMode::Blocking, &cx));
        thread::sleep(Duration::from_millis(30));
        session.streamoff(&cx).expect("streamoff");
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err, VertexError::interrupted("dqbuf"));
    });

    assert!(session.state().contains(VertexState::StreamOff));
    rig.vertex.close(&session, &cx).expect("close");
    assert_eq!(rig.vertex.counts(), DomainCounts::default());
}

#[test]
fn test_close_cancels_blocking_dequeue() {
    let rig = rig();
    let cx = CancelToken::new();
    let session = streaming(&rig, &cx);

    thread::scope(|s| {
        let waiter = s.spawn(|| session.dqbuf(Direction::Input, DequeueMode::Blocking, &cx));
        thread::sleep(Duration::from_millis(30));
        rig.vertex.close(&session, &cx).expect("close");
        assert!(matches!(
            waiter.join().unwrap(),
            Err(VertexError::Interrupted { .. })
        ));
    });

    assert_eq!(rig.vertex.counts(), DomainCounts::default());
}

#[test]
fn test_caller_cancel_interrupts_blocking_dequeue() {
    let rig = rig();
    let cx = CancelToken::new();
    let session = streaming(&rig, &cx);
    let caller = CancelToken::new();

    thread::scope(|s| {
        let waiter = s.spawn(|| session.dqbuf(Direction::Output, DequeueMode::Blocking, &caller));
        thread::sleep(Duration::from_millis(30));
        caller.cancel();
        assert!(waiter.join().unwrap().is_err());
    });

    // The stream itself is still running
    assert!(session.state().contains(VertexState::StreamOn));
    rig.vertex.close(&session, &cx).expect("close");
}

#[test]
fn test_device_lock_wait_is_interruptible() {
    let rig = rig();
    let cx = CancelToken::new();
    let slow = streaming(&rig, &cx);
    let other = rig.vertex.open(&cx).expect("open other");

    // An emergency close holds the device lock through the settle delay
    rig.vertex.emergency().latch();
    let caller = CancelToken::new();

    thread::scope(|s| {
        let closer = s.spawn(|| rig.vertex.close(&slow, &cx));
        thread::sleep(Duration::from_millis(30));

        let waiter = s.spawn(|| {
            let started = Instant::now();
            (rig.vertex.close(&other, &caller), started.elapsed())
        });
        thread::sleep(Duration::from_millis(30));
        caller.cancel();

        let (result, waited) = waiter.join().unwrap();
        assert_eq!(result, Err(VertexError::interrupted("close")));
        assert!(waited < Duration::from_millis(180), "waited {waited:?}");
        closer.join().unwrap().expect("emergency close");
    });

    assert!(!other.state().contains(VertexState::Close));
    assert_eq!(rig.vertex.counts().open, 1);

    rig.vertex.emergency().clear();
    rig.vertex.close(&other, &cx).expect("close other");
    assert_eq!(rig.vertex.counts(), DomainCounts::default());
}

#[test]
fn test_uncontended_lock_ignores_cancelled_token() {
    let rig = rig();
    let cancelled = CancelToken::new();
    cancelled.cancel();

    let session = rig.vertex.open(&cancelled).expect("open");
    rig.vertex.close(&session, &cancelled).expect("close");
}
