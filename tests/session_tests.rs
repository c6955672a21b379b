use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use glidescan::config::ProgressPolicy;
use glidescan::probe::Probe;
use glidescan::types::{
    OutcomeDetail, PortResult, ProbeOutcome, ScanEvent, ScanKind, ScanStatus, WorkItem, WorkTarget,
};
use glidescan::{Engine, EngineConfig, PortScanRequest, ScanError};
use tokio::net::TcpListener;

/// Reports a fixed set of ports as open, optionally slowly.
struct StaticPorts {
    open: Vec<u16>,
    delay: Duration,
    calls: AtomicU64,
}

impl StaticPorts {
    fn new(open: &[u16], delay: Duration) -> Arc<Self> {
        Arc::new(Self { open: open.to_vec(), delay, calls: AtomicU64::new(0) })
    }
}

#[async_trait]
impl Probe<PortResult> for StaticPorts {
    async fn probe(&self, item: WorkItem) -> ProbeOutcome<PortResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let WorkTarget::Port(port) = item.target else {
            panic!("expected a port item");
        };
        if self.open.contains(&port) {
            ProbeOutcome::found(item.ordinal, self.delay, PortResult::open(port), OutcomeDetail::Open)
        } else {
            ProbeOutcome::not_found(item.ordinal, self.delay, OutcomeDetail::Closed)
        }
    }
}

fn engine_every_probe() -> Engine {
    Engine::new(EngineConfig { progress: ProgressPolicy::EveryN(1), ..Default::default() })
}

#[tokio::test]
async fn two_open_ports_complete_in_order() {
    let engine = Engine::default();
    let probe = StaticPorts::new(&[80, 22], Duration::ZERO);
    let session = engine.session_with_probe::<PortResult>(
        PortScanRequest::new("127.0.0.1", 1, 100).with_concurrency(10),
        probe.clone(),
    );
    session.start().await.unwrap();
    assert_eq!(session.wait().await, ScanStatus::Completed);

    let ports: Vec<u16> = session.results().iter().map(|r| r.port).collect();
    assert_eq!(ports, vec![22, 80]);
    let p = session.progress();
    assert_eq!(p.scanned, 100);
    assert_eq!(p.found, 2);
    assert_eq!(p.percent, 100.0);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 100);
}

#[tokio::test]
async fn cancel_mid_scan_keeps_partial_progress() {
    let engine = engine_every_probe();
    let session = Arc::new(engine.session_with_probe::<PortResult>(
        PortScanRequest::new("127.0.0.1", 1, 1000).with_concurrency(1),
        StaticPorts::new(&[3], Duration::from_millis(20)),
    ));
    let mut events = session.events().unwrap();
    session.start().await.unwrap();

    while let Some(ev) = events.recv().await {
        if let ScanEvent::Progress(p) = ev {
            if p.scanned >= 5 {
                break;
            }
        }
    }
    assert_eq!(session.cancel().await, ScanStatus::Cancelled);
    // idempotent
    assert_eq!(session.cancel().await, ScanStatus::Cancelled);

    let p = session.progress();
    assert!(p.scanned >= 5 && p.scanned < 1000, "scanned {}", p.scanned);
    assert_eq!(p.percent, 100.0);
    assert_eq!(session.results().len(), 1);

    let mut finished = Vec::new();
    while let Some(ev) = events.recv().await {
        match ev {
            ScanEvent::Finished { status, error } => {
                assert!(error.is_none());
                finished.push(status);
                break;
            }
            ScanEvent::Progress(p) => assert!(p.scanned < 1000),
            ScanEvent::Found(_) => {}
        }
    }
    assert_eq!(finished, vec![ScanStatus::Cancelled]);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn inverted_range_rejected_before_probing() {
    let probe = StaticPorts::new(&[], Duration::ZERO);
    let session = Engine::default()
        .session_with_probe::<PortResult>(PortScanRequest::new("127.0.0.1", 500, 100), probe.clone());
    let err = session.start().await.unwrap_err();
    assert!(err.is_config());
    assert_eq!(session.status(), ScanStatus::Error);
    assert_eq!(session.progress().scanned, 0);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn second_session_of_same_kind_is_busy() {
    let engine = Engine::default();
    let slow = StaticPorts::new(&[], Duration::from_millis(50));
    let first = engine.session_with_probe::<PortResult>(
        PortScanRequest::new("127.0.0.1", 1, 200).with_concurrency(2),
        slow.clone(),
    );
    let second = engine.session_with_probe::<PortResult>(PortScanRequest::new("127.0.0.1", 1, 2), slow);
    first.start().await.unwrap();
    assert!(engine.is_active(ScanKind::PortScan));
    assert!(!engine.is_active(ScanKind::PathBrute));

    let err = second.start().await.unwrap_err();
    assert!(matches!(err, ScanError::Busy(ScanKind::PortScan)));
    assert_eq!(second.status(), ScanStatus::Idle);

    // reset is refused mid-run
    assert!(matches!(first.reset(), Err(ScanError::InvalidState { .. })));
    first.cancel().await;
    assert!(!engine.is_active(ScanKind::PortScan));
    second.start().await.unwrap();
    assert_eq!(second.wait().await, ScanStatus::Completed);
}

#[tokio::test]
async fn reset_allows_a_fresh_run() {
    let engine = Engine::default();
    let session = engine.session_with_probe::<PortResult>(
        PortScanRequest::new("127.0.0.1", 1, 10),
        StaticPorts::new(&[5], Duration::ZERO),
    );
    session.start().await.unwrap();
    session.wait().await;
    assert!(matches!(session.start().await, Err(ScanError::InvalidState { .. })));

    session.reset().unwrap();
    assert_eq!(session.status(), ScanStatus::Idle);
    assert!(session.results().is_empty());
    assert_eq!(session.progress().scanned, 0);
    assert!(session.events().is_some());

    session.start().await.unwrap();
    assert_eq!(session.wait().await, ScanStatus::Completed);
    assert_eq!(session.results().len(), 1);
}

#[tokio::test]
async fn real_listener_is_detected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (start, end) = (u32::from(port).saturating_sub(2).max(1), (u32::from(port) + 2).min(65535));

    let session = Engine::default().port_scan(
        PortScanRequest::new("127.0.0.1", start, end)
            .with_timeout(Duration::from_millis(500))
            .with_fingerprint(false),
    );
    session.start().await.unwrap();
    assert_eq!(session.wait().await, ScanStatus::Completed);
    let results = session.results();
    assert!(results.iter().any(|r| r.port == port && r.service == "unknown"));
    assert_eq!(session.progress().scanned, u64::from(end - start + 1));
    drop(listener);
}

#[tokio::test]
async fn dropping_a_running_session_stops_it() {
    let engine = Engine::default();
    let probe = StaticPorts::new(&[], Duration::from_millis(10));
    let session = engine.session_with_probe::<PortResult>(
        PortScanRequest::new("127.0.0.1", 1, 1000).with_concurrency(1),
        probe.clone(),
    );
    session.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(session);
    let at_drop = probe.calls.load(Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let later = probe.calls.load(Ordering::SeqCst);
    // at most the in-flight item finishes after the drop
    assert!(later <= at_drop + 1, "calls at drop {at_drop}, later {later}");
    assert!(!engine.is_active(ScanKind::PortScan));

    let next = engine.session_with_probe::<PortResult>(PortScanRequest::new("127.0.0.1", 1, 3), probe);
    next.start().await.unwrap();
    assert_eq!(next.wait().await, ScanStatus::Completed);
}

#[tokio::test]
async fn cancel_after_completion_keeps_completed() {
    let session = Engine::default().session_with_probe::<PortResult>(
        PortScanRequest::new("127.0.0.1", 1, 20),
        StaticPorts::new(&[7], Duration::ZERO),
    );
    session.start().await.unwrap();
    assert_eq!(session.wait().await, ScanStatus::Completed);

    assert_eq!(session.cancel().await, ScanStatus::Completed);
    assert_eq!(session.status(), ScanStatus::Completed);
    let p = session.progress();
    assert_eq!((p.scanned, p.found, p.percent), (20, 1, 100.0));
    assert_eq!(session.results().len(), 1);
}
