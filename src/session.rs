//! Session lifecycle: validation, start, cancellation, completion and reset.
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, PathScanRequest, PortScanRequest, ScanRequest};
use crate::error::{Result, ScanError};
use crate::fingerprint::FingerprintResolver;
use crate::pool::{self, WorkerPool};
use crate::probe::http::PathProbe;
use crate::probe::tcp::PortProbe;
use crate::probe::Probe;
use crate::progress::Aggregator;
use crate::results::{PathSortKey, ResultCollector, ScanRecord, SortOrder};
use crate::state::ScanState;
use crate::targets::Targets;
use crate::types::{PathResult, PortResult, ProgressSnapshot, ScanEvent, ScanKind, ScanStatus};

/// Factory for sessions. At most one session per [`ScanKind`] runs at a time per engine.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: Arc<EngineConfig>,
    port_slot: Arc<AtomicBool>,
    path_slot: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            port_slot: Arc::default(),
            path_slot: Arc::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether a session of `kind` is currently running on this engine.
    pub fn is_active(&self, kind: ScanKind) -> bool {
        self.slot(kind).load(Ordering::Acquire)
    }

    fn slot(&self, kind: ScanKind) -> Arc<AtomicBool> {
        match kind {
            ScanKind::PortScan => self.port_slot.clone(),
            ScanKind::PathBrute => self.path_slot.clone(),
        }
    }

    pub fn port_scan(&self, req: PortScanRequest) -> Session<PortResult> {
        self.session(ScanKind::PortScan, Box::new(PortPlan(req)))
    }

    pub fn path_scan(&self, req: PathScanRequest) -> Session<PathResult> {
        self.session(ScanKind::PathBrute, Box::new(PathPlan(req)))
    }

    /// A session driven by a caller-supplied probe. The request still decides the work
    /// sequence and concurrency and is validated the same way.
    pub fn session_with_probe<R: ScanRecord>(
        &self,
        req: impl Into<ScanRequest>,
        probe: Arc<dyn Probe<R>>,
    ) -> Session<R> {
        let req = req.into();
        self.session(req.kind(), Box::new(CustomPlan { req, probe }))
    }

    fn session<R: ScanRecord>(&self, kind: ScanKind, plan: Box<dyn Plan<R>>) -> Session<R> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Session {
            kind,
            config: self.config.clone(),
            slot: self.slot(kind),
            plan,
            state: Arc::new(ScanState::new()),
            results: Arc::new(ResultCollector::new()),
            run: Mutex::new(RunSlot {
                cancel: CancellationToken::new(),
                events_tx,
                events_rx: Some(events_rx),
                error: Arc::new(Mutex::new(None)),
            }),
        }
    }
}

/// Everything a run needs once the request has been validated.
struct Prepared<R> {
    targets: Targets,
    probe: Arc<dyn Probe<R>>,
    concurrency: usize,
}

#[async_trait]
trait Plan<R>: Send + Sync {
    async fn prepare(&self, config: &EngineConfig) -> Result<Prepared<R>>;
}

struct PortPlan(PortScanRequest);

#[async_trait]
impl Plan<PortResult> for PortPlan {
    async fn prepare(&self, _config: &EngineConfig) -> Result<Prepared<PortResult>> {
        let req = &self.0;
        let range = req.validate()?;
        let ip = resolve_target(&req.target).await?;
        let mut probe = PortProbe::new(ip, req.timeout);
        if req.fingerprint {
            let resolver = FingerprintResolver::new(req.target.trim(), req.timeout)?;
            probe = probe.with_resolver(Arc::new(resolver));
        }
        debug!(%ip, start = range.start(), end = range.end(), "port scan prepared");
        Ok(Prepared {
            targets: Targets::Ports(range),
            probe: Arc::new(probe),
            concurrency: req.concurrency,
        })
    }
}

struct PathPlan(PathScanRequest);

#[async_trait]
impl Plan<PathResult> for PathPlan {
    async fn prepare(&self, config: &EngineConfig) -> Result<Prepared<PathResult>> {
        let req = &self.0;
        let (base, wordlist) = req.validate().await?;
        let probe = PathProbe::new(&base, req.policy.clone(), req.timeout, &config.user_agent)?;
        debug!(%base, words = wordlist.len(), "path scan prepared");
        Ok(Prepared {
            targets: Targets::Paths(wordlist),
            probe: Arc::new(probe),
            concurrency: req.concurrency,
        })
    }
}

struct CustomPlan<R> {
    req: ScanRequest,
    probe: Arc<dyn Probe<R>>,
}

#[async_trait]
impl<R: ScanRecord> Plan<R> for CustomPlan<R> {
    async fn prepare(&self, _config: &EngineConfig) -> Result<Prepared<R>> {
        let targets = match &self.req {
            ScanRequest::Ports(r) => Targets::Ports(r.validate()?),
            ScanRequest::Paths(r) => Targets::Paths(r.validate().await?.1),
        };
        Ok(Prepared {
            targets,
            probe: self.probe.clone(),
            concurrency: self.req.concurrency(),
        })
    }
}

async fn resolve_target(target: &str) -> Result<IpAddr> {
    let host = target.trim().trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let resolve_err = |reason: String| ScanError::Resolve {
        target: host.to_string(),
        reason,
    };
    let mut addrs = lookup_host((host, 0))
        .await
        .map_err(|e| resolve_err(e.to_string()))?;
    addrs
        .next()
        .map(|a| a.ip())
        .ok_or_else(|| resolve_err("no addresses found".into()))
}

/// Per-run plumbing, replaced by `reset`.
struct RunSlot<R> {
    cancel: CancellationToken,
    events_tx: mpsc::UnboundedSender<ScanEvent<R>>,
    events_rx: Option<mpsc::UnboundedReceiver<ScanEvent<R>>>,
    error: Arc<Mutex<Option<String>>>,
}

/// Holds the engine's per-kind slot for the lifetime of a run.
struct SlotGuard(Arc<AtomicBool>);

impl SlotGuard {
    fn acquire(slot: &Arc<AtomicBool>) -> Option<Self> {
        slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotGuard(slot.clone()))
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One scan run and its observable state.
///
/// Methods take `&self`; share a session behind an `Arc` to drive it from several tasks.
pub struct Session<R: ScanRecord> {
    kind: ScanKind,
    config: Arc<EngineConfig>,
    slot: Arc<AtomicBool>,
    plan: Box<dyn Plan<R>>,
    state: Arc<ScanState>,
    results: Arc<ResultCollector<R>>,
    run: Mutex<RunSlot<R>>,
}

impl<R: ScanRecord> Session<R> {
    pub fn kind(&self) -> ScanKind {
        self.kind
    }

    pub fn status(&self) -> ScanStatus {
        self.state.status()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.state.snapshot()
    }

    pub fn results(&self) -> Vec<R> {
        self.results.snapshot()
    }

    /// Message of the failure that put the session into Error, if any.
    pub fn error(&self) -> Option<String> {
        let error = self.lock_run().error.clone();
        let guard = lock(&error);
        guard.clone()
    }

    /// Event stream of the current run. Available once per run; `None` afterwards.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<ScanEvent<R>>> {
        self.lock_run().events_rx.take()
    }

    fn lock_run(&self) -> MutexGuard<'_, RunSlot<R>> {
        lock(&self.run)
    }

    /// Validate, resolve and launch the run. Returns once probing has started.
    pub async fn start(&self) -> Result<()> {
        let status = self.state.status();
        if status != ScanStatus::Idle {
            return Err(ScanError::InvalidState { action: "start", status });
        }
        let guard = SlotGuard::acquire(&self.slot).ok_or(ScanError::Busy(self.kind))?;

        let prepared = match self.plan.prepare(&self.config).await {
            Ok(p) => p,
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "scan failed to start");
                self.state.advance(ScanStatus::Error);
                let run = self.lock_run();
                *lock(&run.error) = Some(e.to_string());
                let _ = run.events_tx.send(ScanEvent::Finished {
                    status: ScanStatus::Error,
                    error: Some(e.to_string()),
                });
                drop(guard);
                return Err(e);
            }
        };

        self.state.set_total(prepared.targets.len());
        if !self.state.advance(ScanStatus::Scanning) {
            // a concurrent start on this same session got here first
            return Err(ScanError::InvalidState { action: "start", status: self.state.status() });
        }
        info!(kind = %self.kind, total = prepared.targets.len(), concurrency = prepared.concurrency, "scan started");

        let (cancel, events_tx, error) = {
            let run = self.lock_run();
            (run.cancel.clone(), run.events_tx.clone(), run.error.clone())
        };
        let driver = Driver {
            kind: self.kind,
            config: self.config.clone(),
            state: self.state.clone(),
            results: self.results.clone(),
            cancel,
            events_tx,
            error,
            guard,
        };
        tokio::spawn(driver.run(prepared));
        Ok(())
    }

    /// Request cancellation and wait, bounded by the drain timeout, for a terminal status.
    ///
    /// A no-op on an idle or finished session; calling it repeatedly is fine.
    pub async fn cancel(&self) -> ScanStatus {
        if self.state.status() != ScanStatus::Scanning {
            return self.state.status();
        }
        let token = self.lock_run().cancel.clone();
        token.cancel();
        let mut rx = self.state.subscribe();
        let drained = time::timeout(self.config.drain_timeout(), async move {
            let _ = rx.wait_for(|s| s.is_terminal()).await;
        })
        .await;
        if drained.is_err() {
            warn!(kind = %self.kind, "scan did not stop within the drain timeout");
        }
        self.state.status()
    }

    /// Resolve once the run reaches a terminal status. Returns immediately when idle.
    pub async fn wait(&self) -> ScanStatus {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s != ScanStatus::Scanning).await;
        self.state.status()
    }

    /// Back to Idle with cleared results and counters. Refused while scanning.
    pub fn reset(&self) -> Result<()> {
        if !self.state.reset() {
            return Err(ScanError::InvalidState {
                action: "reset",
                status: self.state.status(),
            });
        }
        self.results.clear();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        *self.lock_run() = RunSlot {
            cancel: CancellationToken::new(),
            events_tx,
            events_rx: Some(events_rx),
            error: Arc::new(Mutex::new(None)),
        };
        Ok(())
    }
}

/// Dropping a running session cancels it; the pool's grace period bounds the teardown
/// and the engine slot is released when the driver finishes.
impl<R: ScanRecord> Drop for Session<R> {
    fn drop(&mut self) {
        let run = self.run.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.state.status() == ScanStatus::Scanning {
            debug!(kind = %self.kind, "session dropped while scanning, cancelling");
        }
        run.cancel.cancel();
    }
}

impl Session<PathResult> {
    pub fn sorted_results(&self, key: PathSortKey, order: SortOrder) -> Vec<PathResult> {
        self.results.sorted_by(key, order)
    }
}

struct Driver<R> {
    kind: ScanKind,
    config: Arc<EngineConfig>,
    state: Arc<ScanState>,
    results: Arc<ResultCollector<R>>,
    cancel: CancellationToken,
    events_tx: mpsc::UnboundedSender<ScanEvent<R>>,
    error: Arc<Mutex<Option<String>>>,
    guard: SlotGuard,
}

impl<R: ScanRecord> Driver<R> {
    async fn run(self, prepared: Prepared<R>) {
        let Prepared { targets, probe, concurrency } = prepared;
        // bounded so a slow consumer throttles the workers
        let (tx, rx) = mpsc::channel(concurrency.clamp(16, 1024));
        let aggregator = Aggregator {
            state: self.state.clone(),
            results: self.results.clone(),
            events: self.events_tx.clone(),
            policy: self.config.progress,
            rate_window: self.config.rate_window(),
            fatal_local_failures: match self.kind {
                ScanKind::PortScan => self.config.fatal_local_failures,
                ScanKind::PathBrute => 0,
            },
            cancel: self.cancel.clone(),
        };
        let aggregating = tokio::spawn(aggregator.run(rx));

        let pool = WorkerPool::new(concurrency, self.config.cancel_grace());
        let report = pool
            .run(pool::queue(targets.iter()), probe, tx, self.cancel.clone())
            .await;
        let aggregated = match aggregating.await {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, "aggregator task failed");
                Default::default()
            }
        };

        let (status, message) = if let Some(fatal) = aggregated.fatal {
            (ScanStatus::Error, Some(fatal.to_string()))
        } else if self.state.scanned() >= self.state.total()
            || (!self.cancel.is_cancelled() && report.abandoned == 0)
        {
            self.state.force_scanned_to_total();
            (ScanStatus::Completed, None)
        } else {
            (ScanStatus::Cancelled, None)
        };

        *lock(&self.error) = message.clone();
        let Driver { state, results, events_tx, guard, kind, .. } = self;
        // free the slot before waiters observe the terminal status
        drop(guard);
        state.advance(status);
        let snapshot = state.snapshot();
        info!(
            %kind,
            %status,
            scanned = snapshot.scanned,
            found = results.len(),
            abandoned = report.abandoned,
            "scan finished"
        );
        let _ = events_tx.send(ScanEvent::Progress(snapshot));
        let _ = events_tx.send(ScanEvent::Finished { status, error: message });
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
