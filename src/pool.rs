//! Bounded worker pool pulling work items from a shared lazy queue.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::probe::Probe;
use crate::targets::WorkIter;
use crate::types::ProbeOutcome;

/// Shared queue; workers pull the next item under a short, non-async lock.
pub type WorkQueue = Arc<Mutex<WorkIter>>;

pub fn queue(iter: WorkIter) -> WorkQueue {
    Arc::new(Mutex::new(iter))
}

/// How a pool run ended. `dispatched == completed + abandoned` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub dispatched: u64,
    pub completed: u64,
    pub abandoned: u64,
}

/// `workers` concurrent loops, each running at most one probe at a time.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    grace: Duration,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
}

impl WorkerPool {
    /// `grace` is how long an in-flight probe may keep running after cancellation.
    pub fn new(workers: usize, grace: Duration) -> Self {
        Self { workers: workers.max(1), grace }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Drain `queue` through `probe`, sending each outcome to `tx`.
    ///
    /// Returns when the queue is exhausted, or after cancellation once every worker has
    /// finished or abandoned its current item.
    pub async fn run<R: Send + 'static>(
        &self,
        queue: WorkQueue,
        probe: Arc<dyn Probe<R>>,
        tx: mpsc::Sender<ProbeOutcome<R>>,
        cancel: CancellationToken,
    ) -> PoolReport {
        let counters = Arc::new(Counters::default());
        let mut set = JoinSet::new();
        for id in 0..self.workers {
            set.spawn(worker(
                id,
                queue.clone(),
                probe.clone(),
                tx.clone(),
                cancel.clone(),
                counters.clone(),
                self.grace,
            ));
        }
        drop(tx);

        // backstop: a probe that ignores its own timeout must not hold the run hostage
        let backstop = async {
            cancel.cancelled().await;
            time::sleep(self.grace * 2).await;
        };
        tokio::pin!(backstop);
        loop {
            let next = tokio::select! {
                joined = set.join_next() => joined,
                _ = &mut backstop => {
                    warn!(remaining = set.len(), "workers did not stop in time, aborting");
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    break;
                }
            };
            match next {
                Some(Ok(())) => {}
                Some(Err(e)) if e.is_panic() => error!(error = %e, "worker panicked"),
                Some(Err(_)) => {}
                None => break,
            }
        }

        let dispatched = counters.dispatched.load(Ordering::SeqCst);
        let completed = counters.completed.load(Ordering::SeqCst);
        // aborted workers never report, so abandonment is whatever did not complete
        let report = PoolReport {
            dispatched,
            completed,
            abandoned: dispatched - completed,
        };
        debug!(?report, "pool finished");
        report
    }
}

async fn worker<R: Send + 'static>(
    id: usize,
    queue: WorkQueue,
    probe: Arc<dyn Probe<R>>,
    tx: mpsc::Sender<ProbeOutcome<R>>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    grace: Duration,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let next = match queue.lock() {
            Ok(mut q) => q.next(),
            Err(poisoned) => poisoned.into_inner().next(),
        };
        let Some(item) = next else {
            return;
        };
        counters.dispatched.fetch_add(1, Ordering::SeqCst);

        let outcome = tokio::select! {
            biased;
            out = probe.probe(item) => out,
            _ = async {
                cancel.cancelled().await;
                time::sleep(grace).await;
            } => {
                debug!(worker = id, "abandoning in-flight probe");
                return;
            }
        };
        counters.completed.fetch_add(1, Ordering::SeqCst);
        if tx.send(outcome).await.is_err() {
            // aggregator is gone; nothing left to report to
            return;
        }
    }
}
