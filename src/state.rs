use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

use crate::types::{ProgressSnapshot, ScanStatus};

/// Live counters and status of one session.
///
/// Counters are atomics with a single writer (the progress aggregator); status lives in a
/// `watch` channel so waiters can observe terminal transitions.
#[derive(Debug)]
pub struct ScanState {
    scanned: AtomicU64,
    total: AtomicU64,
    found: AtomicU64,
    rate_bits: AtomicU64,
    status: watch::Sender<ScanStatus>,
}

impl ScanState {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ScanStatus::Idle);
        Self {
            scanned: AtomicU64::new(0),
            total: AtomicU64::new(0),
            found: AtomicU64::new(0),
            rate_bits: AtomicU64::new(0f64.to_bits()),
            status,
        }
    }

    pub fn status(&self) -> ScanStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanStatus> {
        self.status.subscribe()
    }

    /// Apply a forward transition. Illegal transitions (including leaving a terminal state)
    /// are refused and return false.
    pub fn advance(&self, next: ScanStatus) -> bool {
        self.status.send_if_modified(|current| {
            if current.can_advance_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Return to Idle with zeroed counters. Refused while scanning.
    pub fn reset(&self) -> bool {
        let reset = self.status.send_if_modified(|current| {
            if *current == ScanStatus::Scanning {
                return false;
            }
            *current = ScanStatus::Idle;
            true
        });
        if reset {
            self.scanned.store(0, Ordering::Release);
            self.total.store(0, Ordering::Release);
            self.found.store(0, Ordering::Release);
            self.set_rate(0.0);
        }
        reset
    }

    pub fn scanned(&self) -> u64 {
        self.scanned.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn found(&self) -> u64 {
        self.found.load(Ordering::Acquire)
    }

    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Acquire))
    }

    /// Publish the work size. Only ever raises the total.
    pub(crate) fn set_total(&self, total: u64) {
        self.total.fetch_max(total, Ordering::AcqRel);
    }

    /// Count one finished probe; `found` is bumped after `scanned` so readers never see
    /// more results than scanned items.
    pub(crate) fn record(&self, found: bool) -> u64 {
        let scanned = self.scanned.fetch_add(1, Ordering::AcqRel) + 1;
        if found {
            self.found.fetch_add(1, Ordering::AcqRel);
        }
        scanned
    }

    pub(crate) fn force_scanned_to_total(&self) {
        let total = self.total();
        self.scanned.fetch_max(total, Ordering::AcqRel);
    }

    pub(crate) fn set_rate(&self, rate: f64) {
        self.rate_bits.store(rate.to_bits(), Ordering::Release);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        // found before scanned: with the writer's order this keeps found <= scanned
        let found = self.found();
        let scanned = self.scanned();
        ProgressSnapshot::new(scanned, self.total(), found, self.status(), self.rate())
    }
}

impl Default for ScanState {
    fn default() -> Self {
        Self::new()
    }
}
