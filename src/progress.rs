//! Outcome aggregation: counters, results, throttled progress and the event stream.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProgressPolicy;
use crate::error::ScanError;
use crate::results::{ResultCollector, ScanRecord};
use crate::state::ScanState;
use crate::types::{OutcomeDetail, ProbeOutcome, ScanEvent};

const BUCKET: Duration = Duration::from_millis(50);

/// Items per second over a sliding window, kept in fixed-width buckets.
#[derive(Debug)]
pub struct RateEstimator {
    window: Duration,
    origin: Instant,
    /// (bucket index since origin, completions)
    buckets: VecDeque<(u64, u64)>,
}

impl RateEstimator {
    pub fn new(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    pub fn starting_at(window: Duration, origin: Instant) -> Self {
        Self {
            window: window.max(BUCKET),
            origin,
            buckets: VecDeque::new(),
        }
    }

    fn index(&self, at: Instant) -> u64 {
        (at.saturating_duration_since(self.origin).as_millis() / BUCKET.as_millis()) as u64
    }

    fn window_buckets(&self) -> u64 {
        (self.window.as_millis() / BUCKET.as_millis()).max(1) as u64
    }

    fn evict(&mut self, now_idx: u64) {
        let keep_from = (now_idx + 1).saturating_sub(self.window_buckets());
        while self.buckets.front().is_some_and(|(i, _)| *i < keep_from) {
            self.buckets.pop_front();
        }
    }

    pub fn record_at(&mut self, at: Instant, n: u64) {
        let idx = self.index(at);
        match self.buckets.back_mut() {
            Some((last, count)) if *last == idx => *count += n,
            _ => self.buckets.push_back((idx, n)),
        }
        self.evict(idx);
    }

    pub fn record(&mut self, n: u64) {
        self.record_at(Instant::now(), n);
    }

    /// Before a full window has elapsed the divisor is the elapsed time, so early
    /// rates are not diluted.
    pub fn rate_at(&mut self, now: Instant) -> f64 {
        self.evict(self.index(now));
        let sum: u64 = self.buckets.iter().map(|(_, c)| c).sum();
        let span = now
            .saturating_duration_since(self.origin)
            .clamp(BUCKET, self.window);
        sum as f64 / span.as_secs_f64()
    }

    pub fn rate(&mut self) -> f64 {
        self.rate_at(Instant::now())
    }
}

/// Why the aggregator stopped early, if it did.
#[derive(Debug, Default)]
pub(crate) struct AggregateReport {
    pub fatal: Option<ScanError>,
}

/// Single consumer of probe outcomes for one run.
pub(crate) struct Aggregator<R> {
    pub state: Arc<ScanState>,
    pub results: Arc<ResultCollector<R>>,
    pub events: mpsc::UnboundedSender<ScanEvent<R>>,
    pub policy: ProgressPolicy,
    pub rate_window: Duration,
    /// 0 disables socket-exhaustion detection.
    pub fatal_local_failures: u64,
    pub cancel: CancellationToken,
}

struct Tracker {
    rate: RateEstimator,
    last_emitted: Option<u64>,
    local_failures: u64,
    any_success: bool,
}

impl<R: ScanRecord> Aggregator<R> {
    pub async fn run(self, mut rx: mpsc::Receiver<ProbeOutcome<R>>) -> AggregateReport {
        let mut report = AggregateReport::default();
        let mut t = Tracker {
            rate: RateEstimator::new(self.rate_window),
            last_emitted: None,
            local_failures: 0,
            any_success: false,
        };
        let period = match self.policy {
            ProgressPolicy::IntervalMs(ms) => Duration::from_millis(ms.max(1)),
            // the ticker still refreshes the rate so it decays while probes are slow
            ProgressPolicy::EveryN(_) => self.rate_window,
        };
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(outcome) = maybe else { break };
                    self.absorb(outcome, &mut t, &mut report);
                    if let ProgressPolicy::EveryN(k) = self.policy {
                        if self.state.scanned() % k.max(1) == 0 {
                            self.emit(&mut t);
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.state.set_rate(t.rate.rate());
                    if matches!(self.policy, ProgressPolicy::IntervalMs(_)) {
                        self.emit(&mut t);
                    }
                }
            }
        }
        self.state.set_rate(t.rate.rate());
        report
    }

    fn absorb(&self, outcome: ProbeOutcome<R>, t: &mut Tracker, report: &mut AggregateReport) {
        match &outcome.detail {
            OutcomeDetail::LocalFailure(reason) => {
                t.local_failures += 1;
                if !t.any_success
                    && report.fatal.is_none()
                    && self.fatal_local_failures > 0
                    && t.local_failures >= self.fatal_local_failures
                {
                    warn!(failures = t.local_failures, %reason, "local socket failures, aborting session");
                    report.fatal = Some(ScanError::NoSockets { detail: reason.clone() });
                    self.cancel.cancel();
                }
            }
            _ => {
                t.local_failures = 0;
                t.any_success = true;
            }
        }

        let ordinal = outcome.ordinal;
        match outcome.found {
            Some(record) => {
                if !self.results.push(ordinal, record.clone()) {
                    debug!(ordinal, "duplicate outcome ignored");
                    return;
                }
                self.state.record(true);
                let _ = self.events.send(ScanEvent::Found(record));
            }
            None => {
                self.state.record(false);
            }
        }
        t.rate.record(1);
    }

    fn emit(&self, t: &mut Tracker) {
        let scanned = self.state.scanned();
        if t.last_emitted == Some(scanned) {
            return;
        }
        t.last_emitted = Some(scanned);
        self.state.set_rate(t.rate.rate());
        let _ = self.events.send(ScanEvent::Progress(self.state.snapshot()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ScanStatus, WorkItem};

    #[test]
    fn rate_is_a_moving_window_not_cumulative() {
        let t0 = Instant::now();
        let mut r = RateEstimator::starting_at(Duration::from_secs(1), t0);
        for i in 0..10 {
            r.record_at(t0 + Duration::from_millis(i * 100), 10);
        }
        let rate = r.rate_at(t0 + Duration::from_millis(999));
        assert!((rate - 100.0).abs() < 1.0, "{rate}");
        // a second later with nothing new, the window is empty
        assert_eq!(r.rate_at(t0 + Duration::from_millis(2_100)), 0.0);
    }

    #[test]
    fn early_rate_uses_elapsed_time() {
        let t0 = Instant::now();
        let mut r = RateEstimator::starting_at(Duration::from_secs(1), t0);
        r.record_at(t0 + Duration::from_millis(10), 25);
        let rate = r.rate_at(t0 + Duration::from_millis(250));
        assert!((rate - 100.0).abs() < 1.0, "{rate}");
    }

    fn aggregator(
        policy: ProgressPolicy,
        fatal: u64,
    ) -> (Aggregator<u64>, mpsc::UnboundedReceiver<ScanEvent<u64>>, Arc<ScanState>, CancellationToken) {
        let state = Arc::new(ScanState::new());
        state.set_total(10);
        state.advance(ScanStatus::Scanning);
        let (events, ev_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let agg = Aggregator {
            state: state.clone(),
            results: Arc::new(ResultCollector::new()),
            events,
            policy,
            rate_window: Duration::from_secs(1),
            fatal_local_failures: fatal,
            cancel: cancel.clone(),
        };
        (agg, ev_rx, state, cancel)
    }

    impl ScanRecord for u64 {
        fn arrange(items: &mut [Self]) {
            items.sort_unstable();
        }
    }

    fn outcome(ordinal: u64, found: bool) -> ProbeOutcome<u64> {
        let item = WorkItem { ordinal, target: crate::types::WorkTarget::Port(1) };
        if found {
            ProbeOutcome::found(item.ordinal, Duration::ZERO, ordinal, OutcomeDetail::Open)
        } else {
            ProbeOutcome::not_found(item.ordinal, Duration::ZERO, OutcomeDetail::Closed)
        }
    }

    #[tokio::test]
    async fn every_n_emits_monotonic_snapshots() {
        let (agg, mut ev_rx, state, _) = aggregator(ProgressPolicy::EveryN(2), 0);
        let results = agg.results.clone();
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(agg.run(rx));
        for i in 0..10 {
            tx.send(outcome(i, i % 3 == 0)).await.unwrap();
        }
        drop(tx);
        let report = task.await.unwrap();
        assert!(report.fatal.is_none());
        assert_eq!(state.scanned(), 10);
        assert_eq!(state.found(), 4);
        assert_eq!(results.snapshot(), vec![0, 3, 6, 9]);

        let mut found = 0;
        let mut last = 0;
        while let Ok(ev) = ev_rx.try_recv() {
            match ev {
                ScanEvent::Found(_) => found += 1,
                ScanEvent::Progress(p) => {
                    assert!(p.scanned > last);
                    assert!(p.found <= p.scanned);
                    assert!(p.percent <= 99.0);
                    last = p.scanned;
                }
                ScanEvent::Finished { .. } => unreachable!("aggregator never finishes a run"),
            }
        }
        assert_eq!(found, 4);
        assert_eq!(last, 10);
    }

    #[tokio::test]
    async fn local_failures_before_success_are_fatal() {
        let (agg, _ev, _state, cancel) = aggregator(ProgressPolicy::default(), 3);
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(agg.run(rx));
        for i in 0..3 {
            tx.send(ProbeOutcome::not_found(i, Duration::ZERO, OutcomeDetail::LocalFailure("EMFILE".into())))
                .await
                .unwrap();
        }
        drop(tx);
        let report = task.await.unwrap();
        assert!(matches!(report.fatal, Some(ScanError::NoSockets { .. })));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn local_failures_after_success_are_tolerated() {
        let (agg, _ev, _state, cancel) = aggregator(ProgressPolicy::default(), 2);
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(agg.run(rx));
        tx.send(outcome(0, false)).await.unwrap();
        for i in 1..5 {
            tx.send(ProbeOutcome::not_found(i, Duration::ZERO, OutcomeDetail::LocalFailure("EMFILE".into())))
                .await
                .unwrap();
        }
        drop(tx);
        assert!(task.await.unwrap().fatal.is_none());
        assert!(!cancel.is_cancelled());
    }
}
