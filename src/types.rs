use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The two scan kinds a session can run. At most one session per kind is active on an engine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    PortScan,
    PathBrute,
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanKind::PortScan => f.write_str("port scan"),
            ScanKind::PathBrute => f.write_str("path brute-force"),
        }
    }
}

/// Lifecycle status of a session.
///
/// `Idle -> Scanning -> {Completed, Cancelled, Error}`, or `Idle -> Error` when setup fails.
/// Terminal states are only left through an explicit reset.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    #[default]
    Idle,
    Scanning,
    Completed,
    Cancelled,
    Error,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Cancelled | ScanStatus::Error
        )
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_advance_to(self, next: ScanStatus) -> bool {
        use ScanStatus::*;
        matches!(
            (self, next),
            (Idle, Scanning) | (Idle, Error) | (Scanning, Completed) | (Scanning, Cancelled) | (Scanning, Error)
        )
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanStatus::Idle => "idle",
            ScanStatus::Scanning => "scanning",
            ScanStatus::Completed => "completed",
            ScanStatus::Cancelled => "cancelled",
            ScanStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// What a single unit of work points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkTarget {
    Port(u16),
    Path(String),
}

/// One atomic unit of work. `ordinal` is the item's position in the enumerated sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub ordinal: u64,
    pub target: WorkTarget,
}

/// Raw metadata describing how a probe ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeDetail {
    /// TCP connect succeeded.
    Open,
    /// Connection refused.
    Closed,
    /// No answer within the probe timeout.
    Filtered,
    /// HTTP response status.
    Status(u16),
    /// Remote side unreachable or the exchange failed; recoverable per item.
    Unreachable(String),
    /// The local host could not open a socket (descriptor or port exhaustion).
    LocalFailure(String),
}

/// The result of executing one [`WorkItem`]. Produced by a probe and consumed by the aggregator.
#[derive(Debug, Clone)]
pub struct ProbeOutcome<R> {
    pub ordinal: u64,
    pub latency: Duration,
    pub found: Option<R>,
    pub detail: OutcomeDetail,
}

impl<R> ProbeOutcome<R> {
    pub fn found(ordinal: u64, latency: Duration, record: R, detail: OutcomeDetail) -> Self {
        Self { ordinal, latency, found: Some(record), detail }
    }

    pub fn not_found(ordinal: u64, latency: Duration, detail: OutcomeDetail) -> Self {
        Self { ordinal, latency, found: None, detail }
    }

    pub fn is_success(&self) -> bool {
        self.found.is_some()
    }
}

/// One open TCP port with whatever the fingerprint resolver could identify.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortResult {
    pub port: u16,
    pub protocol: String,
    pub service: String,
    pub product_name: Option<String>,
    pub version: Option<String>,
    pub tls: bool,
    pub hostname: Option<String>,
    pub operating_system: Option<String>,
    pub device_type: Option<String>,
    pub probe_name: Option<String>,
    pub info: Option<String>,
    pub banner: Option<String>,
}

impl PortResult {
    /// An open port with nothing identified yet.
    pub fn open(port: u16) -> Self {
        Self {
            port,
            protocol: "tcp".to_string(),
            service: "unknown".to_string(),
            product_name: None,
            version: None,
            tls: false,
            hostname: None,
            operating_system: None,
            device_type: None,
            probe_name: None,
            info: None,
            banner: None,
        }
    }
}

/// One path that the found-policy accepted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PathResult {
    pub path: String,
    pub full_url: String,
    pub status_code: u16,
    pub content_type: String,
    pub content_length: u64,
}

/// Throttled progress summary pushed to consumers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub scanned: u64,
    pub total: u64,
    pub found: u64,
    pub status: ScanStatus,
    /// Items per second over the recent window.
    pub rate: f64,
    /// Completion in `[0, 100]`; capped at 99 until the session is terminal.
    pub percent: f64,
}

impl ProgressSnapshot {
    pub fn new(scanned: u64, total: u64, found: u64, status: ScanStatus, rate: f64) -> Self {
        Self {
            scanned,
            total,
            found,
            status,
            rate,
            percent: progress_percent(scanned, total, status),
        }
    }
}

/// `min(scanned / total, 0.99) * 100` while running, exactly 100 once terminal.
pub fn progress_percent(scanned: u64, total: u64, status: ScanStatus) -> f64 {
    if status.is_terminal() {
        return 100.0;
    }
    if total == 0 {
        return 0.0;
    }
    let ratio = scanned as f64 / total as f64;
    ratio.min(0.99) * 100.0
}

/// Everything a session pushes to its consumer, in arrival order.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ScanEvent<R> {
    Progress(ProgressSnapshot),
    Found(R),
    /// Sent exactly once per run.
    Finished {
        status: ScanStatus,
        error: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_capped_until_terminal() {
        assert_eq!(progress_percent(0, 0, ScanStatus::Scanning), 0.0);
        assert_eq!(progress_percent(50, 100, ScanStatus::Scanning), 50.0);
        assert_eq!(progress_percent(100, 100, ScanStatus::Scanning), 99.0);
        assert_eq!(progress_percent(100, 100, ScanStatus::Completed), 100.0);
        assert_eq!(progress_percent(3, 100, ScanStatus::Cancelled), 100.0);
    }

    #[test]
    fn status_transitions() {
        assert!(ScanStatus::Idle.can_advance_to(ScanStatus::Scanning));
        assert!(ScanStatus::Idle.can_advance_to(ScanStatus::Error));
        assert!(ScanStatus::Scanning.can_advance_to(ScanStatus::Cancelled));
        assert!(!ScanStatus::Idle.can_advance_to(ScanStatus::Completed));
        assert!(!ScanStatus::Completed.can_advance_to(ScanStatus::Scanning));
        assert!(!ScanStatus::Cancelled.can_advance_to(ScanStatus::Completed));
    }

    #[test]
    fn port_result_serialises_absent_fields_as_null() {
        let json = serde_json::to_value(PortResult::open(22)).unwrap();
        assert!(json.get("hostname").unwrap().is_null());
        assert_eq!(json["service"], "unknown");
        assert_eq!(json["protocol"], "tcp");
    }

    #[test]
    fn path_result_uses_camel_case() {
        let r = PathResult {
            path: "/admin".into(),
            full_url: "http://h/admin".into(),
            status_code: 200,
            content_type: "text/html".into(),
            content_length: 12,
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["fullUrl"], "http://h/admin");
        assert_eq!(json["statusCode"], 200);
    }
}
