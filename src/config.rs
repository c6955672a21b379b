use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, ScanError};
use crate::ports::PortRange;
use crate::probe::http::FoundPolicy;
use crate::types::ScanKind;
use crate::wordlist::Wordlist;

pub const DEFAULT_PORT_CONCURRENCY: usize = 500;
pub const MAX_PORT_CONCURRENCY: usize = 1000;
pub const DEFAULT_PATH_CONCURRENCY: usize = 50;
pub const MAX_PATH_CONCURRENCY: usize = 200;
pub const DEFAULT_PORT_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_PATH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)";

/// When the aggregator pushes a progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPolicy {
    /// Wall-clock throttle in milliseconds.
    IntervalMs(u64),
    /// Every Kth completed probe.
    EveryN(u64),
}

impl Default for ProgressPolicy {
    fn default() -> Self {
        ProgressPolicy::IntervalMs(100)
    }
}

/// Engine-wide tuning shared by every session an [`Engine`](crate::session::Engine) creates.
///
/// Loadable from JSON; missing fields take the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub progress: ProgressPolicy,
    /// Moving-average window for the throughput estimate.
    pub rate_window_ms: u64,
    /// How long in-flight probes may keep running after cancellation before being abandoned.
    pub cancel_grace_ms: u64,
    /// Upper bound on how long `cancel()` waits for the session to reach a terminal state.
    pub drain_timeout_ms: u64,
    /// Consecutive local socket failures (with no success yet) that abort a port scan.
    pub fatal_local_failures: u64,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            progress: ProgressPolicy::default(),
            rate_window_ms: 1000,
            cancel_grace_ms: 250,
            drain_timeout_ms: 2000,
            fatal_local_failures: 64,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(s: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms.max(1))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Port scan parameters. Immutable once handed to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct PortScanRequest {
    pub target: String,
    pub start_port: u32,
    pub end_port: u32,
    pub concurrency: usize,
    pub timeout: Duration,
    /// Run the fingerprint resolver on open ports.
    pub fingerprint: bool,
}

impl PortScanRequest {
    pub fn new(target: impl Into<String>, start_port: u32, end_port: u32) -> Self {
        Self {
            target: target.into(),
            start_port,
            end_port,
            concurrency: DEFAULT_PORT_CONCURRENCY,
            timeout: DEFAULT_PORT_TIMEOUT,
            fingerprint: true,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: bool) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub(crate) fn validate(&self) -> Result<PortRange> {
        if self.target.trim().is_empty() {
            return Err(ScanError::EmptyTarget);
        }
        let range = PortRange::new(self.start_port, self.end_port)?;
        validate_concurrency(self.concurrency, MAX_PORT_CONCURRENCY)?;
        validate_timeout(self.timeout)?;
        Ok(range)
    }
}

/// Where a path brute-force takes its candidates from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WordlistSource {
    Inline(Vec<String>),
    File(PathBuf),
}

impl WordlistSource {
    pub async fn load(&self) -> Result<Wordlist> {
        match self {
            WordlistSource::Inline(lines) => Wordlist::from_lines(lines),
            WordlistSource::File(path) => Wordlist::load(path).await,
        }
    }
}

/// Path brute-force parameters. Immutable once handed to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct PathScanRequest {
    pub base_url: String,
    pub wordlist: WordlistSource,
    pub concurrency: usize,
    pub timeout: Duration,
    pub policy: FoundPolicy,
}

impl PathScanRequest {
    pub fn new(base_url: impl Into<String>, wordlist: WordlistSource) -> Self {
        Self {
            base_url: base_url.into(),
            wordlist,
            concurrency: DEFAULT_PATH_CONCURRENCY,
            timeout: DEFAULT_PATH_TIMEOUT,
            policy: FoundPolicy::default(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: FoundPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub(crate) async fn validate(&self) -> Result<(Url, Wordlist)> {
        let base = parse_base_url(&self.base_url)?;
        validate_concurrency(self.concurrency, MAX_PATH_CONCURRENCY)?;
        validate_timeout(self.timeout)?;
        let wordlist = self.wordlist.load().await?;
        Ok((base, wordlist))
    }
}

/// Either kind of scan request.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanRequest {
    Ports(PortScanRequest),
    Paths(PathScanRequest),
}

impl ScanRequest {
    pub fn kind(&self) -> ScanKind {
        match self {
            ScanRequest::Ports(_) => ScanKind::PortScan,
            ScanRequest::Paths(_) => ScanKind::PathBrute,
        }
    }

    pub fn concurrency(&self) -> usize {
        match self {
            ScanRequest::Ports(r) => r.concurrency,
            ScanRequest::Paths(r) => r.concurrency,
        }
    }
}

impl From<PortScanRequest> for ScanRequest {
    fn from(r: PortScanRequest) -> Self {
        ScanRequest::Ports(r)
    }
}

impl From<PathScanRequest> for ScanRequest {
    fn from(r: PathScanRequest) -> Self {
        ScanRequest::Paths(r)
    }
}

/// Accepts `http`/`https` URLs with a host; a trailing slash is dropped when joining paths.
pub fn parse_base_url(input: &str) -> Result<Url> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ScanError::EmptyTarget);
    }
    let url = Url::parse(trimmed).map_err(|e| ScanError::InvalidUrl {
        input: trimmed.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ScanError::InvalidUrl {
            input: trimmed.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ScanError::InvalidUrl {
            input: trimmed.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

fn validate_concurrency(value: usize, max: usize) -> Result<()> {
    if value == 0 || value > max {
        return Err(ScanError::InvalidConcurrency { value, max });
    }
    Ok(())
}

fn validate_timeout(timeout: Duration) -> Result<()> {
    if timeout.is_zero() {
        return Err(ScanError::InvalidTimeout);
    }
    Ok(())
}
