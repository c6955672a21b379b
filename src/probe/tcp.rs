use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::trace;

use super::Probe;
use crate::fingerprint::FingerprintResolver;
use crate::types::{OutcomeDetail, PortResult, ProbeOutcome, WorkItem, WorkTarget};

/// TCP connect probe for one resolved target address.
///
/// An open port is reported as found; closed and filtered ports are scanned-not-found.
pub struct PortProbe {
    ip: IpAddr,
    timeout: Duration,
    resolver: Option<Arc<FingerprintResolver>>,
}

impl PortProbe {
    pub fn new(ip: IpAddr, timeout: Duration) -> Self {
        Self { ip, timeout, resolver: None }
    }

    /// Run the fingerprint pipeline on every open port.
    pub fn with_resolver(mut self, resolver: Arc<FingerprintResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    async fn connect(&self, port: u16) -> (Duration, OutcomeDetail) {
        let addr = SocketAddr::new(self.ip, port);
        let start = Instant::now();
        let res = time::timeout(self.timeout, TcpStream::connect(addr)).await;
        let latency = start.elapsed();
        let detail = match res {
            // dropping the stream closes the socket before fingerprinting reconnects
            Ok(Ok(_stream)) => OutcomeDetail::Open,
            Ok(Err(e)) => classify_connect_error(&e),
            Err(_) => OutcomeDetail::Filtered,
        };
        (latency, detail)
    }
}

#[async_trait]
impl Probe<PortResult> for PortProbe {
    async fn probe(&self, item: WorkItem) -> ProbeOutcome<PortResult> {
        let WorkTarget::Port(port) = item.target else {
            return ProbeOutcome::not_found(
                item.ordinal,
                Duration::ZERO,
                OutcomeDetail::LocalFailure("port probe given a non-port item".into()),
            );
        };
        let (latency, detail) = self.connect(port).await;
        if detail != OutcomeDetail::Open {
            trace!(port, ?detail, "port not open");
            return ProbeOutcome::not_found(item.ordinal, latency, detail);
        }
        let record = match &self.resolver {
            Some(resolver) => resolver.resolve(SocketAddr::new(self.ip, port)).await,
            None => PortResult::open(port),
        };
        ProbeOutcome::found(item.ordinal, latency, record, detail)
    }
}

/// Map a connect error to a per-item outcome.
///
/// Local resource exhaustion is reported separately from remote unreachability so the
/// aggregator can tell a broken local host from a quiet target.
pub fn classify_connect_error(e: &io::Error) -> OutcomeDetail {
    match e.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => OutcomeDetail::Closed,
        io::ErrorKind::TimedOut => OutcomeDetail::Filtered,
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied => {
            OutcomeDetail::LocalFailure(e.to_string())
        }
        _ if is_local_exhaustion(e.raw_os_error()) => OutcomeDetail::LocalFailure(e.to_string()),
        _ => OutcomeDetail::Unreachable(e.to_string()),
    }
}

// Raw errno values for local socket exhaustion; the numbering differs per platform.
#[cfg(any(target_os = "linux", target_os = "android"))]
const EXHAUSTION_CODES: &[i32] = &[
    24,  // EMFILE
    23,  // ENFILE
    105, // ENOBUFS
    98,  // EADDRINUSE
    99,  // EADDRNOTAVAIL
];

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
const EXHAUSTION_CODES: &[i32] = &[
    24, // EMFILE
    23, // ENFILE
    55, // ENOBUFS
    48, // EADDRINUSE
    49, // EADDRNOTAVAIL
];

#[cfg(windows)]
const EXHAUSTION_CODES: &[i32] = &[
    10024, // WSAEMFILE
    10048, // WSAEADDRINUSE
    10049, // WSAEADDRNOTAVAIL
    10055, // WSAENOBUFS
];

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    windows
)))]
const EXHAUSTION_CODES: &[i32] = &[];

fn is_local_exhaustion(code: Option<i32>) -> bool {
    code.is_some_and(|c| EXHAUSTION_CODES.contains(&c))
}
