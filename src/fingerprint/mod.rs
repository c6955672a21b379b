//! Layered identification of the service behind an open TCP port.
//!
//! Stages, each with its own budget below the probe timeout:
//! 1. TLS handshake and certificate / ALPN hints
//! 2. passive banner grab matched against ordered signatures
//! 3. active protocol probes for ports that stayed silent
//! 4. OS / device heuristics over everything collected
pub mod heuristics;
pub mod signatures;
pub mod tls;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_native_tls::TlsConnector;
use tracing::{debug, trace};

use crate::error::Result;
use crate::types::PortResult;
use signatures::{ActiveProbe, ServiceMatch};
use tls::TlsInfo;

const BANNER_LIMIT: usize = 256;
const RESPONSE_LIMIT: usize = 2048;
/// After the first chunk arrives, how long to wait for more before stopping.
const READ_IDLE: Duration = Duration::from_millis(50);

/// Per-stage budgets, all strictly below the probe timeout they derive from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub tls: Duration,
    pub banner: Duration,
    pub active: Duration,
}

impl StageTimeouts {
    pub fn for_probe_timeout(timeout: Duration) -> Self {
        Self {
            tls: timeout / 3,
            banner: timeout / 4,
            active: timeout / 2,
        }
    }

    /// Upper bound of the whole pipeline.
    pub fn total(&self) -> Duration {
        self.tls + self.banner + self.active
    }
}

trait ProbeStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProbeStream for T {}

/// Runs the identification pipeline for open ports of one target.
pub struct FingerprintResolver {
    connector: TlsConnector,
    domain: String,
    timeouts: StageTimeouts,
}

#[derive(Default)]
struct Evidence {
    tls: Option<TlsInfo>,
    texts: Vec<String>,
}

impl FingerprintResolver {
    /// `domain` is sent as SNI; pass the host name the user asked for when there is one.
    pub fn new(domain: impl Into<String>, probe_timeout: Duration) -> Result<Self> {
        Ok(Self {
            connector: tls::build_connector()?,
            domain: domain.into(),
            timeouts: StageTimeouts::for_probe_timeout(probe_timeout),
        })
    }

    pub fn timeouts(&self) -> StageTimeouts {
        self.timeouts
    }

    /// Identify what listens on `addr`. Always returns a result; unknown fields stay `None`.
    pub async fn resolve(&self, addr: SocketAddr) -> PortResult {
        let mut result = PortResult::open(addr.port());
        let mut evidence = Evidence::default();
        if time::timeout(
            self.timeouts.total(),
            self.identify(addr, &mut result, &mut evidence),
        )
        .await
        .is_err()
        {
            debug!(%addr, "fingerprint budget exhausted");
        }
        self.classify(&mut result, &evidence);
        result
    }

    async fn identify(&self, addr: SocketAddr, result: &mut PortResult, evidence: &mut Evidence) {
        // 1. TLS
        if let Some(info) = tls::handshake(&self.connector, addr, &self.domain, self.timeouts.tls).await {
            trace!(%addr, alpn = ?info.alpn, "tls handshake succeeded");
            result.tls = true;
            result.hostname = info.hostname();
            if let Some(issuer) = &info.issuer {
                result.info = Some(format!("issuer: {issuer}"));
            }
            if let Some(service) = info.service_hint() {
                result.service = service.to_string();
            }
            evidence.tls = Some(info);
        }

        // 2. passive banner
        let banner = time::timeout(self.timeouts.banner, async {
            let mut stream = self.open(addr, result.tls).await?;
            read_response(&mut stream, BANNER_LIMIT, self.timeouts.banner).await
        })
        .await
        .ok()
        .flatten();
        if let Some(raw) = banner {
            result.banner = Some(render_banner(&raw));
            evidence.texts.push(String::from_utf8_lossy(&raw).into_owned());
            if let Some(m) = signatures::match_response(&raw, None) {
                apply_match(result, m, evidence);
            }
            return;
        }

        // 3. active probes
        let probes = signatures::probes_for(addr.port());
        let per_probe = (self.timeouts.active / probes.len().max(1) as u32).max(Duration::from_millis(50));
        let active = async {
            for probe in probes {
                let Some(raw) = self.exchange(addr, result.tls, probe, per_probe).await else {
                    continue;
                };
                trace!(%addr, probe = probe.name, bytes = raw.len(), "probe answered");
                if result.banner.is_none() {
                    result.banner = Some(render_banner(&raw[..raw.len().min(BANNER_LIMIT)]));
                }
                evidence.texts.push(String::from_utf8_lossy(&raw).into_owned());
                if let Some(m) = signatures::match_response(&raw, Some(probe.name)) {
                    result.probe_name = Some(probe.name.to_string());
                    apply_match(result, m, evidence);
                    return;
                }
            }
        };
        let _ = time::timeout(self.timeouts.active, active).await;
    }

    async fn open(&self, addr: SocketAddr, tls: bool) -> Option<Box<dyn ProbeStream>> {
        let tcp = TcpStream::connect(addr).await.ok()?;
        if tls {
            let stream = self.connector.connect(&self.domain, tcp).await.ok()?;
            Some(Box::new(stream))
        } else {
            Some(Box::new(tcp))
        }
    }

    async fn exchange(
        &self,
        addr: SocketAddr,
        tls: bool,
        probe: &ActiveProbe,
        budget: Duration,
    ) -> Option<Vec<u8>> {
        time::timeout(budget, async {
            let mut stream = self.open(addr, tls).await?;
            stream.write_all(probe.payload).await.ok()?;
            read_response(&mut stream, RESPONSE_LIMIT, budget).await
        })
        .await
        .ok()
        .flatten()
    }

    fn classify(&self, result: &mut PortResult, evidence: &Evidence) {
        let mut texts: Vec<&str> = evidence.texts.iter().map(String::as_str).collect();
        texts.extend(result.product_name.as_deref());
        texts.extend(result.operating_system.as_deref());
        if let Some(info) = &evidence.tls {
            texts.extend(info.subject_cn.as_deref());
            texts.extend(info.organization.as_deref());
            texts.extend(info.issuer.as_deref());
        }
        let c = heuristics::classify(texts);
        // a heuristic OS replaces a raw distro capture such as "Ubuntu"
        if c.operating_system.is_some() {
            result.operating_system = c.operating_system;
        }
        if result.device_type.is_none() {
            result.device_type = c.device_type;
        }
    }
}

fn apply_match(result: &mut PortResult, m: ServiceMatch, evidence: &mut Evidence) {
    result.service = if result.tls && m.service == "http" {
        "https".to_string()
    } else {
        m.service
    };
    result.product_name = m.product.or(result.product_name.take());
    result.version = m.version.or(result.version.take());
    result.hostname = m.hostname.or(result.hostname.take());
    result.operating_system = m.os.or(result.operating_system.take());
    result.device_type = m.device.or(result.device_type.take());
    if let Some(info) = m.info {
        result.info = Some(match result.info.take() {
            Some(existing) => format!("{info}; {existing}"),
            None => info,
        });
    }
    if let Some(p) = &result.product_name {
        evidence.texts.push(p.clone());
    }
}

/// Read until `limit`, EOF, or the window closes. Once data arrives, a short idle gap ends it.
async fn read_response<S>(stream: &mut S, limit: usize, window: Duration) -> Option<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; limit];
    let mut len = 0usize;
    let deadline = Instant::now() + window;
    while len < limit {
        let wait_until = if len == 0 {
            deadline
        } else {
            deadline.min(Instant::now() + READ_IDLE)
        };
        match time::timeout_at(wait_until, stream.read(&mut buf[len..])).await {
            Ok(Ok(n)) if n > 0 => len += n,
            _ => break,
        }
    }
    if len == 0 {
        return None;
    }
    buf.truncate(len);
    Some(buf)
}

/// Lossy UTF-8 with CR/LF escaped so the banner stays on one line.
fn render_banner(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n', '\0'])
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn stage_budgets_stay_below_probe_timeout() {
        let t = Duration::from_millis(900);
        let s = StageTimeouts::for_probe_timeout(t);
        assert!(s.tls < t && s.banner < t && s.active < t);
        assert_eq!(s.total(), Duration::from_millis(300 + 225 + 450));
    }

    #[test]
    fn banner_rendering_escapes_newlines() {
        assert_eq!(render_banner(b"220 ready\r\nmore\r\n"), "220 ready\\r\\nmore");
    }

    async fn serve<F>(handler: F) -> SocketAddr
    where
        F: Fn(TcpStream) -> tokio::task::JoinHandle<()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                handler(sock);
            }
        });
        addr
    }

    #[tokio::test]
    async fn identifies_ssh_from_banner() {
        let addr = serve(|mut sock| {
            tokio::spawn(async move {
                let _ = sock.write_all(b"SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.4\r\n").await;
                tokio::time::sleep(Duration::from_millis(300)).await;
            })
        })
        .await;
        let resolver = FingerprintResolver::new("127.0.0.1", Duration::from_millis(900)).unwrap();
        let r = resolver.resolve(addr).await;
        assert!(!r.tls);
        assert_eq!(r.service, "ssh");
        assert_eq!(r.product_name.as_deref(), Some("OpenSSH"));
        assert_eq!(r.version.as_deref(), Some("8.9p1"));
        assert_eq!(r.operating_system.as_deref(), Some("Linux"));
        assert!(r.probe_name.is_none());
        assert!(r.banner.unwrap().starts_with("SSH-2.0-OpenSSH"));
    }

    #[tokio::test]
    async fn silent_http_is_found_by_active_probe() {
        let addr = serve(|mut sock| {
            tokio::spawn(async move {
                let mut buf = [0u8; 512];
                if let Ok(n) = sock.read(&mut buf).await {
                    if buf[..n].starts_with(b"GET ") {
                        let _ = sock
                            .write_all(b"HTTP/1.1 200 OK\r\nServer: nginx/1.24.0\r\nContent-Length: 0\r\n\r\n")
                            .await;
                    }
                }
            })
        })
        .await;
        let resolver = FingerprintResolver::new("127.0.0.1", Duration::from_millis(1200)).unwrap();
        let r = resolver.resolve(addr).await;
        assert_eq!(r.service, "http");
        assert_eq!(r.product_name.as_deref(), Some("nginx"));
        assert_eq!(r.version.as_deref(), Some("1.24.0"));
        assert_eq!(r.probe_name.as_deref(), Some("GetRequest"));
    }

    #[tokio::test]
    async fn https_server_is_identified_through_tls() {
        let identity = native_tls::Identity::from_pkcs8(
            include_bytes!("testdata/cert.pem"),
            include_bytes!("testdata/key.pem"),
        )
        .unwrap();
        let acceptor = tokio_native_tls::TlsAcceptor::from(native_tls::TlsAcceptor::new(identity).unwrap());
        let addr = serve(move |sock| {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(sock).await else { return };
                let mut buf = [0u8; 512];
                if let Ok(n) = tls.read(&mut buf).await {
                    if buf[..n].starts_with(b"GET ") {
                        let _ = tls
                            .write_all(b"HTTP/1.1 200 OK\r\nServer: nginx/1.24.0\r\nContent-Length: 0\r\n\r\n")
                            .await;
                        let _ = tls.shutdown().await;
                    }
                }
            })
        })
        .await;
        let resolver = FingerprintResolver::new("127.0.0.1", Duration::from_millis(3000)).unwrap();
        let r = resolver.resolve(addr).await;
        assert!(r.tls);
        assert_eq!(r.hostname.as_deref(), Some("glidescan.test"));
        assert!(r.info.as_deref().is_some_and(|i| i.starts_with("issuer: ") && i.contains("glidescan.test")));
        assert_eq!(r.service, "https");
        assert_eq!(r.product_name.as_deref(), Some("nginx"));
        assert_eq!(r.probe_name.as_deref(), Some("GetRequest"));
    }

    #[tokio::test]
    async fn unidentified_port_stays_unknown() {
        let addr = serve(|sock| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                drop(sock);
            })
        })
        .await;
        let resolver = FingerprintResolver::new("127.0.0.1", Duration::from_millis(400)).unwrap();
        let started = std::time::Instant::now();
        let r = resolver.resolve(addr).await;
        assert_eq!(r.service, "unknown");
        assert!(r.banner.is_none());
        assert!(started.elapsed() < resolver.timeouts().total() + Duration::from_millis(200));
    }
}
