use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time;
use tokio_native_tls::{TlsConnector, TlsStream};
use x509_parser::prelude::*;

/// What a completed handshake revealed about the service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsInfo {
    pub alpn: Option<String>,
    pub subject_cn: Option<String>,
    pub organization: Option<String>,
    pub issuer: Option<String>,
    pub dns_names: Vec<String>,
}

impl TlsInfo {
    /// Subject CN, or the first DNS SAN when the CN is missing or a wildcard.
    pub fn hostname(&self) -> Option<String> {
        self.subject_cn
            .iter()
            .chain(self.dns_names.iter())
            .find(|n| !n.starts_with('*'))
            .cloned()
    }

    /// ALPN-based service hint.
    pub fn service_hint(&self) -> Option<&'static str> {
        match self.alpn.as_deref() {
            Some("h2") | Some("http/1.1") => Some("https"),
            _ => None,
        }
    }
}

/// Connector that accepts any certificate: identification, not validation.
pub fn build_connector() -> Result<TlsConnector, native_tls::Error> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .request_alpns(&["h2", "http/1.1"])
        .build()?;
    Ok(TlsConnector::from(connector))
}

/// Handshake within `budget`; `None` when the port does not speak TLS.
pub async fn handshake(
    connector: &TlsConnector,
    addr: SocketAddr,
    domain: &str,
    budget: Duration,
) -> Option<TlsInfo> {
    let attempt = async {
        let tcp = TcpStream::connect(addr).await.ok()?;
        connector.connect(domain, tcp).await.ok()
    };
    let stream = time::timeout(budget, attempt).await.ok()??;
    Some(inspect(&stream))
}

fn inspect(stream: &TlsStream<TcpStream>) -> TlsInfo {
    let inner = stream.get_ref();
    let der = inner
        .peer_certificate()
        .ok()
        .flatten()
        .and_then(|cert| cert.to_der().ok());
    let mut info = der.as_deref().map(parse_certificate).unwrap_or_default();
    info.alpn = inner
        .negotiated_alpn()
        .ok()
        .flatten()
        .map(|p| String::from_utf8_lossy(&p).into_owned());
    info
}

/// Pull naming hints out of a DER certificate. Unparseable input yields an empty info.
pub fn parse_certificate(der: &[u8]) -> TlsInfo {
    let Ok((_, cert)) = X509Certificate::from_der(der) else {
        return TlsInfo::default();
    };
    let subject = cert.subject();
    let subject_cn = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    let organization = subject
        .iter_organization()
        .next()
        .and_then(|o| o.as_str().ok())
        .map(str::to_string);
    let issuer = Some(cert.issuer().to_string()).filter(|s| !s.is_empty());

    let mut dns_names = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::DNSName(dns) = name {
                    dns_names.push(dns.to_string());
                }
            }
        }
    }
    dns_names.dedup();

    TlsInfo {
        alpn: None,
        subject_cn,
        organization,
        issuer,
        dns_names,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_der_is_empty_info() {
        assert_eq!(parse_certificate(b"not a certificate"), TlsInfo::default());
    }

    #[test]
    fn hostname_skips_wildcards() {
        let info = TlsInfo {
            subject_cn: Some("*.example.com".into()),
            dns_names: vec!["*.example.com".into(), "example.com".into()],
            ..Default::default()
        };
        assert_eq!(info.hostname().as_deref(), Some("example.com"));
    }

    #[test]
    fn alpn_hints_https() {
        let info = TlsInfo {
            alpn: Some("h2".into()),
            ..Default::default()
        };
        assert_eq!(info.service_hint(), Some("https"));
        assert_eq!(TlsInfo::default().service_hint(), None);
    }

    #[tokio::test]
    async fn plain_listener_is_not_tls() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                use tokio::io::AsyncWriteExt;
                let _ = sock.write_all(b"SSH-2.0-OpenSSH_9.0\r\n").await;
            }
        });
        let connector = build_connector().unwrap();
        let info = handshake(&connector, addr, "127.0.0.1", Duration::from_millis(500)).await;
        assert!(info.is_none());
    }
}
