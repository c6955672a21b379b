//! Ordered service signature rules and the active probe catalogue.
use std::sync::OnceLock;

use regex::bytes::{Captures, Regex};

/// What a matching rule identified. Captured groups override the rule's static fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMatch {
    pub service: String,
    pub product: Option<String>,
    pub version: Option<String>,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub device: Option<String>,
    pub info: Option<String>,
}

struct RuleDef {
    service: &'static str,
    pattern: &'static str,
    product: Option<&'static str>,
    os: Option<&'static str>,
    /// Only consider this rule for responses to the named active probe.
    probe: Option<&'static str>,
}

const fn rule(service: &'static str, pattern: &'static str) -> RuleDef {
    RuleDef { service, pattern, product: None, os: None, probe: None }
}

const fn product(service: &'static str, pattern: &'static str, product: &'static str) -> RuleDef {
    RuleDef { service, pattern, product: Some(product), os: None, probe: None }
}

// Patterns run with Unicode disabled so `\xNN` means a raw byte. First match wins,
// so specific products sit above the generic rule for the same service.
const RULES: &[RuleDef] = &[
    product(
        "ssh",
        r"^SSH-(?P<info>[\d.]+)-OpenSSH[_-](?P<version>[\w.]+)(?:[ -](?P<os>[A-Za-z]+))?",
        "OpenSSH",
    ),
    product("ssh", r"^SSH-[\d.]+-dropbear_(?P<version>[\w.]+)", "Dropbear sshd"),
    product("ssh", r"^SSH-[\d.]+-ROSSSH", "MikroTik RouterOS sshd"),
    rule("ssh", r"^SSH-(?P<info>[\d.]+)-(?P<product>[^\s]+)"),
    product("ftp", r"^220[ -][^\r\n]*\(vsFTPd (?P<version>[\d.]+)\)", "vsftpd"),
    product("ftp", r"^220[ -][^\r\n]*ProFTPD (?P<version>[\d.]+)", "ProFTPD"),
    RuleDef {
        service: "ftp",
        pattern: r"^220[ -][^\r\n]*FileZilla Server(?: version)? ?(?P<version>[\w.]+)?",
        product: Some("FileZilla ftpd"),
        os: Some("Windows"),
        probe: None,
    },
    product("ftp", r"^220[ -][^\r\n]*MikroTik FTP server \(MikroTik (?P<version>[\w.]+)\)", "MikroTik router ftpd"),
    product("ftp", r"^220[ -][^\r\n]*Pure-FTPd", "Pure-FTPd"),
    product("smtp", r"^220 (?P<hostname>[\w.-]+) ESMTP Postfix(?: \((?P<os>[A-Za-z]+)\))?", "Postfix smtpd"),
    product("smtp", r"^220 (?P<hostname>[\w.-]+) ESMTP Exim (?P<version>[\d.]+)", "Exim smtpd"),
    RuleDef {
        service: "smtp",
        pattern: r"^220 (?P<hostname>[\w.-]+) Microsoft ESMTP MAIL Service",
        product: Some("Microsoft ESMTP"),
        os: Some("Windows"),
        probe: None,
    },
    rule("smtp", r"(?i)^220[ -](?P<hostname>[\w.-]+) [^\r\n]*smtp"),
    rule("ftp", r"(?i)^220[ -][^\r\n]*ftp"),
    product("pop3", r"^\+OK [^\r\n]*Dovecot", "Dovecot pop3d"),
    rule("pop3", r"^\+OK"),
    product("imap", r"^\* OK [^\r\n]*Dovecot", "Dovecot imapd"),
    rule("imap", r"(?i)^\* OK [^\r\n]*imap"),
    rule(
        "http",
        r"(?s)^HTTP/1\.[01] \d{3}.*?\r\n(?i:server): ?(?P<product>[^/\r\n(]+?)(?:/(?P<version>[^\s\r\n]+))?(?: \((?P<os>[^)\r\n]+)\))?\r\n",
    ),
    rule("http", r"^HTTP/1\.[01] \d{3}"),
    product(
        "mysql",
        r"(?s)^.{3}\x00\x0a(?P<version>[\w.~+-]*MariaDB[\w.~+-]*)\x00",
        "MariaDB",
    ),
    product("mysql", r"(?s)^.{3}\x00\x0a(?P<version>\d[\w.~+-]*)\x00", "MySQL"),
    product(
        "mysql",
        r"(?s)^.{3}\x00\xff.{2}Host [^\x00]*is not allowed to connect to this (?:MySQL|MariaDB) server",
        "MySQL",
    ),
    product("redis", r"(?s)^\$\d+\r\n.*?redis_version:(?P<version>[\d.]+)", "Redis key-value store"),
    product("redis", r"^(?:\+PONG|-NOAUTH|-DENIED Redis)", "Redis key-value store"),
    product("memcached", r"^VERSION (?P<version>[\d.]+)", "Memcached"),
    product("vnc", r"^RFB (?P<version>\d{3}\.\d{3})\n", "VNC"),
    rule("telnet", r"^\xff[\xfb-\xfe]"),
    rule("rtsp", r"^RTSP/1\.0 \d{3}"),
    rule("amqp", r"^AMQP"),
    RuleDef {
        service: "postgresql",
        pattern: r"^[SN]\z",
        product: Some("PostgreSQL DB"),
        os: None,
        probe: Some("PostgresSslRequest"),
    },
    rule("http", r"HTTP/1\.[01] \d{3}"),
];

struct Signature {
    def: &'static RuleDef,
    regex: Regex,
}

fn signatures() -> &'static [Signature] {
    static COMPILED: OnceLock<Vec<Signature>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        RULES
            .iter()
            .filter_map(|def| match Regex::new(&format!("(?-u){}", def.pattern)) {
                Ok(regex) => Some(Signature { def, regex }),
                Err(e) => {
                    tracing::error!(service = def.service, error = %e, "invalid signature pattern");
                    None
                }
            })
            .collect()
    })
}

/// Match a response against the ordered rules. `probe` names the active probe that elicited
/// it, or `None` for an unsolicited banner.
pub fn match_response(data: &[u8], probe: Option<&str>) -> Option<ServiceMatch> {
    if data.is_empty() {
        return None;
    }
    signatures().iter().find_map(|sig| {
        if sig.def.probe.is_some() && sig.def.probe != probe {
            return None;
        }
        let caps = sig.regex.captures(data)?;
        Some(build_match(sig.def, &caps))
    })
}

fn build_match(def: &RuleDef, caps: &Captures<'_>) -> ServiceMatch {
    let group = |name: &str| {
        caps.name(name)
            .map(|m| String::from_utf8_lossy(m.as_bytes()).trim().to_string())
            .filter(|s| !s.is_empty())
    };
    ServiceMatch {
        service: def.service.to_string(),
        product: group("product").or_else(|| def.product.map(str::to_string)),
        version: group("version"),
        hostname: group("hostname"),
        os: group("os").or_else(|| def.os.map(str::to_string)),
        device: None,
        info: group("info").map(|v| format!("protocol {v}")),
    }
}

/// A payload sent to a silent port to coax out an identifiable response.
#[derive(Debug)]
pub struct ActiveProbe {
    pub name: &'static str,
    pub payload: &'static [u8],
    /// Ports where this probe is tried first.
    pub ports: &'static [u16],
    /// Also tried on ports without a hint.
    pub generic: bool,
}

pub const ACTIVE_PROBES: &[ActiveProbe] = &[
    ActiveProbe {
        name: "GetRequest",
        payload: b"GET / HTTP/1.0\r\n\r\n",
        ports: &[80, 443, 3000, 5000, 8000, 8008, 8080, 8081, 8443, 8888, 9000, 9200],
        generic: true,
    },
    ActiveProbe {
        name: "RedisPing",
        payload: b"*1\r\n$4\r\nPING\r\n",
        ports: &[6379],
        generic: false,
    },
    ActiveProbe {
        name: "MemcachedVersion",
        payload: b"version\r\n",
        ports: &[11211],
        generic: false,
    },
    ActiveProbe {
        name: "PostgresSslRequest",
        payload: &[0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f],
        ports: &[5432],
        generic: false,
    },
    ActiveProbe {
        name: "GenericLines",
        payload: b"\r\n\r\n",
        ports: &[],
        generic: true,
    },
];

/// Probes hinted for `port` first, then the generic ones, each in catalogue order.
pub fn probes_for(port: u16) -> Vec<&'static ActiveProbe> {
    let (hinted, rest): (Vec<_>, Vec<_>) =
        ACTIVE_PROBES.iter().partition(|p| p.ports.contains(&port));
    hinted
        .into_iter()
        .chain(rest.into_iter().filter(|p| p.generic))
        .collect()
}
