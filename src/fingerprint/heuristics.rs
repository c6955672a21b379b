//! Best-effort OS / device classification from collected evidence.
use std::sync::OnceLock;

use regex::Regex;

struct Hint {
    needle: &'static str,
    os: Option<&'static str>,
    device: Option<&'static str>,
}

const fn hint(needle: &'static str, os: Option<&'static str>, device: Option<&'static str>) -> Hint {
    Hint { needle, os, device }
}

// Device-specific needles come first so "routeros" wins over a generic Linux hint.
const HINTS: &[Hint] = &[
    hint("routeros", Some("RouterOS"), Some("router")),
    hint("mikrotik", Some("RouterOS"), Some("router")),
    hint("openwrt", Some("Linux"), Some("router")),
    hint("cisco", Some("IOS"), Some("router")),
    hint("fortigate", Some("FortiOS"), Some("firewall")),
    hint("fortinet", Some("FortiOS"), Some("firewall")),
    hint("hikvision", Some("Linux"), Some("webcam")),
    hint("synology", Some("Linux"), Some("storage-misc")),
    hint("jetdirect", None, Some("printer")),
    hint("cups", None, Some("printer")),
    hint("dropbear", Some("Linux"), Some("embedded")),
    hint("ubuntu", Some("Linux"), None),
    hint("debian", Some("Linux"), None),
    hint("centos", Some("Linux"), None),
    hint("red hat", Some("Linux"), None),
    hint("fedora", Some("Linux"), None),
    hint("raspbian", Some("Linux"), None),
    hint("freebsd", Some("FreeBSD"), None),
    hint("openbsd", Some("OpenBSD"), None),
    hint("microsoft", Some("Windows"), None),
    hint("windows", Some("Windows"), None),
    hint("win32", Some("Windows"), None),
    hint("win64", Some("Windows"), None),
    hint("darwin", Some("macOS"), None),
];

/// Needles compiled to whole-word patterns, in `HINTS` order.
fn needles() -> &'static [(Regex, &'static Hint)] {
    static NEEDLES: OnceLock<Vec<(Regex, &'static Hint)>> = OnceLock::new();
    NEEDLES.get_or_init(|| {
        HINTS
            .iter()
            .filter_map(|h| {
                let re = Regex::new(&format!(r"\b{}\b", regex::escape(h.needle))).ok()?;
                Some((re, h))
            })
            .collect()
    })
}

/// Derived classification. Either field may stay unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub operating_system: Option<String>,
    pub device_type: Option<String>,
}

/// Scan the evidence for known needles as whole words. The first hint supplying a field wins.
pub fn classify<'a>(evidence: impl IntoIterator<Item = &'a str>) -> Classification {
    let haystack = evidence
        .into_iter()
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("\n");
    let mut out = Classification::default();
    for (re, h) in needles() {
        if !re.is_match(&haystack) {
            continue;
        }
        if out.operating_system.is_none() {
            out.operating_system = h.os.map(str::to_string);
        }
        if out.device_type.is_none() {
            out.device_type = h.device.map(str::to_string);
        }
        if out.operating_system.is_some() && out.device_type.is_some() {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distro_maps_to_linux() {
        let c = classify(["SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.4"]);
        assert_eq!(c.operating_system.as_deref(), Some("Linux"));
        assert!(c.device_type.is_none());
    }

    #[test]
    fn device_hint_wins() {
        let c = classify(["SSH-2.0-ROSSSH", "MikroTik RouterOS sshd"]);
        assert_eq!(c.operating_system.as_deref(), Some("RouterOS"));
        assert_eq!(c.device_type.as_deref(), Some("router"));
    }

    #[test]
    fn iis_is_windows() {
        let c = classify(["Microsoft-IIS"]);
        assert_eq!(c.operating_system.as_deref(), Some("Windows"));
    }

    #[test]
    fn needles_match_whole_words_only() {
        assert_eq!(classify(["Hiccups Bakery LLC", "sanfrancisco.example"]), Classification::default());
        let c = classify(["CUPS/2.4 IPP/2.1"]);
        assert_eq!(c.device_type.as_deref(), Some("printer"));
        let c = classify(["Cisco Systems, Inc."]);
        assert_eq!(c.device_type.as_deref(), Some("router"));
    }

    #[test]
    fn nothing_known() {
        assert_eq!(classify(["+PONG"]), Classification::default());
        assert_eq!(classify(Vec::<&str>::new()), Classification::default());
    }
}
