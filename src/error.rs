use std::path::PathBuf;

use thiserror::Error;

use crate::types::ScanKind;

/// Errors surfaced by the engine at the session level.
///
/// Per-item probe failures never show up here: they are folded into
/// [`ProbeOutcome`](crate::types::ProbeOutcome)s and counted as scanned.
#[derive(Error, Debug)]
pub enum ScanError {
    // === configuration ===
    #[error("invalid port range {start}-{end} (ports must be 1-65535 and start <= end)")]
    InvalidPortRange { start: u32, end: u32 },

    #[error("invalid port or port range: '{input}'")]
    InvalidPort { input: String },

    #[error("invalid concurrency limit {value} (must be between 1 and {max})")]
    InvalidConcurrency { value: usize, max: usize },

    #[error("invalid probe timeout: must be greater than zero")]
    InvalidTimeout,

    #[error("scan target must not be empty")]
    EmptyTarget,

    #[error("invalid base URL '{input}': {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("invalid HTTP status code '{input}'")]
    InvalidStatusCode { input: String },

    #[error("wordlist is empty or contains no valid entries")]
    EmptyWordlist,

    #[error("failed to load wordlist from '{path}': {source}")]
    Wordlist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to build TLS connector: {0}")]
    Tls(#[from] native_tls::Error),

    // === session-fatal ===
    #[error("failed to resolve target '{target}': {reason}")]
    Resolve { target: String, reason: String },

    #[error("unable to open sockets to the target: {detail}")]
    NoSockets { detail: String },

    // === lifecycle ===
    #[error("a {0} session is already running")]
    Busy(ScanKind),

    #[error("session cannot {action} while {status}")]
    InvalidState {
        action: &'static str,
        status: crate::types::ScanStatus,
    },
}

impl ScanError {
    /// True for errors caused by the request itself, detected before any probe runs.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ScanError::InvalidPortRange { .. }
                | ScanError::InvalidPort { .. }
                | ScanError::InvalidConcurrency { .. }
                | ScanError::InvalidTimeout
                | ScanError::EmptyTarget
                | ScanError::InvalidUrl { .. }
                | ScanError::InvalidStatusCode { .. }
                | ScanError::EmptyWordlist
                | ScanError::Wordlist { .. }
        )
    }
}

pub type Result<T, E = ScanError> = std::result::Result<T, E>;
