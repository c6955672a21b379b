use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Result, ScanError};

/// A normalised, deduplicated list of path candidates.
///
/// Normalisation rules per entry:
/// - surrounding whitespace is trimmed
/// - blank lines and `#` comment lines are skipped
/// - leading and trailing slashes are stripped, then a single `/` is prepended
///
/// Duplicates after normalisation are dropped, keeping first-seen order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wordlist {
    paths: Arc<[String]>,
}

impl Wordlist {
    pub fn from_lines<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for line in lines {
            if let Some(path) = normalize_entry(line.as_ref()) {
                if seen.insert(path.clone()) {
                    out.push(path);
                }
            }
        }
        if out.is_empty() {
            return Err(ScanError::EmptyWordlist);
        }
        Ok(Self { paths: out.into() })
    }

    /// Parse newline-separated wordlist content.
    pub fn parse(content: &str) -> Result<Self> {
        Self::from_lines(content.lines())
    }

    /// Read and parse a wordlist file without blocking the runtime.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|source| ScanError::Wordlist {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Shared handle for lazy iteration by an owner that outlives `self`.
    pub(crate) fn shared(&self) -> Arc<[String]> {
        Arc::clone(&self.paths)
    }
}

fn normalize_entry(raw: &str) -> Option<String> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let stripped = line.trim_matches('/');
    if stripped.is_empty() {
        return None;
    }
    Some(format!("/{stripped}"))
}
