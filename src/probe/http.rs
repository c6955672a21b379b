use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{redirect, Client, Response};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};
use url::Url;

use super::Probe;
use crate::error::{Result, ScanError};
use crate::types::{OutcomeDetail, PathResult, ProbeOutcome, WorkItem, WorkTarget};

/// Which HTTP status codes count as a discovered path.
///
/// With an empty allowlist the default rule applies: 2xx, 3xx, 401 and 403.
/// The denylist always wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FoundPolicy {
    pub allow: Vec<u16>,
    pub deny: Vec<u16>,
}

impl Default for FoundPolicy {
    fn default() -> Self {
        Self { allow: Vec::new(), deny: vec![404] }
    }
}

impl FoundPolicy {
    /// Parse `"200,301,403"` into an allowlist. Entries prefixed with `!` are denied.
    pub fn from_codes(codes: &str) -> Result<Self> {
        let mut policy = FoundPolicy::default();
        for raw in codes.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (deny, code) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, raw),
            };
            let code: u16 = code
                .parse()
                .ok()
                .filter(|c| (100..=599).contains(c))
                .ok_or_else(|| ScanError::InvalidStatusCode { input: raw.to_string() })?;
            if deny {
                policy.deny.push(code);
            } else {
                policy.allow.push(code);
            }
        }
        Ok(policy)
    }

    pub fn is_found(&self, status: u16) -> bool {
        if self.deny.contains(&status) {
            return false;
        }
        if !self.allow.is_empty() {
            return self.allow.contains(&status);
        }
        (200..400).contains(&status) || status == 401 || status == 403
    }
}

/// HTTP GET probe against one base URL.
pub struct PathProbe {
    client: Client,
    base: String,
    policy: FoundPolicy,
}

impl PathProbe {
    pub fn new(base: &Url, policy: FoundPolicy, timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base: base.as_str().trim_end_matches('/').to_string(),
            policy,
        })
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    async fn fetch(&self, url: &str) -> reqwest::Result<Response> {
        match self.client.get(url).send().await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                trace!(url, error = %e, "request failed, retrying once");
                self.client.get(url).send().await
            }
        }
    }
}

#[async_trait]
impl Probe<PathResult> for PathProbe {
    async fn probe(&self, item: WorkItem) -> ProbeOutcome<PathResult> {
        let WorkTarget::Path(path) = item.target else {
            return ProbeOutcome::not_found(
                item.ordinal,
                Duration::ZERO,
                OutcomeDetail::LocalFailure("path probe given a non-path item".into()),
            );
        };
        let url = self.url_for(&path);
        let start = Instant::now();
        let resp = match self.fetch(&url).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(url, error = %e, "request failed");
                return ProbeOutcome::not_found(
                    item.ordinal,
                    start.elapsed(),
                    OutcomeDetail::Unreachable(e.to_string()),
                );
            }
        };
        let status = resp.status().as_u16();
        if !self.policy.is_found(status) {
            return ProbeOutcome::not_found(item.ordinal, start.elapsed(), OutcomeDetail::Status(status));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let declared = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let content_length = match declared {
            Some(n) => n,
            None => resp.bytes().await.map(|b| b.len() as u64).unwrap_or(0),
        };
        let record = PathResult {
            path,
            full_url: url,
            status_code: status,
            content_type,
            content_length,
        };
        ProbeOutcome::found(item.ordinal, start.elapsed(), record, OutcomeDetail::Status(status))
    }
}
