//! Probe clients: one unit of work each, never failing at the session level.
pub mod http;
pub mod tcp;

use async_trait::async_trait;

use crate::types::{ProbeOutcome, WorkItem};

/// Executes a single [`WorkItem`].
///
/// Implementations fold every per-item error into the returned outcome; the worker pool
/// expects exactly one outcome per call.
#[async_trait]
pub trait Probe<R>: Send + Sync {
    async fn probe(&self, item: WorkItem) -> ProbeOutcome<R>;
}
