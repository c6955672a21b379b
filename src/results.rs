use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Mutex;

use serde::Deserialize;

use crate::types::{PathResult, PortResult};

/// A result type the collector can hold, with its externally visible natural order.
pub trait ScanRecord: Clone + Send + Sync + 'static {
    /// Put a copy of the stored results into their natural order. Must be a stable sort.
    fn arrange(items: &mut [Self]);
}

impl ScanRecord for PortResult {
    fn arrange(items: &mut [Self]) {
        items.sort_by_key(|r| r.port);
    }
}

impl ScanRecord for PathResult {
    /// Discovery order.
    fn arrange(_items: &mut [Self]) {}
}

struct Inner<R> {
    items: Vec<R>,
    ordinals: HashSet<u64>,
}

/// Exclusive-append accumulation of discovered results.
///
/// All mutation goes through [`push`](Self::push); readers get ordered copies.
pub struct ResultCollector<R> {
    inner: Mutex<Inner<R>>,
}

impl<R: ScanRecord> ResultCollector<R> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: Vec::new(),
                ordinals: HashSet::new(),
            }),
        }
    }

    /// Append a result for work item `ordinal`. Returns false for a duplicate ordinal.
    pub fn push(&self, ordinal: u64, record: R) -> bool {
        let mut guard = lock(&self.inner);
        if !guard.ordinals.insert(ordinal) {
            return false;
        }
        guard.items.push(record);
        true
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Results in natural order.
    pub fn snapshot(&self) -> Vec<R> {
        let mut items = lock(&self.inner).items.clone();
        R::arrange(&mut items);
        items
    }

    pub(crate) fn clear(&self) {
        let mut guard = lock(&self.inner);
        guard.items.clear();
        guard.ordinals.clear();
    }
}

impl<R: ScanRecord> Default for ResultCollector<R> {
    fn default() -> Self {
        Self::new()
    }
}

// A panicking pusher cannot leave the Vec half-written, so the data stays usable.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PathSortKey {
    Path,
    FullUrl,
    StatusCode,
    ContentType,
    ContentLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl ResultCollector<PathResult> {
    /// Discovery-ordered results re-sorted by `key`. Equal keys keep discovery order.
    pub fn sorted_by(&self, key: PathSortKey, order: SortOrder) -> Vec<PathResult> {
        let mut items = self.snapshot();
        sort_paths(&mut items, key, order);
        items
    }
}

pub fn sort_paths(items: &mut [PathResult], key: PathSortKey, order: SortOrder) {
    items.sort_by(|a, b| {
        let ord = compare_paths(a, b, key);
        match order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    });
}

fn compare_paths(a: &PathResult, b: &PathResult, key: PathSortKey) -> Ordering {
    match key {
        PathSortKey::Path => a.path.cmp(&b.path),
        PathSortKey::FullUrl => a.full_url.cmp(&b.full_url),
        PathSortKey::StatusCode => a.status_code.cmp(&b.status_code),
        PathSortKey::ContentType => a.content_type.cmp(&b.content_type),
        PathSortKey::ContentLength => a.content_length.cmp(&b.content_length),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn path(p: &str, status: u16, len: u64) -> PathResult {
        PathResult {
            path: p.to_string(),
            full_url: format!("http://h{p}"),
            status_code: status,
            content_type: "text/html".to_string(),
            content_length: len,
        }
    }

    #[test]
    fn ports_come_out_ascending() {
        let c = ResultCollector::new();
        c.push(2, PortResult::open(443));
        c.push(0, PortResult::open(22));
        c.push(1, PortResult::open(80));
        let ports: Vec<u16> = c.snapshot().into_iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![22, 80, 443]);
    }

    #[test]
    fn duplicate_ordinal_is_rejected() {
        let c = ResultCollector::new();
        assert!(c.push(7, PortResult::open(7)));
        assert!(!c.push(7, PortResult::open(7)));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn paths_keep_discovery_order_and_sort_stably() {
        let c = ResultCollector::new();
        c.push(0, path("/b", 200, 10));
        c.push(1, path("/a", 403, 10));
        c.push(2, path("/c", 200, 5));
        let discovery: Vec<String> = c.snapshot().into_iter().map(|r| r.path).collect();
        assert_eq!(discovery, vec!["/b", "/a", "/c"]);

        let by_status: Vec<String> = c
            .sorted_by(PathSortKey::StatusCode, SortOrder::Asc)
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(by_status, vec!["/b", "/c", "/a"]);

        let by_len_desc: Vec<String> = c
            .sorted_by(PathSortKey::ContentLength, SortOrder::Desc)
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(by_len_desc, vec!["/b", "/a", "/c"]);

        // the stored sequence is untouched by sorted views
        assert_eq!(c.snapshot()[0].path, "/b");
    }

    #[test]
    fn concurrent_pushes_lose_nothing() {
        let c = Arc::new(ResultCollector::new());
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        let ordinal = t * 100 + i;
                        c.push(ordinal, PortResult::open(ordinal as u16 + 1));
                        // every thread also retries a shared ordinal
                        c.push(0, PortResult::open(1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.len(), 800);
    }
}
