//! In-memory execution log
//!
//! Entries are kept in ingestion order with a secondary index per binding.
//! Each entry sits behind its own lock so a running execution can update it
//! without holding the store lock.

use super::bindings::ActionBinding;
use super::DEFAULT_EXIT_CODE_NOT_EXECUTED;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InternalLogEntry {
    pub execution_tracking_id: String,
    pub binding_id: String,
    pub action_config_title: String,
    pub action_title: String,
    pub action_icon: String,
    pub action_id: String,
    /// Unique key of the binding's entity, empty for plain actions
    pub entity_prefix: String,
    pub datetime_started: Option<DateTime<Utc>>,
    pub datetime_finished: Option<DateTime<Utc>>,
    pub output: String,
    pub timed_out: bool,
    pub blocked: bool,
    pub exit_code: i32,
    pub tags: Vec<String>,
    pub execution_started: bool,
    pub execution_finished: bool,
    pub username: String,
    pub index: usize,
    pub trigger_depth: u32,

    /// Kept for restarts; never written to disk since it may hold passwords
    #[serde(skip)]
    pub arguments: BTreeMap<String, String>,
    #[serde(skip)]
    pub pid: Option<u32>,
    #[serde(skip)]
    pub binding: Option<Arc<ActionBinding>>,
}

impl Default for InternalLogEntry {
    fn default() -> Self {
        Self {
            execution_tracking_id: String::new(),
            binding_id: String::new(),
            action_config_title: String::new(),
            action_title: String::new(),
            action_icon: String::new(),
            action_id: String::new(),
            entity_prefix: String::new(),
            datetime_started: None,
            datetime_finished: None,
            output: String::new(),
            timed_out: false,
            blocked: false,
            exit_code: DEFAULT_EXIT_CODE_NOT_EXECUTED,
            tags: Vec::new(),
            execution_started: false,
            execution_finished: false,
            username: String::new(),
            index: 0,
            trigger_depth: 0,
            arguments: BTreeMap::new(),
            pid: None,
            binding: None,
        }
    }
}

impl PartialEq for InternalLogEntry {
    // The binding and process handle are runtime only.
    fn eq(&self, other: &Self) -> bool {
        serde_json::to_value(self).ok() == serde_json::to_value(other).ok()
    }
}

pub type LogEntryHandle = Arc<RwLock<InternalLogEntry>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PagingResult {
    pub total_count: usize,
    pub page_size: usize,
    pub start_offset: usize,
    /// Entries older than this page
    pub count_remaining: usize,
}

/// Picks a page out of `items` (oldest first) and returns it newest first.
/// Offset 0 is the newest page.
pub fn paginate<T: Clone>(items: &[T], start_offset: i64, page_size: i64) -> (Vec<T>, PagingResult) {
    let total = items.len();
    let start_offset = start_offset.max(0) as usize;
    let page_size = page_size.max(0) as usize;

    let end = total.saturating_sub(start_offset);
    let begin = end.saturating_sub(page_size);

    let page: Vec<T> = items[begin..end].iter().rev().cloned().collect();

    let paging = PagingResult {
        total_count: total,
        page_size,
        start_offset,
        count_remaining: begin,
    };

    (page, paging)
}

impl PagingResult {
    /// Offset to request the following (older) page with.
    pub fn next_offset(&self) -> Option<usize> {
        if self.count_remaining == 0 {
            None
        } else {
            Some(self.total_count - self.count_remaining)
        }
    }
}

#[derive(Default)]
struct LogIndex {
    by_id: HashMap<String, LogEntryHandle>,
    order: Vec<String>,
    by_binding: HashMap<String, Vec<LogEntryHandle>>,
}

#[derive(Default)]
pub struct LogStore {
    inner: RwLock<LogIndex>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry, assigning its index. An empty or already used
    /// tracking ID is replaced with a fresh one.
    pub async fn insert(&self, mut entry: InternalLogEntry) -> LogEntryHandle {
        let mut inner = self.inner.write().await;

        if entry.execution_tracking_id.is_empty() || inner.by_id.contains_key(&entry.execution_tracking_id) {
            entry.execution_tracking_id = uuid::Uuid::new_v4().to_string();
        }

        entry.index = inner.order.len();

        let id = entry.execution_tracking_id.clone();
        let handle = Arc::new(RwLock::new(entry));
        inner.order.push(id.clone());
        inner.by_id.insert(id, Arc::clone(&handle));

        handle
    }

    /// Adds an entry to a binding's history.
    pub async fn enroll(&self, binding_id: &str, handle: &LogEntryHandle) {
        self.inner
            .write()
            .await
            .by_binding
            .entry(binding_id.to_string())
            .or_default()
            .push(Arc::clone(handle));
    }

    /// Loads previously saved entries, oldest first. Duplicates are skipped.
    /// Returns how many were added.
    pub async fn restore(&self, entries: Vec<InternalLogEntry>) -> usize {
        let mut inner = self.inner.write().await;
        let mut added = 0;

        for mut entry in entries {
            if inner.by_id.contains_key(&entry.execution_tracking_id) {
                continue;
            }

            entry.index = inner.order.len();
            let id = entry.execution_tracking_id.clone();
            let binding_id = entry.binding.as_ref().map(|b| b.id.clone());
            let handle = Arc::new(RwLock::new(entry));

            inner.order.push(id.clone());
            inner.by_id.insert(id, Arc::clone(&handle));
            if let Some(binding_id) = binding_id {
                inner.by_binding.entry(binding_id).or_default().push(handle);
            }
            added += 1;
        }

        added
    }

    pub async fn get(&self, tracking_id: &str) -> Option<LogEntryHandle> {
        self.inner.read().await.by_id.get(tracking_id).cloned()
    }

    pub async fn contains(&self, tracking_id: &str) -> bool {
        self.inner.read().await.by_id.contains_key(tracking_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.order.is_empty()
    }

    /// All entries, oldest first.
    pub async fn all(&self) -> Vec<LogEntryHandle> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    /// A binding's entries, oldest first.
    pub async fn by_binding(&self, binding_id: &str) -> Vec<LogEntryHandle> {
        self.inner
            .read()
            .await
            .by_binding
            .get(binding_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn page(&self, start_offset: i64, page_size: i64) -> (Vec<LogEntryHandle>, PagingResult) {
        let inner = self.inner.read().await;
        let (ids, paging) = paginate(&inner.order, start_offset, page_size);
        let page = ids.iter().filter_map(|id| inner.by_id.get(id).cloned()).collect();
        (page, paging)
    }

    /// Snapshots every entry that passes `keep`, oldest first.
    pub async fn snapshots_where<F>(&self, mut keep: F) -> Vec<InternalLogEntry>
    where
        F: FnMut(&InternalLogEntry) -> bool,
    {
        let mut out = Vec::new();
        for handle in self.all().await {
            let entry = handle.read().await;
            if keep(&entry) {
                out.push(entry.clone());
            }
        }
        out
    }
}

/// `YYYY-MM-DD`, matched against the UTC start day. Empty matches everything.
pub fn matches_date_filter(entry: &InternalLogEntry, filter: &str) -> bool {
    if filter.is_empty() {
        return true;
    }

    let Ok(day) = NaiveDate::parse_from_str(filter, "%Y-%m-%d") else {
        return true;
    };

    entry
        .datetime_started
        .map(|started| started.date_naive() == day)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(id: &str) -> InternalLogEntry {
        InternalLogEntry {
            execution_tracking_id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_page_is_newest_first() {
        let items: Vec<u32> = (0..25).collect();
        let (page, paging) = paginate(&items, 0, 10);

        assert_eq!(page, (15..25).rev().collect::<Vec<_>>());
        assert_eq!(paging.count_remaining, 15);
        assert_eq!(paging.next_offset(), Some(10));
    }

    #[test]
    fn test_paging_enumerates_everything_once() {
        for total in [0usize, 1, 9, 10, 11, 37] {
            for page_size in [1i64, 3, 10] {
                let items: Vec<usize> = (0..total).collect();
                let mut seen = Vec::new();
                let mut offset = 0i64;

                loop {
                    let (page, paging) = paginate(&items, offset, page_size);
                    seen.extend(page);
                    match paging.next_offset() {
                        Some(next) => offset = next as i64,
                        None => break,
                    }
                }

                seen.sort();
                assert_eq!(seen, items, "total={} page_size={}", total, page_size);
            }
        }
    }

    #[test]
    fn test_out_of_range_offsets() {
        let items: Vec<u32> = (0..5).collect();

        let (page, _) = paginate(&items, -4, 2);
        assert_eq!(page, vec![4, 3]);

        let (page, paging) = paginate(&items, 50, 2);
        assert!(page.is_empty());
        assert_eq!(paging.count_remaining, 0);
    }

    #[tokio::test]
    async fn test_insert_assigns_index_and_unique_ids() {
        let store = LogStore::new();

        let a = store.insert(entry("same")).await;
        let b = store.insert(entry("same")).await;
        let c = store.insert(entry("")).await;

        let (a, b, c) = (a.read().await.clone(), b.read().await.clone(), c.read().await.clone());
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 1);
        assert_eq!(c.index, 2);
        assert_eq!(a.execution_tracking_id, "same");
        assert_ne!(b.execution_tracking_id, "same");
        assert!(!c.execution_tracking_id.is_empty());
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_store_page_and_binding_index() {
        let store = LogStore::new();
        for i in 0..4 {
            let handle = store.insert(entry(&format!("t{}", i))).await;
            if i % 2 == 0 {
                store.enroll("even", &handle).await;
            }
        }

        let (page, paging) = store.page(0, 3).await;
        let mut ids = Vec::new();
        for h in page {
            ids.push(h.read().await.execution_tracking_id.clone());
        }
        assert_eq!(ids, vec!["t3", "t2", "t1"]);
        assert_eq!(paging.total_count, 4);

        assert_eq!(store.by_binding("even").await.len(), 2);
        assert!(store.by_binding("odd").await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_skips_duplicates() {
        let store = LogStore::new();
        store.insert(entry("a")).await;

        let added = store.restore(vec![entry("a"), entry("b")]).await;

        assert_eq!(added, 1);
        assert_eq!(store.get("b").await.unwrap().read().await.index, 1);
    }

    #[test]
    fn test_date_filter() {
        let mut e = entry("x");
        e.datetime_started = Some("2024-03-01T23:30:00Z".parse().unwrap());

        assert!(matches_date_filter(&e, ""));
        assert!(matches_date_filter(&e, "2024-03-01"));
        assert!(!matches_date_filter(&e, "2024-03-02"));
    }

    #[test]
    fn test_missing_exit_code_deserializes_to_sentinel() {
        let e: InternalLogEntry = serde_yaml_ng::from_str("executionTrackingId: abc\n").unwrap();
        assert_eq!(e.exit_code, DEFAULT_EXIT_CODE_NOT_EXECUTED);
    }
}
