//! Filter registration storage.

use crate::{
    connection::ConnectionId,
    cursor::PollCursor,
    error::StoreError,
    kind::{FilterId, FilterKind},
};
use dashmap::DashMap;
use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// A registered filter.
///
/// The kind and connection binding are immutable. The poll cursor sits
/// behind an async lock scoped to this record: polls of the same filter
/// are serialized, polls of different filters never contend.
#[derive(Debug)]
pub struct FilterEntry {
    id: FilterId,
    kind: FilterKind,
    connection: Option<ConnectionId>,
    cursor: Mutex<PollCursor>,
}

impl core::fmt::Display for FilterEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "FilterEntry {{ id: {}, kind: {}, connection: {:?} }}",
            self.id,
            self.kind.name(),
            self.connection
        )
    }
}

impl FilterEntry {
    /// Create a new filter record.
    pub fn new(
        id: FilterId,
        kind: FilterKind,
        connection: Option<ConnectionId>,
        cursor: PollCursor,
    ) -> Self {
        Self { id, kind, connection, cursor: Mutex::new(cursor) }
    }

    /// The filter ID.
    pub const fn id(&self) -> FilterId {
        self.id
    }

    /// The filter kind and parameters.
    pub const fn kind(&self) -> &FilterKind {
        &self.kind
    }

    /// The push connection this filter is bound to, if any.
    pub const fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// The poll cursor. Hold the guard for the duration of a poll.
    pub const fn cursor(&self) -> &Mutex<PollCursor> {
        &self.cursor
    }

    /// True if this is a poll-mode filter that has not been polled within
    /// `older_than`. A filter that is being polled right now is not stale.
    fn is_stale(&self, older_than: Duration) -> bool {
        self.connection.is_none()
            && self.cursor.try_lock().is_ok_and(|c| c.time_since_last_poll() >= older_than)
    }
}

/// Storage for filter registrations, keyed by [`FilterId`].
///
/// Implementations must allow concurrent access to independent filters.
/// Records are handed out as [`Arc`]s so callers never hold a store lock
/// while awaiting.
pub trait FilterStore: Send + Sync + core::fmt::Debug + 'static {
    /// Store a new filter, assigning it a fresh ID.
    fn create(
        &self,
        kind: FilterKind,
        connection: Option<ConnectionId>,
        cursor: PollCursor,
    ) -> Result<FilterId, StoreError>;

    /// Look up a filter.
    fn get(&self, id: FilterId) -> Result<Option<Arc<FilterEntry>>, StoreError>;

    /// Remove a filter. Returns `false` if it did not exist.
    fn delete(&self, id: FilterId) -> Result<bool, StoreError>;

    /// All block filters bound to a connection.
    fn all_block_filters_with_connection(&self) -> Result<Vec<Arc<FilterEntry>>, StoreError>;

    /// All log filters bound to a connection.
    fn all_log_filters_with_connection(&self) -> Result<Vec<Arc<FilterEntry>>, StoreError>;

    /// Remove every filter bound to `connection`, returning how many were
    /// removed.
    fn delete_by_connection(&self, connection: ConnectionId) -> Result<usize, StoreError>;

    /// Remove poll-mode filters not polled within `older_than`, returning
    /// how many were removed.
    fn clean_stale(&self, older_than: Duration) -> Result<usize, StoreError>;
}

/// Inner logic for [`MemFilterStore`].
#[derive(Debug)]
pub struct MemFilterStoreInner {
    current_id: AtomicU64,
    filters: DashMap<FilterId, Arc<FilterEntry>>,
}

impl MemFilterStoreInner {
    fn new() -> Self {
        // Start from 1, as 0 is weird in quantity encoding.
        Self { current_id: AtomicU64::new(1), filters: DashMap::new() }
    }

    fn next_id(&self) -> FilterId {
        FilterId::from(self.current_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of registered filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// True if no filters are registered.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    fn with_connection(&self, pred: impl Fn(&FilterKind) -> bool) -> Vec<Arc<FilterEntry>> {
        self.filters
            .iter()
            .filter(|entry| entry.connection().is_some() && pred(entry.kind()))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn remove_where(&self, pred: impl Fn(&FilterEntry) -> bool) -> usize {
        let mut removed = 0;
        self.filters.retain(|_, entry| {
            let remove = pred(entry);
            removed += usize::from(remove);
            !remove
        });
        removed
    }
}

/// In-memory [`FilterStore`].
///
/// Filters are stored in a [`DashMap`] that maps filter IDs to records.
/// Filter IDs are assigned sequentially, starting from 1. Cloning is cheap,
/// all clones share the same table.
///
/// [`Self::spawn_cleaner`] starts a thread that periodically removes stale
/// poll-mode filters. It runs on a separate thread to avoid
/// [`DashMap::retain`] deadlock. See [`DashMap`] documentation for more
/// information.
#[derive(Debug, Clone)]
pub struct MemFilterStore {
    inner: Arc<MemFilterStoreInner>,
}

impl Default for MemFilterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFilterStore {
    /// Create an empty store without a cleaner.
    pub fn new() -> Self {
        Self { inner: Arc::new(MemFilterStoreInner::new()) }
    }

    /// Spawn a thread that removes poll-mode filters not polled within
    /// `age_limit`, every `clean_interval`. The thread exits once every
    /// clone of the store has been dropped.
    pub fn spawn_cleaner(&self, clean_interval: Duration, age_limit: Duration) -> JoinHandle<()> {
        FilterCleanTask::new(Arc::downgrade(&self.inner), clean_interval, age_limit).spawn()
    }
}

impl std::ops::Deref for MemFilterStore {
    type Target = MemFilterStoreInner;

    fn deref(&self) -> &Self::Target {
        self.inner.deref()
    }
}

impl FilterStore for MemFilterStore {
    fn create(
        &self,
        kind: FilterKind,
        connection: Option<ConnectionId>,
        cursor: PollCursor,
    ) -> Result<FilterId, StoreError> {
        let id = self.next_id();
        let _ = self.filters.insert(id, Arc::new(FilterEntry::new(id, kind, connection, cursor)));
        Ok(id)
    }

    fn get(&self, id: FilterId) -> Result<Option<Arc<FilterEntry>>, StoreError> {
        Ok(self.filters.get(&id).map(|entry| Arc::clone(entry.value())))
    }

    fn delete(&self, id: FilterId) -> Result<bool, StoreError> {
        Ok(self.filters.remove(&id).is_some())
    }

    fn all_block_filters_with_connection(&self) -> Result<Vec<Arc<FilterEntry>>, StoreError> {
        Ok(self.with_connection(FilterKind::is_block))
    }

    fn all_log_filters_with_connection(&self) -> Result<Vec<Arc<FilterEntry>>, StoreError> {
        Ok(self.with_connection(FilterKind::is_log))
    }

    fn delete_by_connection(&self, connection: ConnectionId) -> Result<usize, StoreError> {
        Ok(self.remove_where(|entry| entry.connection() == Some(connection)))
    }

    fn clean_stale(&self, older_than: Duration) -> Result<usize, StoreError> {
        Ok(self.remove_where(|entry| entry.is_stale(older_than)))
    }
}

/// Task to clean up unpolled filters.
///
/// This task runs on a separate thread to avoid [`DashMap::retain`] deadlocks.
#[derive(Debug)]
struct FilterCleanTask {
    store: Weak<MemFilterStoreInner>,
    sleep: Duration,
    age_limit: Duration,
}

impl FilterCleanTask {
    /// Create a new filter cleaner task.
    const fn new(store: Weak<MemFilterStoreInner>, sleep: Duration, age_limit: Duration) -> Self {
        Self { store, sleep, age_limit }
    }

    /// Run the task. This task runs on a separate thread, which ensures that
    /// [`DashMap::retain`]'s deadlock condition is not met. See [`DashMap`]
    /// documentation for more information.
    fn spawn(self) -> JoinHandle<()> {
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(self.sleep);
                trace!("cleaning stale filters");
                let Some(inner) = self.store.upgrade() else { break };
                let removed = inner.remove_where(|entry| entry.is_stale(self.age_limit));
                if removed > 0 {
                    debug!(removed, "removed stale filters");
                    crate::metrics::record_stale_removed(removed);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::LogFilterSpec;

    fn log_kind() -> FilterKind {
        FilterKind::Log(Box::new(LogFilterSpec::new()))
    }

    #[test]
    fn ids_are_sequential_from_one() {
        let store = MemFilterStore::new();
        let a = store.create(FilterKind::Block, None, PollCursor::new(0)).unwrap();
        let b = store.create(log_kind(), None, PollCursor::new(0)).unwrap();
        assert_eq!(a, FilterId::from(1u64));
        assert_eq!(b, FilterId::from(2u64));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn create_get_delete() {
        let store = MemFilterStore::new();
        let id = store.create(log_kind(), None, PollCursor::new(9)).unwrap();

        let entry = store.get(id).unwrap().unwrap();
        assert_eq!(entry.id(), id);
        assert!(entry.kind().is_log());
        assert_eq!(entry.connection(), None);

        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert!(store.get(id).unwrap().is_none());
        // The handed-out record outlives removal.
        assert_eq!(entry.id(), id);
    }

    #[test]
    fn enumerates_only_push_filters_of_kind() {
        let store = MemFilterStore::new();
        let conn = ConnectionId::from(7);
        let push_block = store.create(FilterKind::Block, Some(conn), PollCursor::new(0)).unwrap();
        let push_log = store.create(log_kind(), Some(conn), PollCursor::new(0)).unwrap();
        store.create(FilterKind::Block, None, PollCursor::new(0)).unwrap();
        store.create(log_kind(), None, PollCursor::new(0)).unwrap();

        let blocks = store.all_block_filters_with_connection().unwrap();
        assert_eq!(blocks.iter().map(|e| e.id()).collect::<Vec<_>>(), vec![push_block]);

        let logs = store.all_log_filters_with_connection().unwrap();
        assert_eq!(logs.iter().map(|e| e.id()).collect::<Vec<_>>(), vec![push_log]);
    }

    #[test]
    fn delete_by_connection_cascades() {
        let store = MemFilterStore::new();
        let a = ConnectionId::from(1);
        let b = ConnectionId::from(2);
        store.create(FilterKind::Block, Some(a), PollCursor::new(0)).unwrap();
        store.create(log_kind(), Some(a), PollCursor::new(0)).unwrap();
        let kept = store.create(FilterKind::Block, Some(b), PollCursor::new(0)).unwrap();
        let poll = store.create(FilterKind::Block, None, PollCursor::new(0)).unwrap();

        assert_eq!(store.delete_by_connection(a).unwrap(), 2);
        assert_eq!(store.delete_by_connection(a).unwrap(), 0);
        assert!(store.get(kept).unwrap().is_some());
        assert!(store.get(poll).unwrap().is_some());
    }

    #[test]
    fn clean_stale_spares_push_and_busy_filters() {
        let store = MemFilterStore::new();
        let push = store.create(FilterKind::Block, Some(ConnectionId::from(1)), PollCursor::new(0));
        let idle = store.create(FilterKind::Block, None, PollCursor::new(0)).unwrap();
        let busy = store.create(log_kind(), None, PollCursor::new(0)).unwrap();

        let busy_entry = store.get(busy).unwrap().unwrap();
        let _guard = busy_entry.cursor().try_lock().unwrap();

        assert_eq!(store.clean_stale(Duration::ZERO).unwrap(), 1);
        assert!(store.get(push.unwrap()).unwrap().is_some());
        assert!(store.get(idle).unwrap().is_none());
        assert!(store.get(busy).unwrap().is_some());
    }

    #[test]
    fn fresh_filters_survive_cleaning() {
        let store = MemFilterStore::new();
        let id = store.create(FilterKind::Block, None, PollCursor::new(0)).unwrap();
        assert_eq!(store.clean_stale(Duration::from_secs(60)).unwrap(), 0);
        assert!(store.get(id).unwrap().is_some());
    }

    #[test]
    fn cleaner_thread_removes_stale_and_exits_with_store() {
        let store = MemFilterStore::new();
        let conn = ConnectionId::from(3);
        let poll = store.create(FilterKind::Block, None, PollCursor::new(0)).unwrap();
        let push = store.create(FilterKind::Block, Some(conn), PollCursor::new(0)).unwrap();

        let handle = store.spawn_cleaner(Duration::from_millis(5), Duration::ZERO);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.get(poll).unwrap().is_some() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(store.get(poll).unwrap().is_none());
        assert!(store.get(push).unwrap().is_some());

        let weak = Arc::downgrade(&store.inner);
        drop(store);
        assert_eq!(weak.strong_count(), 0);
        handle.join().unwrap();
    }
}

// Some code in this file has been copied and modified from reth
// <https://github.com/paradigmxyz/reth>
// The original license is included below:
//
// The MIT License (MIT)
//
// Copyright (c) 2022-2025 Reth Contributors
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.
