//! Query Store
//!
//! Keyed storage for [`ApiQuery`] records with lock-free reads and
//! compare-and-set writes.
//!
//! ## Design
//!
//! - Each record lives in its own `ArcSwap`, so readers load an immutable
//!   snapshot without blocking on writers
//! - Writers go through [`QueryStore::update`], which applies a change only if
//!   the record's `version` still matches what the writer last read
//! - The DashMap shard guard is held for the swap only, never across I/O, and
//!   `delete` takes the shard write lock, so a commit racing a delete either
//!   lands before it or fails with `NotFound`

mod error;
pub mod snapshot;

pub use error::{StoreError, StoreResult};
pub use snapshot::StoreSnapshot;

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use crate::query::{ApiQuery, QueryId, QueryStatus};

/// Thread-safe store of API queries
#[derive(Default)]
pub struct QueryStore {
    entries: DashMap<QueryId, ArcSwap<ApiQuery>>,
}

impl QueryStore {
    pub fn new() -> Self {
        QueryStore {
            entries: DashMap::new(),
        }
    }

    /// Insert a new query at version 1.
    pub fn create(&self, mut query: ApiQuery) -> StoreResult<Arc<ApiQuery>> {
        match self.entries.entry(query.id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(query.id)),
            Entry::Vacant(slot) => {
                query.version = 1;
                let stored = Arc::new(query);
                slot.insert(ArcSwap::new(Arc::clone(&stored)));
                Ok(stored)
            }
        }
    }

    /// Current snapshot of a query
    pub fn get(&self, id: &QueryId) -> Option<Arc<ApiQuery>> {
        self.entries.get(id).map(|entry| entry.load_full())
    }

    pub fn contains(&self, id: &QueryId) -> bool {
        self.entries.contains_key(id)
    }

    /// Apply `change` to the query if its version is still `expected_version`.
    ///
    /// The id and version are store-managed and cannot be changed by `change`.
    /// Returns the committed record, `Conflict` if another writer got there
    /// first, or `NotFound` if the query was deleted.
    pub fn update<F>(&self, id: &QueryId, expected_version: u64, change: F) -> StoreResult<Arc<ApiQuery>>
    where
        F: FnOnce(&mut ApiQuery),
    {
        let entry = self.entries.get(id).ok_or(StoreError::NotFound(*id))?;
        let current = entry.load_full();
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                id: *id,
                expected: expected_version,
                actual: current.version,
            });
        }

        let mut next = ApiQuery::clone(&current);
        change(&mut next);
        next.id = current.id;
        next.version = current.version + 1;
        let next = Arc::new(next);

        let previous = entry.compare_and_swap(&current, Arc::clone(&next));
        if !Arc::ptr_eq(&*previous, &current) {
            return Err(StoreError::Conflict {
                id: *id,
                expected: expected_version,
                actual: previous.version,
            });
        }
        Ok(next)
    }

    /// Remove a query. Deleting a missing id reports `NotFound`.
    pub fn delete(&self, id: &QueryId) -> StoreResult<Arc<ApiQuery>> {
        self.entries
            .remove(id)
            .map(|(_, entry)| entry.into_inner())
            .ok_or(StoreError::NotFound(*id))
    }

    /// Every stored query, oldest first
    pub fn list(&self) -> Vec<Arc<ApiQuery>> {
        let mut queries: Vec<_> = self.entries.iter().map(|e| e.load_full()).collect();
        queries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        queries
    }

    /// Queries currently in `status`, oldest first
    pub fn list_by_status(&self, status: QueryStatus) -> Vec<Arc<ApiQuery>> {
        let mut queries: Vec<_> = self
            .entries
            .iter()
            .map(|e| e.load_full())
            .filter(|q| q.status == status)
            .collect();
        queries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        queries
    }

    /// Number of queries per status
    pub fn count_by_status(&self) -> Vec<(QueryStatus, usize)> {
        let mut counts = [0usize; QueryStatus::ALL.len()];
        for entry in &self.entries {
            let status = entry.load().status;
            if let Some(i) = QueryStatus::ALL.iter().position(|s| *s == status) {
                counts[i] += 1;
            }
        }
        QueryStatus::ALL.into_iter().zip(counts).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryLimits;
    use crate::query::{validate, QueryDraft};
    use chrono::Utc;

    fn new_query(name: &str) -> ApiQuery {
        let draft = QueryDraft::new(name, "https://example.com/data", 60);
        ApiQuery::new(validate(&draft, &QueryLimits::default()).unwrap(), Utc::now())
    }

    #[test]
    fn test_create_sets_version_one() {
        let store = QueryStore::new();
        let stored = store.create(new_query("a")).unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(store.get(&stored.id).unwrap().version, 1);
    }

    #[test]
    fn test_create_duplicate_id_rejected() {
        let store = QueryStore::new();
        let query = new_query("a");
        store.create(query.clone()).unwrap();
        assert!(matches!(
            store.create(query),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_update_bumps_version() {
        let store = QueryStore::new();
        let stored = store.create(new_query("a")).unwrap();
        let updated = store
            .update(&stored.id, 1, |q| q.status = QueryStatus::Disabled)
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.status, QueryStatus::Disabled);
        assert_eq!(store.get(&stored.id).unwrap().status, QueryStatus::Disabled);
    }

    #[test]
    fn test_update_with_stale_version_conflicts() {
        let store = QueryStore::new();
        let stored = store.create(new_query("a")).unwrap();
        store.update(&stored.id, 1, |q| q.consecutive_error_count = 1).unwrap();

        let err = store
            .update(&stored.id, 1, |q| q.consecutive_error_count = 7)
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get(&stored.id).unwrap().consecutive_error_count, 1);
    }

    #[test]
    fn test_update_cannot_change_identity() {
        let store = QueryStore::new();
        let stored = store.create(new_query("a")).unwrap();
        let updated = store
            .update(&stored.id, 1, |q| {
                q.id = QueryId::new();
                q.version = 99;
            })
            .unwrap();
        assert_eq!(updated.id, stored.id);
        assert_eq!(updated.version, 2);
    }

    #[test]
    fn test_update_after_delete_is_not_found() {
        let store = QueryStore::new();
        let stored = store.create(new_query("a")).unwrap();
        store.delete(&stored.id).unwrap();
        let err = store.update(&stored.id, 1, |_| {}).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_missing_reports_not_found() {
        let store = QueryStore::new();
        assert!(store.delete(&QueryId::new()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let store = QueryStore::new();
        let stored = store.create(new_query("a")).unwrap();
        let before = store.get(&stored.id).unwrap();
        store.update(&stored.id, 1, |q| q.name = "b".into()).unwrap();
        assert_eq!(before.name, "a");
        assert_eq!(store.get(&stored.id).unwrap().name, "b");
    }

    #[test]
    fn test_list_by_status() {
        let store = QueryStore::new();
        let a = store.create(new_query("a")).unwrap();
        let b = store.create(new_query("b")).unwrap();
        store
            .update(&b.id, 1, |q| q.status = QueryStatus::PausedErrors)
            .unwrap();

        let active = store.list_by_status(QueryStatus::Active);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
        assert_eq!(store.list_by_status(QueryStatus::PausedErrors).len(), 1);
        assert!(store.list_by_status(QueryStatus::Disabled).is_empty());
        assert_eq!(store.list().len(), 2);

        let counts = store.count_by_status();
        assert!(counts.contains(&(QueryStatus::Active, 1)));
        assert!(counts.contains(&(QueryStatus::PausedErrors, 1)));
    }

    #[test]
    fn test_concurrent_updates_one_winner_per_version() {
        use std::thread;

        let store = Arc::new(QueryStore::new());
        let stored = store.create(new_query("a")).unwrap();
        let id = stored.id;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store
                        .update(&id, 1, |q| q.consecutive_error_count += 1)
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        let current = store.get(&id).unwrap();
        assert_eq!(current.consecutive_error_count, 1);
        assert_eq!(current.version, 2);
    }
}
