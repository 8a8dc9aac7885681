//! Store Snapshots
//!
//! The whole store is written as one JSON document. Writes go to a temporary
//! file that is synced and then renamed over the previous snapshot, so a crash
//! mid-write leaves the last complete snapshot in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use super::{QueryStore, StoreError, StoreResult};
use crate::query::ApiQuery;

const SNAPSHOT_FORMAT_VERSION: &str = "1.0";

/// On-disk form of the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: String,
    pub saved_at: DateTime<Utc>,
    pub queries: Vec<ApiQuery>,
}

impl StoreSnapshot {
    /// Load from file; a missing file is an empty snapshot
    pub fn load(path: &Path) -> StoreResult<Self> {
        if !path.exists() {
            return Ok(StoreSnapshot {
                version: SNAPSHOT_FORMAT_VERSION.to_string(),
                saved_at: Utc::now(),
                queries: Vec::new(),
            });
        }

        let file = File::open(path)?;
        let snapshot = serde_json::from_reader(BufReader::new(file))?;
        Ok(snapshot)
    }

    /// Save to file atomically
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("json.tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, self)?;
            writer.flush()?;
            writer
                .into_inner()
                .map_err(|e| StoreError::Io(e.into_error()))?
                .sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

impl QueryStore {
    /// Capture every stored query
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            version: SNAPSHOT_FORMAT_VERSION.to_string(),
            saved_at: Utc::now(),
            queries: self
                .list()
                .into_iter()
                .map(Arc::unwrap_or_clone)
                .collect(),
        }
    }

    /// Write the store to `path`; returns the number of queries saved
    pub fn save_snapshot(&self, path: &Path) -> StoreResult<usize> {
        let snapshot = self.snapshot();
        snapshot.save(path)?;
        Ok(snapshot.queries.len())
    }

    /// Build a store from the snapshot at `path`, keeping stored versions
    pub fn load_snapshot(path: &Path) -> StoreResult<Self> {
        let snapshot = StoreSnapshot::load(path)?;
        let store = QueryStore::new();
        for query in snapshot.queries {
            let id = query.id;
            let version = query.version.max(1);
            if store.contains(&id) {
                return Err(StoreError::AlreadyExists(id));
            }
            store.entries.insert(
                id,
                arc_swap::ArcSwap::from_pointee(ApiQuery { version, ..query }),
            );
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryLimits;
    use crate::query::{validate, CachedResponse, QueryDraft, QueryStatus};
    use tempfile::TempDir;

    fn new_query(name: &str) -> ApiQuery {
        let draft = QueryDraft::new(name, "https://example.com/data", 60);
        ApiQuery::new(validate(&draft, &QueryLimits::default()).unwrap(), Utc::now())
    }

    #[test]
    fn test_missing_snapshot_loads_empty() {
        let temp = TempDir::new().unwrap();
        let store = QueryStore::load_snapshot(&temp.path().join("none.json")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_snapshot_preserves_state_and_versions() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("queries.json");

        let store = QueryStore::new();
        let a = store.create(new_query("a")).unwrap();
        let b = store.create(new_query("b")).unwrap();
        store
            .update(&b.id, 1, |q| {
                q.status = QueryStatus::PausedErrors;
                q.consecutive_error_count = 3;
                q.cached_response = Some(Arc::new(CachedResponse {
                    content: serde_json::json!({"rows": [["1"]]}),
                    fetched_at: Utc::now(),
                }));
            })
            .unwrap();

        assert_eq!(store.save_snapshot(&path).unwrap(), 2);
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = QueryStore::load_snapshot(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(&a.id).unwrap().version, 1);
        let b = loaded.get(&b.id).unwrap();
        assert_eq!(b.version, 2);
        assert_eq!(b.status, QueryStatus::PausedErrors);
        assert_eq!(b.consecutive_error_count, 3);
        assert_eq!(
            b.cached_response.as_ref().unwrap().content,
            serde_json::json!({"rows": [["1"]]})
        );
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("queries.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            QueryStore::load_snapshot(&path),
            Err(StoreError::Json(_))
        ));
    }
}
