//! Per-model download state persistence.
//!
//! The engine writes through [`DownloadStore`] with idempotent upserts keyed
//! by model id and never assumes it owns the row schema. Two implementations
//! ship with the crate: a JSON file for standalone use and an in-memory map
//! for tests and embedders that persist elsewhere.

use crate::error::Result;
use crate::metadata::{atomic_read_json, atomic_write_json};
use crate::model_library::types::ModelRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Storage for [`ModelRecord`] rows.
pub trait DownloadStore: Send + Sync {
    /// Insert or replace the row for `record.model_id`.
    fn upsert(&self, record: &ModelRecord) -> Result<()>;

    /// Load one row.
    fn load(&self, model_id: &str) -> Result<Option<ModelRecord>>;

    /// Remove a row. Removing a missing row is not an error.
    fn remove(&self, model_id: &str) -> Result<()>;

    /// Load every row.
    fn load_all(&self) -> Result<Vec<ModelRecord>>;
}

/// All persisted records (the JSON root object).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct DownloadStoreData {
    models: Vec<ModelRecord>,
}

/// [`DownloadStore`] backed by `{data_dir}/downloads.json`.
pub struct JsonDownloadStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonDownloadStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(crate::config::PathsConfig::DOWNLOAD_STORE_FILENAME),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read store data. A corrupt file is logged and treated as empty so a
    /// damaged store never blocks startup.
    fn load_data(&self) -> DownloadStoreData {
        match atomic_read_json::<DownloadStoreData>(&self.path) {
            Ok(Some(data)) => data,
            Ok(None) => DownloadStoreData::default(),
            Err(e) => {
                warn!("Failed to read download store at {}: {}", self.path.display(), e);
                DownloadStoreData::default()
            }
        }
    }

    fn write_data(&self, data: &DownloadStoreData) -> Result<()> {
        debug!("Writing {} model records to {}", data.models.len(), self.path.display());
        atomic_write_json(&self.path, data)
    }
}

impl DownloadStore for JsonDownloadStore {
    fn upsert(&self, record: &ModelRecord) -> Result<()> {
        let _guard = self.write_lock.lock().expect("download store lock poisoned");
        let mut data = self.load_data();
        match data.models.iter_mut().find(|r| r.model_id == record.model_id) {
            Some(existing) => *existing = record.clone(),
            None => data.models.push(record.clone()),
        }
        self.write_data(&data)
    }

    fn load(&self, model_id: &str) -> Result<Option<ModelRecord>> {
        Ok(self
            .load_data()
            .models
            .into_iter()
            .find(|r| r.model_id == model_id))
    }

    fn remove(&self, model_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().expect("download store lock poisoned");
        let mut data = self.load_data();
        let before = data.models.len();
        data.models.retain(|r| r.model_id != model_id);
        if data.models.len() < before {
            self.write_data(&data)?;
        }
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<ModelRecord>> {
        Ok(self.load_data().models)
    }
}

/// [`DownloadStore`] kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryDownloadStore {
    records: Mutex<HashMap<String, ModelRecord>>,
}

impl MemoryDownloadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DownloadStore for MemoryDownloadStore {
    fn upsert(&self, record: &ModelRecord) -> Result<()> {
        self.records
            .lock()
            .expect("download store lock poisoned")
            .insert(record.model_id.clone(), record.clone());
        Ok(())
    }

    fn load(&self, model_id: &str) -> Result<Option<ModelRecord>> {
        Ok(self
            .records
            .lock()
            .expect("download store lock poisoned")
            .get(model_id)
            .cloned())
    }

    fn remove(&self, model_id: &str) -> Result<()> {
        self.records
            .lock()
            .expect("download store lock poisoned")
            .remove(model_id);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<ModelRecord>> {
        let mut all: Vec<ModelRecord> = self
            .records
            .lock()
            .expect("download store lock poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_library::types::{DownloadState, ModelLocation};
    use tempfile::TempDir;

    fn make_record(id: &str, state: DownloadState) -> ModelRecord {
        let mut record = ModelRecord::new(ModelLocation::remote(id));
        record.state = state;
        record
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let store = JsonDownloadStore::new(tmp.path());

        store
            .upsert(&make_record("org/model", DownloadState::DownloadingPaused))
            .unwrap();

        let loaded = store.load("org/model").unwrap().unwrap();
        assert_eq!(loaded.state, DownloadState::DownloadingPaused);
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_replaces() {
        let tmp = TempDir::new().unwrap();
        let store = JsonDownloadStore::new(tmp.path());

        let mut record = make_record("org/model", DownloadState::DownloadingActive);
        store.upsert(&record).unwrap();
        record.state = DownloadState::Downloaded;
        record.size_on_disk = Some(42);
        store.upsert(&record).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, DownloadState::Downloaded);
        assert_eq!(all[0].size_on_disk, Some(42));
    }

    #[test]
    fn test_remove() {
        let tmp = TempDir::new().unwrap();
        let store = JsonDownloadStore::new(tmp.path());

        store
            .upsert(&make_record("org/model", DownloadState::Downloaded))
            .unwrap();
        store.remove("org/model").unwrap();
        store.remove("org/never-existed").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        JsonDownloadStore::new(tmp.path())
            .upsert(&make_record("org/model", DownloadState::DownloadingActive))
            .unwrap();

        let reopened = JsonDownloadStore::new(tmp.path());
        let record = reopened.load("org/model").unwrap().unwrap();
        assert_eq!(record.state, DownloadState::DownloadingActive);
    }

    #[test]
    fn test_corrupt_store_reads_as_empty() {
        let tmp = TempDir::new().unwrap();
        let store = JsonDownloadStore::new(tmp.path());
        std::fs::write(store.path(), "garbage").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryDownloadStore::new();
        store
            .upsert(&make_record("b/model", DownloadState::Downloaded))
            .unwrap();
        store
            .upsert(&make_record("a/model", DownloadState::NotDownloaded))
            .unwrap();

        let ids: Vec<_> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|r| r.model_id)
            .collect();
        assert_eq!(ids, vec!["a/model", "b/model"]);

        store.remove("a/model").unwrap();
        assert!(store.load("a/model").unwrap().is_none());
    }
}
