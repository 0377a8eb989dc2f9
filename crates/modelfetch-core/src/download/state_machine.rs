//! Per-model download lifecycle.
//!
//! ```text
//! notDownloaded --start--> downloadingActive --pause--> downloadingPaused
//!                           |  |  ^                        |      |
//!                           |  |  +--------resume----------+      |
//!                           |  +--complete--> downloaded          |
//!                           +--cancel/fail--> notDownloaded <--cancel
//! downloaded --delete--> notDownloaded
//! ```
//!
//! Each model has its own async mutex; holding a [`ModelGuard`] is the only
//! way to change that model's state, and every transition is written through
//! to the [`DownloadStore`] before it is visible to readers. Commands that do
//! not apply to the current state are no-ops that return `Ok(false)`.

use super::backend::{bytes_on_disk, BackgroundDownloadHandle, FileTransfer};
use super::events::{CompletedInfo, DownloadEvent};
use super::throttle::ProgressThrottler;
use crate::error::{FetchError, Result};
use crate::model_library::{
    DownloadProgress, DownloadState, DownloadStore, ModelLocation, ModelRecord,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Runtime details of one download attempt.
///
/// Lives only while the model is active or paused; cancel, complete, and
/// fail drop it.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub session_identifier: String,
    pub coordinate: String,
    pub dest_dir: PathBuf,
    /// Archive file to extract once every transfer has completed.
    pub archive: Option<PathBuf>,
    transfers: Vec<FileTransfer>,
    bytes: HashMap<String, u64>,
    finished: HashSet<String>,
}

impl Attempt {
    pub fn new(
        session_identifier: impl Into<String>,
        coordinate: impl Into<String>,
        dest_dir: PathBuf,
        transfers: Vec<FileTransfer>,
        archive: Option<PathBuf>,
    ) -> Self {
        Self {
            session_identifier: session_identifier.into(),
            coordinate: coordinate.into(),
            dest_dir,
            archive,
            transfers,
            bytes: HashMap::new(),
            finished: HashSet::new(),
        }
    }

    pub fn transfers(&self) -> &[FileTransfer] {
        &self.transfers
    }

    pub fn handles(&self) -> Vec<BackgroundDownloadHandle> {
        self.transfers.iter().map(|t| t.handle.clone()).collect()
    }

    /// Reset byte counters from what is already on disk.
    pub fn seed_from_disk(&mut self) {
        for transfer in &self.transfers {
            let on_disk = bytes_on_disk(&self.dest_dir, &transfer.file);
            self.bytes.insert(transfer.handle.id.clone(), on_disk);
            if transfer.file.size > 0 && on_disk >= transfer.file.size {
                let dest = self.dest_dir.join(&transfer.file.path);
                if dest.is_file() {
                    self.finished.insert(transfer.handle.id.clone());
                }
            }
        }
    }

    fn owns(&self, handle: &BackgroundDownloadHandle) -> bool {
        handle.session_identifier == self.session_identifier
            && self.transfers.iter().any(|t| t.handle.id == handle.id)
    }

    fn file_size(&self, handle_id: &str) -> u64 {
        self.transfers
            .iter()
            .find(|t| t.handle.id == handle_id)
            .map(|t| t.file.size)
            .unwrap_or(0)
    }

    pub fn progress(&self) -> DownloadProgress {
        let mut bytes_downloaded = 0;
        let mut total_bytes = 0;
        let mut current_file_name = None;

        for transfer in &self.transfers {
            let done = self.bytes.get(&transfer.handle.id).copied().unwrap_or(0);
            bytes_downloaded += done;
            total_bytes += transfer.file.size.max(done);
            if current_file_name.is_none() && !self.finished.contains(&transfer.handle.id) {
                current_file_name = Some(transfer.file.file_name().to_string());
            }
        }

        DownloadProgress {
            bytes_downloaded,
            total_bytes,
            files_completed: self.finished.len(),
            total_files: self.transfers.len(),
            current_file_name,
        }
    }

    fn finished_progress(&self) -> DownloadProgress {
        let mut progress = self.progress();
        progress.bytes_downloaded = progress.total_bytes;
        progress.files_completed = progress.total_files;
        progress.current_file_name = None;
        progress
    }
}

struct ModelEntry {
    record: ModelRecord,
    attempt: Option<Attempt>,
    observers: Vec<mpsc::UnboundedSender<DownloadEvent>>,
}

impl ModelEntry {
    fn new(record: ModelRecord) -> Self {
        Self {
            record,
            attempt: None,
            observers: Vec::new(),
        }
    }

    fn broadcast(&mut self, event: DownloadEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// What a cancel or delete took down, for the caller to clean up.
#[derive(Debug)]
pub struct Teardown {
    pub previous_state: DownloadState,
    pub attempt: Option<Attempt>,
    pub local_path: Option<PathBuf>,
}

/// Owner of every model's lifecycle state.
pub struct DownloadStateMachine {
    entries: RwLock<HashMap<String, Arc<Mutex<ModelEntry>>>>,
    snapshots: RwLock<HashMap<String, ModelRecord>>,
    store: Arc<dyn DownloadStore>,
    throttler: ProgressThrottler,
    retain_failed_state: bool,
}

impl DownloadStateMachine {
    /// Load persisted records so queries work before any model is touched.
    pub fn new(
        store: Arc<dyn DownloadStore>,
        throttler: ProgressThrottler,
        retain_failed_state: bool,
    ) -> Result<Self> {
        let snapshots = store
            .load_all()?
            .into_iter()
            .map(|r| (r.model_id.clone(), r))
            .collect();
        Ok(Self {
            entries: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(snapshots),
            store,
            throttler,
            retain_failed_state,
        })
    }

    pub fn throttler(&self) -> &ProgressThrottler {
        &self.throttler
    }

    /// Wait for exclusive access to `model_id`.
    pub async fn lock(&self, model_id: &str) -> Result<ModelGuard<'_>> {
        let entry = self.entry(model_id)?;
        Ok(ModelGuard {
            machine: self,
            entry: entry.lock_owned().await,
        })
    }

    fn entry(&self, model_id: &str) -> Result<Arc<Mutex<ModelEntry>>> {
        if let Some(entry) = self
            .entries
            .read()
            .expect("model table lock poisoned")
            .get(model_id)
        {
            return Ok(Arc::clone(entry));
        }

        let record = match self.store.load(model_id)? {
            Some(record) => record,
            None => placeholder_record(model_id),
        };
        let mut entries = self.entries.write().expect("model table lock poisoned");
        Ok(Arc::clone(entries.entry(model_id.to_string()).or_insert_with(
            || Arc::new(Mutex::new(ModelEntry::new(record))),
        )))
    }

    /// Models whose lock is held right now.
    pub fn busy_models(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("model table lock poisoned")
            .iter()
            .filter(|(_, entry)| entry.try_lock().is_err())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Register an observer for `model_id`'s events.
    pub async fn subscribe(
        &self,
        model_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<DownloadEvent>> {
        let mut guard = self.lock(model_id).await?;
        Ok(guard.subscribe())
    }

    /// Last committed state. Never waits on a model lock.
    pub fn current_state(&self, model_id: &str) -> DownloadState {
        self.snapshots
            .read()
            .expect("snapshot lock poisoned")
            .get(model_id)
            .map(|r| r.state)
            .unwrap_or_default()
    }

    /// Last committed record.
    pub fn record(&self, model_id: &str) -> Option<ModelRecord> {
        self.snapshots
            .read()
            .expect("snapshot lock poisoned")
            .get(model_id)
            .cloned()
    }

    /// Every committed record, ordered by model id.
    pub fn records(&self) -> Vec<ModelRecord> {
        let mut records: Vec<ModelRecord> = self
            .snapshots
            .read()
            .expect("snapshot lock poisoned")
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        records
    }

    /// Models that are active or paused.
    pub fn list_active(&self) -> Vec<ModelRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.state.is_in_progress())
            .collect()
    }
}

fn placeholder_record(model_id: &str) -> ModelRecord {
    let location =
        ModelLocation::parse(model_id).unwrap_or_else(|_| ModelLocation::remote(model_id));
    let mut record = ModelRecord::new(location);
    record.model_id = model_id.to_string();
    record
}

/// Exclusive access to one model. Transitions are methods on the guard.
pub struct ModelGuard<'a> {
    machine: &'a DownloadStateMachine,
    entry: OwnedMutexGuard<ModelEntry>,
}

impl ModelGuard<'_> {
    pub fn model_id(&self) -> &str {
        &self.entry.record.model_id
    }

    pub fn state(&self) -> DownloadState {
        self.entry.record.state
    }

    pub fn record(&self) -> &ModelRecord {
        &self.entry.record
    }

    pub fn attempt(&self) -> Option<&Attempt> {
        self.entry.attempt.as_ref()
    }

    pub fn session_identifier(&self) -> Option<&str> {
        self.entry
            .attempt
            .as_ref()
            .map(|a| a.session_identifier.as_str())
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.entry.observers.push(tx);
        rx
    }

    /// Fail unless a fresh attempt may start from the current state.
    pub fn ensure_can_start(&self) -> Result<()> {
        let model_id = self.model_id().to_string();
        match self.state() {
            s if s.can_start() => Ok(()),
            DownloadState::Downloaded => Err(FetchError::AlreadyDownloaded { model_id }),
            _ => Err(FetchError::DownloadInProgress { model_id }),
        }
    }

    fn commit(&mut self, mut record: ModelRecord) -> Result<()> {
        record.updated_at = chrono::Utc::now().to_rfc3339();
        self.machine.store.upsert(&record)?;
        self.machine
            .snapshots
            .write()
            .expect("snapshot lock poisoned")
            .insert(record.model_id.clone(), record.clone());
        self.entry.record = record;
        Ok(())
    }

    /// `notDownloaded`/`failed` -> `downloadingActive`.
    pub fn begin(&mut self, location: ModelLocation, mut attempt: Attempt) -> Result<()> {
        self.ensure_can_start()?;
        attempt.seed_from_disk();

        let mut record = ModelRecord::new(location);
        record.model_id = self.model_id().to_string();
        record.state = DownloadState::DownloadingActive;
        record.total_bytes = Some(attempt.progress().total_bytes);
        self.commit(record)?;

        info!(
            "Download started for {} (session {}, {} files)",
            self.model_id(),
            attempt.session_identifier,
            attempt.transfers.len()
        );
        self.machine.throttler.reset(self.model_id());
        self.entry.attempt = Some(attempt);
        self.forward_progress();
        Ok(())
    }

    /// Re-link an attempt found after a restart. The persisted state is kept.
    pub fn attach(&mut self, mut attempt: Attempt) -> bool {
        if !self.state().is_in_progress() {
            return false;
        }
        attempt.seed_from_disk();
        debug!(
            "Re-attached {} to session {}",
            self.model_id(),
            attempt.session_identifier
        );
        self.machine.throttler.reset(self.model_id());
        self.entry.attempt = Some(attempt);
        true
    }

    /// `downloadingActive` -> `downloadingPaused`.
    pub fn pause(&mut self) -> Result<bool> {
        if self.state() != DownloadState::DownloadingActive {
            return Ok(false);
        }
        let mut record = self.entry.record.clone();
        record.state = DownloadState::DownloadingPaused;
        self.commit(record)?;
        info!("Download paused for {}", self.model_id());
        Ok(true)
    }

    /// `downloadingPaused` -> `downloadingActive`.
    pub fn resume(&mut self) -> Result<bool> {
        if self.state() != DownloadState::DownloadingPaused {
            return Ok(false);
        }
        if self.entry.attempt.is_none() {
            return Err(FetchError::InvalidTransition {
                model_id: self.model_id().to_string(),
                command: "resume",
                state: "paused without a transfer session".to_string(),
            });
        }
        let mut record = self.entry.record.clone();
        record.state = DownloadState::DownloadingActive;
        self.commit(record)?;
        info!("Download resumed for {}", self.model_id());
        Ok(true)
    }

    /// Active, paused, or failed -> `notDownloaded`. Observers are released
    /// and their streams close.
    pub fn cancel(&mut self) -> Result<Option<Teardown>> {
        let previous_state = self.state();
        let applies = previous_state.is_in_progress() || previous_state == DownloadState::Failed;

        if !applies {
            self.release_runtime();
            return Ok(None);
        }

        let mut record = self.entry.record.clone();
        record.state = DownloadState::NotDownloaded;
        record.progress = 0.0;
        record.last_error = None;
        self.commit(record)?;

        let attempt = self.release_runtime();
        info!("Download cancelled for {}", self.model_id());
        Ok(Some(Teardown {
            previous_state,
            attempt,
            local_path: None,
        }))
    }

    /// `downloadingActive` -> `downloaded`. Sends the final 100% update and
    /// the completion event, then closes the stream.
    pub fn complete(&mut self, info: CompletedInfo) -> Result<bool> {
        if self.state() != DownloadState::DownloadingActive {
            return Ok(false);
        }

        let already_full = self.entry.record.progress >= 1.0;
        let mut record = self.entry.record.clone();
        record.state = DownloadState::Downloaded;
        record.progress = 1.0;
        record.local_path = Some(info.local_path.clone());
        record.size_on_disk = Some(info.size_on_disk);
        record.last_error = None;
        self.commit(record)?;

        if !already_full {
            let final_progress = self
                .entry
                .attempt
                .as_ref()
                .map(Attempt::finished_progress)
                .unwrap_or_default();
            self.entry.broadcast(DownloadEvent::Progress(final_progress));
        }
        self.entry.broadcast(DownloadEvent::Completed(info));
        self.release_runtime();
        info!("Download completed for {}", self.model_id());
        Ok(true)
    }

    /// `downloadingActive` -> `notDownloaded` (or `failed` when failures are
    /// retained). The error goes to observers, then the stream closes.
    pub fn fail(&mut self, error: Arc<FetchError>) -> Result<bool> {
        if self.state() != DownloadState::DownloadingActive {
            return Ok(false);
        }

        let mut record = self.entry.record.clone();
        if self.machine.retain_failed_state {
            record.state = DownloadState::Failed;
            record.last_error = Some(error.to_string());
        } else {
            record.state = DownloadState::NotDownloaded;
            record.last_error = None;
        }
        record.progress = 0.0;
        self.commit(record)?;

        warn!("Download failed for {}: {}", self.model_id(), error);
        self.entry.broadcast(DownloadEvent::Failed(error));
        self.release_runtime();
        Ok(true)
    }

    /// Any state -> `notDownloaded`, forgetting the persisted row.
    pub fn delete(&mut self) -> Result<Option<Teardown>> {
        let previous_state = self.state();
        if previous_state == DownloadState::NotDownloaded {
            self.release_runtime();
            return Ok(None);
        }

        let model_id = self.model_id().to_string();
        self.machine.store.remove(&model_id)?;
        self.machine
            .snapshots
            .write()
            .expect("snapshot lock poisoned")
            .remove(&model_id);

        let local_path = self.entry.record.local_path.clone();
        let mut record = placeholder_record(&model_id);
        record.location = self.entry.record.location.clone();
        self.entry.record = record;

        let attempt = self.release_runtime();
        info!("Deleted {} (was {})", model_id, previous_state);
        Ok(Some(Teardown {
            previous_state,
            attempt,
            local_path,
        }))
    }

    /// Move an in-progress record with nothing to resume back to `notDownloaded`.
    pub fn roll_back(&mut self, reason: &str) -> Result<bool> {
        if !self.state().is_in_progress() {
            return Ok(false);
        }
        warn!("Rolling back {}: {}", self.model_id(), reason);
        let mut record = self.entry.record.clone();
        record.state = DownloadState::NotDownloaded;
        record.progress = 0.0;
        self.commit(record)?;
        self.release_runtime();
        Ok(true)
    }

    /// Record cumulative bytes for one transfer. Returns whether observers
    /// were notified.
    pub fn record_progress(&mut self, handle: &BackgroundDownloadHandle, bytes: u64) -> bool {
        if self.state() != DownloadState::DownloadingActive {
            return false;
        }
        let Some(attempt) = self.entry.attempt.as_mut() else {
            return false;
        };
        if !attempt.owns(handle) {
            debug!(
                "Ignoring progress from foreign transfer {} (session {})",
                handle.id, handle.session_identifier
            );
            return false;
        }
        let slot = attempt.bytes.entry(handle.id.clone()).or_insert(0);
        *slot = (*slot).max(bytes);
        self.forward_progress()
    }

    /// Mark one transfer's file as fully written.
    pub fn record_file_completed(&mut self, handle: &BackgroundDownloadHandle) -> bool {
        if self.state() != DownloadState::DownloadingActive {
            return false;
        }
        let Some(attempt) = self.entry.attempt.as_mut() else {
            return false;
        };
        if !attempt.owns(handle) {
            return false;
        }
        let size = attempt.file_size(&handle.id);
        let slot = attempt.bytes.entry(handle.id.clone()).or_insert(0);
        *slot = (*slot).max(size);
        attempt.finished.insert(handle.id.clone());
        self.forward_progress()
    }

    fn forward_progress(&mut self) -> bool {
        let Some(progress) = self.entry.attempt.as_ref().map(Attempt::progress) else {
            return false;
        };
        let fraction = progress.fraction();
        if !self
            .machine
            .throttler
            .should_update(self.model_id(), fraction)
        {
            return false;
        }

        self.entry.broadcast(DownloadEvent::Progress(progress));

        let mut record = self.entry.record.clone();
        record.progress = fraction;
        if let Err(e) = self.commit(record) {
            warn!("Failed to persist progress for {}: {}", self.model_id(), e);
        }
        true
    }

    fn release_runtime(&mut self) -> Option<Attempt> {
        self.entry.observers.clear();
        self.machine.throttler.cleanup(&self.entry.record.model_id);
        self.entry.attempt.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_library::{MemoryDownloadStore, RemoteFile};
    use std::time::Duration;
    use tempfile::TempDir;

    fn machine(retain: bool) -> (Arc<MemoryDownloadStore>, DownloadStateMachine) {
        let store = Arc::new(MemoryDownloadStore::new());
        let machine = DownloadStateMachine::new(
            store.clone(),
            ProgressThrottler::new(Duration::from_millis(250)),
            retain,
        )
        .unwrap();
        (store, machine)
    }

    fn attempt(dir: &TempDir, files: &[(&str, u64)]) -> Attempt {
        let transfers = files
            .iter()
            .map(|(path, size)| FileTransfer {
                handle: BackgroundDownloadHandle::new("org/model", "memory", "session-1"),
                file: RemoteFile::new(*path, *size),
            })
            .collect();
        Attempt::new("session-1", "org/model", dir.path().to_path_buf(), transfers, None)
    }

    fn completed_info(dir: &TempDir) -> CompletedInfo {
        CompletedInfo {
            model_id: "org/model".to_string(),
            local_path: dir.path().to_path_buf(),
            size_on_disk: 100,
            archive: None,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DownloadEvent>) -> Vec<DownloadEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_persists_each_transition() {
        let tmp = TempDir::new().unwrap();
        let (store, machine) = machine(false);
        let mut guard = machine.lock("org/model").await.unwrap();
        let mut rx = guard.subscribe();

        guard
            .begin(ModelLocation::remote("org/model"), attempt(&tmp, &[("a.bin", 100)]))
            .unwrap();
        assert_eq!(
            store.load("org/model").unwrap().unwrap().state,
            DownloadState::DownloadingActive
        );

        let handle = guard.attempt().unwrap().handles()[0].clone();
        assert!(guard.record_progress(&handle, 50));
        assert!(guard.complete(completed_info(&tmp)).unwrap());
        drop(guard);

        assert_eq!(machine.current_state("org/model"), DownloadState::Downloaded);
        let events = drain(&mut rx);
        assert!(matches!(events[0], DownloadEvent::Progress(ref p) if p.bytes_downloaded == 0));
        assert!(matches!(events[1], DownloadEvent::Progress(ref p) if p.bytes_downloaded == 50));
        assert!(
            matches!(events[2], DownloadEvent::Progress(ref p) if p.bytes_downloaded == 100 && p.files_completed == 1)
        );
        assert!(matches!(events[3], DownloadEvent::Completed(_)));
        assert_eq!(events.len(), 4);
        // Stream closes after the terminal event.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_commands_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let (_store, machine) = machine(false);
        let mut guard = machine.lock("org/model").await.unwrap();

        assert!(!guard.pause().unwrap());
        assert!(!guard.resume().unwrap());
        assert!(guard.cancel().unwrap().is_none());

        guard
            .begin(ModelLocation::remote("org/model"), attempt(&tmp, &[("a.bin", 10)]))
            .unwrap();
        assert!(guard.pause().unwrap());
        assert!(!guard.pause().unwrap());
        assert!(guard.resume().unwrap());
        assert!(!guard.resume().unwrap());

        assert!(guard.cancel().unwrap().is_some());
        assert!(!guard.pause().unwrap());
        assert!(guard.cancel().unwrap().is_none());
        assert!(!guard.complete(completed_info(&tmp)).unwrap());
        assert_eq!(guard.state(), DownloadState::NotDownloaded);
    }

    #[tokio::test]
    async fn test_cancel_closes_stream_and_clears_runtime() {
        let tmp = TempDir::new().unwrap();
        let (store, machine) = machine(false);
        let mut guard = machine.lock("org/model").await.unwrap();
        let mut rx = guard.subscribe();
        guard
            .begin(ModelLocation::remote("org/model"), attempt(&tmp, &[("a.bin", 10)]))
            .unwrap();
        guard.pause().unwrap();

        let teardown = guard.cancel().unwrap().unwrap();
        assert_eq!(teardown.previous_state, DownloadState::DownloadingPaused);
        assert_eq!(teardown.attempt.unwrap().handles().len(), 1);
        assert!(guard.attempt().is_none());
        assert_eq!(
            store.load("org/model").unwrap().unwrap().state,
            DownloadState::NotDownloaded
        );
        drop(guard);

        drain(&mut rx);
        assert!(rx.recv().await.is_none());
        assert_eq!(machine.throttler().tracked(), 0);
    }

    #[tokio::test]
    async fn test_fail_rolls_back_and_reports() {
        let tmp = TempDir::new().unwrap();
        let (store, machine) = machine(false);
        let mut guard = machine.lock("org/model").await.unwrap();
        let mut rx = guard.subscribe();
        guard
            .begin(ModelLocation::remote("org/model"), attempt(&tmp, &[("a.bin", 10)]))
            .unwrap();

        let error = Arc::new(FetchError::Timeout(Duration::from_secs(30)));
        assert!(guard.fail(error).unwrap());
        assert!(!guard
            .fail(Arc::new(FetchError::Other("late".into())))
            .unwrap());

        let record = store.load("org/model").unwrap().unwrap();
        assert_eq!(record.state, DownloadState::NotDownloaded);
        assert!(record.last_error.is_none());

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(DownloadEvent::Failed(_))));
    }

    #[tokio::test]
    async fn test_fail_retained_when_configured() {
        let tmp = TempDir::new().unwrap();
        let (store, machine) = machine(true);
        let mut guard = machine.lock("org/model").await.unwrap();
        guard
            .begin(ModelLocation::remote("org/model"), attempt(&tmp, &[("a.bin", 10)]))
            .unwrap();
        guard
            .fail(Arc::new(FetchError::Network {
                message: "reset".into(),
                cause: None,
            }))
            .unwrap();

        let record = store.load("org/model").unwrap().unwrap();
        assert_eq!(record.state, DownloadState::Failed);
        assert!(record.last_error.unwrap().contains("reset"));

        // A failed model may start again.
        guard
            .begin(ModelLocation::remote("org/model"), attempt(&tmp, &[("a.bin", 10)]))
            .unwrap();
        assert_eq!(guard.state(), DownloadState::DownloadingActive);
    }

    #[tokio::test]
    async fn test_start_rejected_while_in_progress_or_downloaded() {
        let tmp = TempDir::new().unwrap();
        let (_store, machine) = machine(false);
        let mut guard = machine.lock("org/model").await.unwrap();
        guard
            .begin(ModelLocation::remote("org/model"), attempt(&tmp, &[("a.bin", 10)]))
            .unwrap();
        assert!(matches!(
            guard.ensure_can_start(),
            Err(FetchError::DownloadInProgress { .. })
        ));

        guard.complete(completed_info(&tmp)).unwrap();
        assert!(matches!(
            guard.ensure_can_start(),
            Err(FetchError::AlreadyDownloaded { .. })
        ));
    }

    #[tokio::test]
    async fn test_foreign_session_progress_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let (_store, machine) = machine(false);
        let mut guard = machine.lock("org/model").await.unwrap();
        guard
            .begin(ModelLocation::remote("org/model"), attempt(&tmp, &[("a.bin", 10)]))
            .unwrap();

        let mut foreign = guard.attempt().unwrap().handles()[0].clone();
        foreign.session_identifier = "session-other".to_string();
        assert!(!guard.record_progress(&foreign, 5));
        assert_eq!(guard.attempt().unwrap().progress().bytes_downloaded, 0);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_per_transfer() {
        let tmp = TempDir::new().unwrap();
        let (_store, machine) = machine(false);
        let mut guard = machine.lock("org/model").await.unwrap();
        guard
            .begin(ModelLocation::remote("org/model"), attempt(&tmp, &[("a.bin", 100)]))
            .unwrap();
        let handle = guard.attempt().unwrap().handles()[0].clone();

        guard.record_progress(&handle, 60);
        guard.record_progress(&handle, 20);
        assert_eq!(guard.attempt().unwrap().progress().bytes_downloaded, 60);
    }

    #[tokio::test]
    async fn test_delete_from_downloaded_forgets_row() {
        let tmp = TempDir::new().unwrap();
        let (store, machine) = machine(false);
        let mut guard = machine.lock("org/model").await.unwrap();
        guard
            .begin(ModelLocation::remote("org/model"), attempt(&tmp, &[("a.bin", 10)]))
            .unwrap();
        guard.complete(completed_info(&tmp)).unwrap();

        let teardown = guard.delete().unwrap().unwrap();
        assert_eq!(teardown.previous_state, DownloadState::Downloaded);
        assert_eq!(teardown.local_path.as_deref(), Some(tmp.path()));
        assert!(guard.delete().unwrap().is_none());
        drop(guard);

        assert!(store.load("org/model").unwrap().is_none());
        assert_eq!(machine.current_state("org/model"), DownloadState::NotDownloaded);
    }

    #[tokio::test]
    async fn test_queries_see_persisted_records_at_startup() {
        let store = Arc::new(MemoryDownloadStore::new());
        let mut record = ModelRecord::new(ModelLocation::remote("org/paused"));
        record.state = DownloadState::DownloadingPaused;
        store.upsert(&record).unwrap();

        let machine = DownloadStateMachine::new(
            store,
            ProgressThrottler::new(Duration::from_millis(250)),
            false,
        )
        .unwrap();
        assert_eq!(
            machine.current_state("org/paused"),
            DownloadState::DownloadingPaused
        );
        assert_eq!(machine.list_active().len(), 1);

        let guard = machine.lock("org/paused").await.unwrap();
        assert_eq!(guard.state(), DownloadState::DownloadingPaused);
    }

    #[tokio::test]
    async fn test_different_models_do_not_block_each_other() {
        let (_store, machine) = machine(false);
        let _a = machine.lock("org/a").await.unwrap();
        let b = tokio::time::timeout(Duration::from_secs(1), machine.lock("org/b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_busy_models_reports_held_locks() {
        let (_store, machine) = machine(false);
        drop(machine.lock("org/idle").await.unwrap());
        let _held = machine.lock("org/held").await.unwrap();

        assert_eq!(machine.busy_models(), vec!["org/held".to_string()]);
    }
}
