//! Top-level download engine.
//!
//! The orchestrator resolves which files to fetch, registers a session,
//! hands the transfers to the backend, and feeds backend events into the
//! state machine. Every command and every event for a model runs under that
//! model's lock, so a model's commands apply in the order they acquire it.

use super::backend::{
    bytes_on_disk, BackgroundDownloadHandle, BackgroundDownloadStatus, FileTransfer,
    TransferBackend, TransferEvent, TransferRequest, TransferState,
};
use super::events::{ArchiveSummary, CompletedInfo, DownloadEvent};
use super::session::{
    measure_directory, BackgroundSessionManager, CompletionOutcome, PersistedSession, SessionStore,
};
use super::state_machine::{Attempt, DownloadStateMachine, ModelGuard, Teardown};
use super::throttle::ProgressThrottler;
use crate::archive::{is_staging_dir, ArchiveInstaller, RestructureRules};
use crate::config::EngineConfig;
use crate::error::{FetchError, Result};
use crate::model_library::{
    is_zip_path, safe_directory_name, DownloadState, DownloadStore, FileFilter, ModelLocation,
    ModelRecord, RemoteFile, RemoteRepository,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Composes repository listing, transfers, lifecycle state, and archive
/// post-processing into one download engine.
pub struct DownloadOrchestrator {
    config: EngineConfig,
    repository: Arc<dyn RemoteRepository>,
    backend: Arc<dyn TransferBackend>,
    machine: Arc<DownloadStateMachine>,
    sessions: BackgroundSessionManager,
    installer: ArchiveInstaller,
    /// Held shared while a start claims its model directory, exclusively by cleanup.
    layout: RwLock<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadOrchestrator {
    /// Build the engine and start consuming backend events.
    ///
    /// Sessions are persisted under `config.data_dir`. Must be called from
    /// within a Tokio runtime.
    pub fn new(
        config: EngineConfig,
        repository: Arc<dyn RemoteRepository>,
        backend: Arc<dyn TransferBackend>,
        store: Arc<dyn DownloadStore>,
    ) -> Result<Arc<Self>> {
        let session_store = SessionStore::open(&config.data_dir);
        Self::with_session_store(config, repository, backend, store, session_store)
    }

    pub fn with_session_store(
        config: EngineConfig,
        repository: Arc<dyn RemoteRepository>,
        backend: Arc<dyn TransferBackend>,
        store: Arc<dyn DownloadStore>,
        session_store: SessionStore,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let events = backend.take_events().ok_or_else(|| {
            FetchError::Other("transfer backend events are already being consumed".to_string())
        })?;

        let machine = Arc::new(DownloadStateMachine::new(
            store,
            ProgressThrottler::new(config.throttle_interval()),
            config.retain_failed_state,
        )?);
        let installer = ArchiveInstaller::new(RestructureRules {
            marker_file: config.marker_file.clone(),
            bundle_suffix: config.bundle_suffix.clone(),
        });
        let sessions = BackgroundSessionManager::new(
            Arc::clone(&backend),
            session_store,
            Arc::clone(&machine),
            installer.clone(),
        );

        let orchestrator = Arc::new(Self {
            config,
            repository,
            backend,
            machine,
            sessions,
            installer,
            layout: RwLock::new(()),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(run_event_pump(Arc::downgrade(&orchestrator), events));
        *orchestrator.pump.lock().expect("pump lock poisoned") = Some(pump);

        Ok(orchestrator)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Re-attach transfers from before a restart. Must run before `start`.
    pub async fn resume_all(&self) -> Result<Vec<BackgroundDownloadHandle>> {
        let handles = self.sessions.resume_all().await?;
        info!("Resumed {} background transfers", handles.len());
        Ok(handles)
    }

    /// Begin downloading `location`, keeping only files selected by `filter`.
    /// Returns the model id.
    pub async fn start(&self, location: ModelLocation, filter: &FileFilter) -> Result<String> {
        if !self.sessions.is_resumed() {
            return Err(FetchError::NotResumed);
        }

        let model_id = location.model_id();
        let mut guard = self.machine.lock(&model_id).await?;
        guard.ensure_can_start()?;

        match location.clone() {
            ModelLocation::Remote { coordinate } => {
                self.start_remote(&mut guard, location, &coordinate, filter)
                    .await?;
            }
            ModelLocation::Local { path } => {
                self.start_local(&mut guard, location, &path).await?;
            }
        }
        Ok(model_id)
    }

    async fn start_remote(
        &self,
        guard: &mut ModelGuard<'_>,
        location: ModelLocation,
        coordinate: &str,
        filter: &FileFilter,
    ) -> Result<()> {
        let model_id = guard.model_id().to_string();
        let listed = self.repository.list_files(coordinate).await?;
        let selected = filter.select(&listed);
        if selected.is_empty() {
            return Err(FetchError::NoMatchingFiles { model_id });
        }

        let dest_dir = self.model_directory(&model_id);
        self.check_resources(&dest_dir, &selected)?;

        let session_identifier = uuid::Uuid::new_v4().to_string();
        let transfers: Vec<FileTransfer> = selected
            .iter()
            .map(|file| FileTransfer {
                handle: BackgroundDownloadHandle::new(
                    &model_id,
                    self.backend.kind(),
                    &session_identifier,
                ),
                file: file.clone(),
            })
            .collect();
        let archive = match selected.as_slice() {
            [only] if only.is_archive() => Some(dest_dir.join(&only.path)),
            _ => None,
        };

        let attempt = Attempt::new(
            session_identifier.clone(),
            coordinate,
            dest_dir.clone(),
            transfers.clone(),
            archive,
        );
        self.sessions
            .register(PersistedSession::from_attempt(&model_id, &attempt))?;

        // The record owns the directory before it exists on disk.
        let _layout = self.layout.read().await;
        if let Err(e) = guard.begin(location, attempt) {
            self.sessions.forget(&session_identifier);
            return Err(e);
        }

        let request = TransferRequest {
            session_identifier: session_identifier.clone(),
            coordinate: coordinate.to_string(),
            dest_dir: dest_dir.clone(),
            transfers,
        };
        let enqueued = match tokio::fs::create_dir_all(&dest_dir).await {
            Ok(()) => self.backend.enqueue(request).await,
            Err(e) => Err(FetchError::io_with_path(e, &dest_dir)),
        };
        if let Err(e) = enqueued {
            error!("Failed to enqueue transfers for {}: {}", model_id, e);
            self.sessions.forget(&session_identifier);
            guard.roll_back("transfers could not be enqueued")?;
            return Err(e);
        }

        info!(
            "Queued {} of {} files from {} (session {})",
            selected.len(),
            listed.len(),
            coordinate,
            session_identifier
        );
        Ok(())
    }

    /// Local files are already downloaded. A local `.zip` is extracted and
    /// flattened into the model directory first.
    async fn start_local(
        &self,
        guard: &mut ModelGuard<'_>,
        location: ModelLocation,
        path: &Path,
    ) -> Result<()> {
        let model_id = guard.model_id().to_string();
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| FetchError::InvalidLocation(path.display().to_string()))?;

        let archive = (metadata.is_file() && is_zip_path(path)).then(|| path.to_path_buf());
        let dest_dir = if archive.is_some() {
            self.model_directory(&model_id)
        } else {
            path.to_path_buf()
        };

        let attempt = Attempt::new(
            format!("local-{}", uuid::Uuid::new_v4()),
            path.display().to_string(),
            dest_dir.clone(),
            Vec::new(),
            archive.clone(),
        );
        guard.begin(location, attempt)?;

        let summary = match archive {
            Some(archive) => match self.installer.install(archive, dest_dir.clone()).await {
                Ok(report) => Some(ArchiveSummary::from(&report)),
                Err(e) => {
                    let error = Arc::new(e);
                    guard.fail(Arc::clone(&error))?;
                    return Err(Arc::try_unwrap(error)
                        .unwrap_or_else(|shared| FetchError::Other(shared.to_string())));
                }
            },
            None => None,
        };

        guard.complete(CompletedInfo {
            model_id,
            size_on_disk: measure_directory(dest_dir.clone()).await,
            local_path: dest_dir,
            archive: summary,
        })?;
        Ok(())
    }

    fn check_resources(&self, dest_dir: &Path, files: &[RemoteFile]) -> Result<()> {
        let total: u64 = files.iter().map(|f| f.size).sum();

        if self.config.check_memory {
            let mut system = sysinfo::System::new();
            system.refresh_memory();
            let available = system.total_memory();
            if available > 0 && total > available {
                return Err(FetchError::InsufficientMemory {
                    required: total,
                    available,
                });
            }
        }

        if self.config.check_disk_space {
            let present: u64 = files.iter().map(|f| bytes_on_disk(dest_dir, f)).sum();
            let required = total.saturating_sub(present);
            let probe = existing_ancestor(&self.config.models_root);
            let available = fs2::available_space(&probe)
                .map_err(|e| FetchError::io_with_path(e, &probe))?;
            if required > available {
                return Err(FetchError::InsufficientStorage {
                    required,
                    available,
                });
            }
            debug!(
                "Disk precheck passed: need {} bytes, {} available",
                required, available
            );
        }

        Ok(())
    }

    /// `downloadingActive` -> `downloadingPaused`. Partial files are kept.
    pub async fn pause(&self, model_id: &str) -> Result<bool> {
        let mut guard = self.machine.lock(model_id).await?;
        if guard.state() != DownloadState::DownloadingActive {
            return Ok(false);
        }
        if let Some(attempt) = guard.attempt() {
            for handle in attempt.handles() {
                self.backend.cancel(&handle).await;
            }
        }
        guard.pause()
    }

    /// `downloadingPaused` -> `downloadingActive`, continuing from partial files.
    pub async fn resume(&self, model_id: &str) -> Result<bool> {
        if !self.sessions.is_resumed() {
            return Err(FetchError::NotResumed);
        }
        let mut guard = self.machine.lock(model_id).await?;
        if guard.state() != DownloadState::DownloadingPaused {
            return Ok(false);
        }
        let request = guard.attempt().map(|attempt| TransferRequest {
            session_identifier: attempt.session_identifier.clone(),
            coordinate: attempt.coordinate.clone(),
            dest_dir: attempt.dest_dir.clone(),
            transfers: attempt.transfers().to_vec(),
        });
        let Some(request) = request else {
            // Reports the missing session as an invalid transition.
            return guard.resume();
        };
        if !guard.resume()? {
            return Ok(false);
        }
        if let Err(e) = self.backend.enqueue(request).await {
            guard.pause()?;
            return Err(e);
        }
        Ok(true)
    }

    /// Active or paused -> `notDownloaded`. The attempt's partial files are
    /// discarded so the next `start` begins from zero.
    pub async fn cancel(&self, model_id: &str) -> Result<bool> {
        let mut guard = self.machine.lock(model_id).await?;
        let Some(teardown) = guard.cancel()? else {
            return Ok(false);
        };
        if let Some(ref attempt) = teardown.attempt {
            self.sessions.abandon(attempt).await;
            if teardown.previous_state.is_in_progress() {
                self.discard_attempt_files(attempt).await;
            }
        }
        Ok(true)
    }

    async fn discard_attempt_files(&self, attempt: &Attempt) {
        let dir = &attempt.dest_dir;
        if !dir.starts_with(&self.config.models_root) {
            return;
        }
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => info!("Discarded partial download at {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to discard {}: {}", dir.display(), e),
        }
    }

    /// Any state -> `notDownloaded`, removing the model's files.
    pub async fn delete(&self, model_id: &str) -> Result<bool> {
        let mut guard = self.machine.lock(model_id).await?;
        let Some(teardown) = guard.delete()? else {
            return Ok(false);
        };
        if let Some(ref attempt) = teardown.attempt {
            self.sessions.abandon(attempt).await;
        }
        self.remove_model_files(model_id, &teardown).await?;
        Ok(true)
    }

    async fn remove_model_files(&self, model_id: &str, teardown: &Teardown) -> Result<()> {
        let mut targets = vec![self.model_directory(model_id)];
        if let Some(ref local) = teardown.local_path {
            // Never delete files outside the models root, e.g. a local source.
            if local.starts_with(&self.config.models_root) && !targets.contains(local) {
                targets.push(local.clone());
            }
        }

        for target in targets {
            match tokio::fs::remove_dir_all(&target).await {
                Ok(()) => info!("Removed {}", target.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(FetchError::io_with_path(e, &target)),
            }
        }
        Ok(())
    }

    /// Settle a finished session. Normally driven by backend events.
    pub async fn handle_completion(&self, session_identifier: &str) -> Result<Vec<CompletionOutcome>> {
        self.sessions
            .handle_completion(session_identifier, |outcomes| {
                debug!(
                    "Session {} settled {} models",
                    session_identifier,
                    outcomes.len()
                );
            })
            .await
    }

    /// Event stream for `model_id`. The stream closes after a terminal event
    /// or a cancel.
    pub async fn subscribe(&self, model_id: &str) -> Result<mpsc::UnboundedReceiver<DownloadEvent>> {
        self.machine.subscribe(model_id).await
    }

    pub fn current_state(&self, model_id: &str) -> DownloadState {
        self.machine.current_state(model_id)
    }

    pub fn record(&self, model_id: &str) -> Option<ModelRecord> {
        self.machine.record(model_id)
    }

    pub fn records(&self) -> Vec<ModelRecord> {
        self.machine.records()
    }

    /// Models currently active or paused.
    pub fn list_active_downloads(&self) -> Vec<ModelRecord> {
        self.machine.list_active()
    }

    pub async fn status_snapshot(&self) -> Vec<BackgroundDownloadStatus> {
        self.sessions.status_snapshot().await
    }

    /// `<models_root>/<safe name>`
    pub fn model_directory(&self, model_id: &str) -> PathBuf {
        self.config.models_root.join(safe_directory_name(model_id))
    }

    /// Remove on-disk data under the models root that no active, paused, or
    /// downloaded model owns. Returns the removed paths.
    pub async fn cleanup_incomplete(&self) -> Result<Vec<PathBuf>> {
        let _layout = self.layout.write().await;
        let root = &self.config.models_root;
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FetchError::io_with_path(e, root)),
        };

        let records = self.machine.records();
        let mut owned: HashSet<PathBuf> = records
            .iter()
            .filter(|r| r.state.owns_files())
            .flat_map(|r| {
                let mut dirs = vec![self.model_directory(&r.model_id)];
                if let Some(ref local) = r.local_path {
                    dirs.push(local.clone());
                }
                dirs
            })
            .collect();
        // A command holding a model's lock may be about to change its files.
        owned.extend(
            self.machine
                .busy_models()
                .iter()
                .map(|id| self.model_directory(id)),
        );
        let extraction_may_run = records
            .iter()
            .any(|r| r.state == DownloadState::DownloadingActive);

        let mut removed = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FetchError::io_with_path(e, root))?
        {
            let path = entry.path();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir || owned.contains(&path) {
                continue;
            }
            if is_staging_dir(&path) && extraction_may_run {
                continue;
            }

            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| FetchError::io_with_path(e, &path))?;
            info!("Removed incomplete download data at {}", path.display());
            removed.push(path);
        }

        removed.sort();
        Ok(removed)
    }

    async fn on_transfer_event(&self, event: TransferEvent) {
        match event {
            TransferEvent::Progress {
                handle,
                bytes_written,
                ..
            } => match self.machine.lock(&handle.model_id).await {
                Ok(mut guard) => {
                    guard.record_progress(&handle, bytes_written);
                }
                Err(e) => warn!("Dropping progress for {}: {}", handle.model_id, e),
            },
            TransferEvent::FileFinished { handle, state } => match state {
                TransferState::Completed => match self.machine.lock(&handle.model_id).await {
                    Ok(mut guard) => {
                        guard.record_file_completed(&handle);
                    }
                    Err(e) => warn!("Dropping completion for {}: {}", handle.model_id, e),
                },
                TransferState::Failed => {
                    // Fail fast instead of waiting for sibling transfers.
                    if let Err(e) = self.handle_completion(&handle.session_identifier).await {
                        error!(
                            "Failed to settle session {}: {}",
                            handle.session_identifier, e
                        );
                    }
                }
                _ => {}
            },
            TransferEvent::SessionFinished { session_identifier } => {
                if let Err(e) = self.handle_completion(&session_identifier).await {
                    error!("Failed to settle session {}: {}", session_identifier, e);
                }
            }
        }
    }
}

impl Drop for DownloadOrchestrator {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(pump) = pump.take() {
                pump.abort();
            }
        }
    }
}

async fn run_event_pump(
    orchestrator: Weak<DownloadOrchestrator>,
    mut events: mpsc::UnboundedReceiver<TransferEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        orchestrator.on_transfer_event(event).await;
    }
    debug!("Transfer event pump stopped");
}

fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => return PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::backend::MemoryTransferBackend;
    use crate::model_library::{MemoryDownloadStore, StaticRepository};
    use tempfile::TempDir;

    async fn engine(
        tmp: &TempDir,
        repo: StaticRepository,
    ) -> (Arc<DownloadOrchestrator>, Arc<MemoryTransferBackend>) {
        let backend = Arc::new(MemoryTransferBackend::manual());
        let orchestrator = DownloadOrchestrator::new(
            EngineConfig::rooted_at(tmp.path()).with_resource_checks(false),
            Arc::new(repo),
            backend.clone(),
            Arc::new(MemoryDownloadStore::new()),
        )
        .unwrap();
        (orchestrator, backend)
    }

    #[tokio::test]
    async fn test_start_requires_resume_all() {
        let tmp = TempDir::new().unwrap();
        let (orchestrator, _) = engine(&tmp, StaticRepository::new()).await;

        let err = orchestrator
            .start(ModelLocation::remote("org/model"), &FileFilter::allow_all())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotResumed));
    }

    #[tokio::test]
    async fn test_no_matching_files() {
        let tmp = TempDir::new().unwrap();
        let repo = StaticRepository::new()
            .with_repo("org/model", vec![RemoteFile::new("README.md", 10)]);
        let (orchestrator, _) = engine(&tmp, repo).await;
        orchestrator.resume_all().await.unwrap();

        let filter = FileFilter::new(["*.safetensors"], Vec::<&str>::new()).unwrap();
        let err = orchestrator
            .start(ModelLocation::remote("org/model"), &filter)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NoMatchingFiles { .. }));
        assert_eq!(
            orchestrator.current_state("org/model"),
            DownloadState::NotDownloaded
        );
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let repo = StaticRepository::new()
            .with_repo("org/model", vec![RemoteFile::new("model.bin", 10)]);
        let (orchestrator, backend) = engine(&tmp, repo).await;
        orchestrator.resume_all().await.unwrap();

        let location = ModelLocation::remote("org/model");
        orchestrator
            .start(location.clone(), &FileFilter::allow_all())
            .await
            .unwrap();
        let err = orchestrator
            .start(location, &FileFilter::allow_all())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::DownloadInProgress { .. }));
        assert_eq!(backend.enqueued_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_disk_precheck_rejects_oversized_payload() {
        let tmp = TempDir::new().unwrap();
        let repo = StaticRepository::new()
            .with_repo("org/huge", vec![RemoteFile::new("model.bin", u64::MAX / 2)]);
        let backend = Arc::new(MemoryTransferBackend::manual());
        let mut config = EngineConfig::rooted_at(tmp.path());
        config.check_memory = false;
        let orchestrator = DownloadOrchestrator::new(
            config,
            Arc::new(repo),
            backend.clone(),
            Arc::new(MemoryDownloadStore::new()),
        )
        .unwrap();
        orchestrator.resume_all().await.unwrap();

        let err = orchestrator
            .start(ModelLocation::remote("org/huge"), &FileFilter::allow_all())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InsufficientStorage { .. }));
        assert!(backend.enqueued_requests().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_unowned_directories() {
        let tmp = TempDir::new().unwrap();
        let (orchestrator, _) = engine(&tmp, StaticRepository::new()).await;
        orchestrator.resume_all().await.unwrap();

        let root = &orchestrator.config().models_root;
        std::fs::create_dir_all(root.join("org--abandoned")).unwrap();
        std::fs::write(root.join("org--abandoned/model.bin.part"), b"xx").unwrap();
        std::fs::create_dir_all(root.join(".extract-1234")).unwrap();

        let removed = orchestrator.cleanup_incomplete().await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!root.join("org--abandoned").exists());
    }

    #[tokio::test]
    async fn test_cleanup_skips_model_with_command_in_flight() {
        let tmp = TempDir::new().unwrap();
        let (orchestrator, _) = engine(&tmp, StaticRepository::new()).await;
        orchestrator.resume_all().await.unwrap();

        let dir = orchestrator.model_directory("org/starting");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("model.bin.part"), b"xx").unwrap();

        let guard = orchestrator.machine.lock("org/starting").await.unwrap();
        assert!(orchestrator.cleanup_incomplete().await.unwrap().is_empty());
        assert!(dir.exists());

        drop(guard);
        assert_eq!(orchestrator.cleanup_incomplete().await.unwrap(), vec![dir]);
    }

    #[tokio::test]
    async fn test_start_owns_directory_before_transfers_run() {
        let tmp = TempDir::new().unwrap();
        let repo = StaticRepository::new()
            .with_repo("org/model", vec![RemoteFile::new("model.bin", 10)]);
        let (orchestrator, backend) = engine(&tmp, repo).await;
        orchestrator.resume_all().await.unwrap();

        orchestrator
            .start(ModelLocation::remote("org/model"), &FileFilter::allow_all())
            .await
            .unwrap();
        assert_eq!(backend.enqueued_requests().len(), 1);

        assert!(orchestrator.cleanup_incomplete().await.unwrap().is_empty());
        assert!(orchestrator.model_directory("org/model").is_dir());
    }

    #[test]
    fn test_existing_ancestor() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(
            existing_ancestor(&tmp.path().join("a/b/c")),
            tmp.path().to_path_buf()
        );
    }
}
