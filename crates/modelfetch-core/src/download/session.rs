//! Background transfer sessions.
//!
//! A session groups the file transfers of one download attempt under a
//! session identifier. Sessions are persisted so that, after a restart,
//! transfers the backend still knows about are re-attached to their models
//! instead of being started a second time.

use super::backend::{
    BackgroundDownloadHandle, BackgroundDownloadStatus, FileTransfer, TransferBackend,
    TransferProgress, TransferRequest, TransferState,
};
use super::events::{ArchiveSummary, CompletedInfo};
use super::state_machine::{Attempt, DownloadStateMachine};
use crate::archive::ArchiveInstaller;
use crate::config::PathsConfig;
use crate::error::{FetchError, Result};
use crate::metadata::{atomic_read_json, atomic_write_json};
use crate::model_library::{DownloadState, RemoteFile};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// One persisted transfer: the handle and the file it fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTransfer {
    pub handle: BackgroundDownloadHandle,
    pub file: RemoteFile,
}

/// Everything needed to re-enqueue or re-attach a session after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub session_identifier: String,
    pub model_id: String,
    pub coordinate: String,
    pub dest_dir: PathBuf,
    pub transfers: Vec<PersistedTransfer>,
    #[serde(default)]
    pub archive: Option<PathBuf>,
    pub created_at: String,
}

impl PersistedSession {
    pub fn from_attempt(model_id: &str, attempt: &Attempt) -> Self {
        Self {
            session_identifier: attempt.session_identifier.clone(),
            model_id: model_id.to_string(),
            coordinate: attempt.coordinate.clone(),
            dest_dir: attempt.dest_dir.clone(),
            transfers: attempt
                .transfers()
                .iter()
                .map(|t| PersistedTransfer {
                    handle: t.handle.clone(),
                    file: t.file.clone(),
                })
                .collect(),
            archive: attempt.archive.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn handles(&self) -> Vec<BackgroundDownloadHandle> {
        self.transfers.iter().map(|t| t.handle.clone()).collect()
    }

    fn file_transfers(&self) -> Vec<FileTransfer> {
        self.transfers
            .iter()
            .map(|t| FileTransfer {
                handle: t.handle.clone(),
                file: t.file.clone(),
            })
            .collect()
    }

    pub fn to_attempt(&self) -> Attempt {
        Attempt::new(
            self.session_identifier.clone(),
            self.coordinate.clone(),
            self.dest_dir.clone(),
            self.file_transfers(),
            self.archive.clone(),
        )
    }

    pub fn to_request(&self) -> TransferRequest {
        TransferRequest {
            session_identifier: self.session_identifier.clone(),
            coordinate: self.coordinate.clone(),
            dest_dir: self.dest_dir.clone(),
            transfers: self.file_transfers(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionStoreData {
    sessions: Vec<PersistedSession>,
}

/// Session table, optionally mirrored to `{data_dir}/sessions.json`.
pub struct SessionStore {
    path: Option<PathBuf>,
    sessions: Mutex<HashMap<String, PersistedSession>>,
}

impl SessionStore {
    /// Open the JSON-backed store. A corrupt file is logged and treated as empty.
    pub fn open(data_dir: &Path) -> Self {
        let path = data_dir.join(PathsConfig::SESSION_STORE_FILENAME);
        let sessions = match atomic_read_json::<SessionStoreData>(&path) {
            Ok(Some(data)) => data.sessions,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read session store at {}: {}", path.display(), e);
                Vec::new()
            }
        };
        debug!("Loaded {} persisted sessions", sessions.len());
        Self {
            path: Some(path),
            sessions: Mutex::new(
                sessions
                    .into_iter()
                    .map(|s| (s.session_identifier.clone(), s))
                    .collect(),
            ),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, session: PersistedSession) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session store lock poisoned");
        sessions.insert(session.session_identifier.clone(), session);
        self.flush(&sessions)
    }

    pub fn remove(&self, session_identifier: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session store lock poisoned");
        if sessions.remove(session_identifier).is_some() {
            self.flush(&sessions)?;
        }
        Ok(())
    }

    pub fn get(&self, session_identifier: &str) -> Option<PersistedSession> {
        self.sessions
            .lock()
            .expect("session store lock poisoned")
            .get(session_identifier)
            .cloned()
    }

    /// Every session, oldest first.
    pub fn all(&self) -> Vec<PersistedSession> {
        let mut all: Vec<PersistedSession> = self
            .sessions
            .lock()
            .expect("session store lock poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_identifier.cmp(&b.session_identifier))
        });
        all
    }

    fn flush(&self, sessions: &HashMap<String, PersistedSession>) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let mut data = SessionStoreData {
            sessions: sessions.values().cloned().collect(),
        };
        data.sessions
            .sort_by(|a, b| a.session_identifier.cmp(&b.session_identifier));
        atomic_write_json(path, &data)
    }
}

/// Result of reconciling one model during completion handling.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    Completed(CompletedInfo),
    Failed {
        model_id: String,
        error: Arc<FetchError>,
    },
    /// The model was left untouched.
    Skipped {
        model_id: String,
        reason: SkipReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The model's current attempt belongs to another session.
    OtherSession,
    /// The model is not actively downloading (paused or already settled).
    NotActive,
    /// Some transfers have not finished yet.
    Pending,
}

/// Bridges the transfer backend and the state machine.
pub struct BackgroundSessionManager {
    backend: Arc<dyn TransferBackend>,
    store: SessionStore,
    machine: Arc<DownloadStateMachine>,
    installer: ArchiveInstaller,
    resumed: AtomicBool,
}

impl BackgroundSessionManager {
    pub fn new(
        backend: Arc<dyn TransferBackend>,
        store: SessionStore,
        machine: Arc<DownloadStateMachine>,
        installer: ArchiveInstaller,
    ) -> Self {
        Self {
            backend,
            store,
            machine,
            installer,
            resumed: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &Arc<dyn TransferBackend> {
        &self.backend
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<PersistedSession> {
        self.store.all()
    }

    pub(crate) fn register(&self, session: PersistedSession) -> Result<()> {
        self.store.insert(session)
    }

    pub(crate) fn forget(&self, session_identifier: &str) {
        if let Err(e) = self.store.remove(session_identifier) {
            warn!("Failed to remove session {}: {}", session_identifier, e);
        }
    }

    /// Stop every transfer of an attempt and forget its session.
    pub(crate) async fn abandon(&self, attempt: &Attempt) {
        for handle in attempt.handles() {
            self.backend.cancel(&handle).await;
        }
        self.forget(&attempt.session_identifier);
    }

    /// Re-attach transfers that were in flight when the process last stopped.
    ///
    /// Sessions the backend still knows are re-attached as they are; active
    /// sessions it has forgotten are enqueued again and resume from their
    /// partial files; paused ones wait for an explicit resume. Sessions whose
    /// model has moved on are dropped, and in-progress models without any
    /// session roll back to `notDownloaded`.
    pub async fn resume_all(&self) -> Result<Vec<BackgroundDownloadHandle>> {
        let statuses = self.backend.poll_status().await;
        let mut known: HashMap<String, Vec<BackgroundDownloadStatus>> = HashMap::new();
        for status in statuses {
            known
                .entry(status.handle.session_identifier.clone())
                .or_default()
                .push(status);
        }

        let mut attached = Vec::new();
        let mut settled_sessions = Vec::new();
        let mut live_models = HashSet::new();

        for session in self.store.all() {
            let mut guard = self.machine.lock(&session.model_id).await?;
            let usable = guard.state().is_in_progress()
                && !live_models.contains(&session.model_id)
                && guard
                    .session_identifier()
                    .map_or(true, |current| current == session.session_identifier);

            if !usable {
                warn!(
                    "Dropping stale session {} for {} ({})",
                    session.session_identifier,
                    session.model_id,
                    guard.state()
                );
                for handle in session.handles() {
                    self.backend.cancel(&handle).await;
                }
                self.forget(&session.session_identifier);
                continue;
            }

            guard.attach(session.to_attempt());
            live_models.insert(session.model_id.clone());

            match known.get(&session.session_identifier) {
                Some(statuses) => {
                    info!(
                        "Re-attached {} transfers of {} (session {})",
                        statuses.len(),
                        session.model_id,
                        session.session_identifier
                    );
                    for status in statuses {
                        guard.record_progress(&status.handle, status.progress.bytes_written);
                        if status.state == TransferState::Completed {
                            guard.record_file_completed(&status.handle);
                        }
                    }
                    let settled = statuses.len() == session.transfers.len()
                        && statuses.iter().all(|s| s.state.is_terminal());
                    if settled && guard.state() == DownloadState::DownloadingActive {
                        settled_sessions.push(session.session_identifier.clone());
                    }
                }
                None if guard.state() == DownloadState::DownloadingActive => {
                    info!(
                        "Re-enqueueing {} transfers of {} (session {})",
                        session.transfers.len(),
                        session.model_id,
                        session.session_identifier
                    );
                    self.backend.enqueue(session.to_request()).await?;
                }
                None => {
                    debug!("{} stays paused until resumed", session.model_id);
                }
            }
            attached.extend(session.handles());
        }

        for record in self.machine.list_active() {
            if live_models.contains(&record.model_id) {
                continue;
            }
            let mut guard = self.machine.lock(&record.model_id).await?;
            guard.roll_back("no transfer session survived the restart")?;
        }

        self.resumed.store(true, Ordering::SeqCst);

        for session_identifier in settled_sessions {
            self.handle_completion(&session_identifier, |_| {}).await?;
        }

        Ok(attached)
    }

    /// Statuses of every known transfer. Paused models, whose transfers the
    /// backend has let go of, are reported from their partial files.
    pub async fn status_snapshot(&self) -> Vec<BackgroundDownloadStatus> {
        let mut statuses = self.backend.poll_status().await;
        let reported: HashSet<String> = statuses.iter().map(|s| s.handle.id.clone()).collect();

        for session in self.store.all() {
            if self.machine.current_state(&session.model_id) != DownloadState::DownloadingPaused {
                continue;
            }
            for transfer in &session.transfers {
                if reported.contains(&transfer.handle.id) {
                    continue;
                }
                statuses.push(BackgroundDownloadStatus {
                    handle: transfer.handle.clone(),
                    state: TransferState::Paused,
                    progress: TransferProgress {
                        bytes_written: super::backend::bytes_on_disk(
                            &session.dest_dir,
                            &transfer.file,
                        ),
                        total_bytes: transfer.file.size,
                    },
                    error: None,
                    estimated_time_remaining: None,
                });
            }
        }

        statuses.sort_by(|a, b| {
            (&a.handle.model_id, &a.handle.id).cmp(&(&b.handle.model_id, &b.handle.id))
        });
        statuses
    }

    /// Settle the models of a finished session.
    ///
    /// Only models whose current attempt belongs to `session_identifier` are
    /// touched. A model with a failed transfer fails with that transfer's
    /// error; a model whose transfers all completed is finalized, extracting
    /// and flattening its archive first when it has one. `callback` receives
    /// the per-model outcomes.
    pub async fn handle_completion<F>(
        &self,
        session_identifier: &str,
        callback: F,
    ) -> Result<Vec<CompletionOutcome>>
    where
        F: FnOnce(&[CompletionOutcome]) + Send,
    {
        let Some(session) = self.store.get(session_identifier) else {
            let mismatch = FetchError::SessionMismatch {
                session_identifier: session_identifier.to_string(),
            };
            warn!("{}", mismatch);
            callback(&[]);
            return Ok(Vec::new());
        };

        let statuses: HashMap<String, BackgroundDownloadStatus> = self
            .backend
            .poll_status()
            .await
            .into_iter()
            .filter(|s| s.handle.session_identifier == session_identifier)
            .map(|s| (s.handle.id.clone(), s))
            .collect();

        let mut model_ids: Vec<String> = session
            .transfers
            .iter()
            .map(|t| t.handle.model_id.clone())
            .collect();
        model_ids.sort();
        model_ids.dedup();

        let mut outcomes = Vec::new();
        for model_id in model_ids {
            let outcome = self
                .settle_model(&session, &model_id, &statuses)
                .await?;
            outcomes.push(outcome);
        }

        // Paused models still need their session to resume from.
        let all_settled = outcomes.iter().all(|o| {
            !matches!(
                o,
                CompletionOutcome::Skipped {
                    reason: SkipReason::Pending | SkipReason::NotActive,
                    ..
                }
            )
        });
        if all_settled {
            for handle in session.handles() {
                self.backend.cancel(&handle).await;
            }
            self.forget(session_identifier);
        }

        callback(&outcomes);
        Ok(outcomes)
    }

    async fn settle_model(
        &self,
        session: &PersistedSession,
        model_id: &str,
        statuses: &HashMap<String, BackgroundDownloadStatus>,
    ) -> Result<CompletionOutcome> {
        let skipped = |reason| CompletionOutcome::Skipped {
            model_id: model_id.to_string(),
            reason,
        };

        let mut guard = self.machine.lock(model_id).await?;
        if guard.session_identifier() != Some(session.session_identifier.as_str()) {
            debug!(
                "Session {} does not own the current attempt of {}",
                session.session_identifier, model_id
            );
            return Ok(skipped(SkipReason::OtherSession));
        }
        if guard.state() != DownloadState::DownloadingActive {
            return Ok(skipped(SkipReason::NotActive));
        }

        let mine: Vec<&BackgroundDownloadStatus> = session
            .transfers
            .iter()
            .filter(|t| t.handle.model_id == model_id)
            .filter_map(|t| statuses.get(&t.handle.id))
            .collect();
        let expected = session
            .transfers
            .iter()
            .filter(|t| t.handle.model_id == model_id)
            .count();

        if let Some(failed) = mine.iter().find(|s| s.state == TransferState::Failed) {
            let error = failed.error.clone().unwrap_or_else(|| {
                Arc::new(FetchError::Other(format!(
                    "transfer {} failed without an error",
                    failed.handle.id
                )))
            });
            guard.fail(Arc::clone(&error))?;
            return Ok(CompletionOutcome::Failed {
                model_id: model_id.to_string(),
                error,
            });
        }

        if mine.len() < expected || mine.iter().any(|s| s.state != TransferState::Completed) {
            return Ok(skipped(SkipReason::Pending));
        }

        for status in &mine {
            guard.record_file_completed(&status.handle);
        }

        let archive = match session.archive {
            Some(ref archive) => {
                match self
                    .installer
                    .install(archive.clone(), session.dest_dir.clone())
                    .await
                {
                    Ok(report) => Some(ArchiveSummary::from(&report)),
                    Err(e) => {
                        let error = Arc::new(e);
                        guard.fail(Arc::clone(&error))?;
                        return Ok(CompletionOutcome::Failed {
                            model_id: model_id.to_string(),
                            error,
                        });
                    }
                }
            }
            None => None,
        };

        let info = CompletedInfo {
            model_id: model_id.to_string(),
            local_path: session.dest_dir.clone(),
            size_on_disk: measure_directory(session.dest_dir.clone()).await,
            archive,
        };
        guard.complete(info.clone())?;
        Ok(CompletionOutcome::Completed(info))
    }
}

/// [`directory_size`] on the blocking pool.
pub(crate) async fn measure_directory(path: PathBuf) -> u64 {
    tokio::task::spawn_blocking(move || directory_size(&path))
        .await
        .unwrap_or(0)
}

/// Total size of regular files under `path`.
pub(crate) fn directory_size(path: &Path) -> u64 {
    if path.is_file() {
        return std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    }
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
