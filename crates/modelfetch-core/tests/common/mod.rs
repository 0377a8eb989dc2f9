//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use modelfetch_core::{
    DownloadEvent, DownloadOrchestrator, DownloadState, DownloadStore, EngineConfig,
    MemoryDownloadStore, MemoryTransferBackend, StaticRepository,
};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub struct Harness {
    pub tmp: TempDir,
    pub engine: Arc<DownloadOrchestrator>,
    pub backend: Arc<MemoryTransferBackend>,
}

impl Harness {
    /// Engine over a manual memory backend and an in-memory store, already resumed.
    pub async fn manual(repo: StaticRepository) -> Self {
        Self::with_backend(repo, MemoryTransferBackend::manual()).await
    }

    pub async fn with_backend(repo: StaticRepository, backend: MemoryTransferBackend) -> Self {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(backend);
        let engine = build_engine(
            tmp.path(),
            repo,
            backend.clone(),
            Arc::new(MemoryDownloadStore::new()),
        );
        engine.resume_all().await.unwrap();
        Self {
            tmp,
            engine,
            backend,
        }
    }

    pub fn handle_ids(&self, model_id: &str) -> Vec<String> {
        self.backend
            .handles_for_model(model_id)
            .into_iter()
            .map(|h| h.id)
            .collect()
    }

    pub fn session_of(&self, model_id: &str) -> String {
        self.backend.handles_for_model(model_id)[0]
            .session_identifier
            .clone()
    }
}

pub fn config(root: &Path) -> EngineConfig {
    EngineConfig::rooted_at(root)
        .with_resource_checks(false)
        .with_throttle_interval(Duration::from_millis(250))
}

pub fn build_engine(
    root: &Path,
    repo: StaticRepository,
    backend: Arc<MemoryTransferBackend>,
    store: Arc<dyn DownloadStore>,
) -> Arc<DownloadOrchestrator> {
    DownloadOrchestrator::new(config(root), Arc::new(repo), backend, store).unwrap()
}

/// Poll until `condition` holds, failing the test after five seconds.
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_state(engine: &DownloadOrchestrator, model_id: &str, state: DownloadState) {
    wait_until(&format!("{} to become {}", model_id, state), || {
        engine.current_state(model_id) == state
    })
    .await;
}

/// Drain whatever is currently buffered on an event stream.
pub fn drain(events: &mut mpsc::UnboundedReceiver<DownloadEvent>) -> Vec<DownloadEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Build a ZIP archive in memory from `(path, contents)` pairs. Paths ending
/// in `/` become directory entries.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use zip::write::SimpleFileOptions;

    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (path, contents) in entries {
        if path.ends_with('/') {
            zip.add_directory(*path, options).unwrap();
        } else {
            zip.start_file(*path, options).unwrap();
            zip.write_all(contents).unwrap();
        }
    }
    zip.finish().unwrap().into_inner()
}

/// Sorted relative paths of every regular file under `root`.
pub fn file_list(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    files.sort();
    files
}
