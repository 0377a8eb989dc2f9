//! Modelfetch Core - Headless engine for downloading AI models.
//!
//! This crate resolves which files of a remote model repository to fetch,
//! transfers them with resumable `.part` files, tracks each model through a
//! persisted download lifecycle, and turns downloaded `.zip` payloads into
//! flat model directories. It can be used programmatically without any CLI.
//!
//! # Example
//!
//! ```rust,ignore
//! use modelfetch_core::{
//!     DownloadOrchestrator, EngineConfig, FileFilter, HttpTransferBackend,
//!     HuggingFaceRepository, JsonDownloadStore, ModelLocation,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> modelfetch_core::Result<()> {
//!     let config = EngineConfig::rooted_at("/path/to/data");
//!     let repository = HuggingFaceRepository::new(&config.hub_base_url, &config.revision)?;
//!     let backend = HttpTransferBackend::new(
//!         &config.hub_base_url,
//!         &config.revision,
//!         config.max_concurrent_transfers,
//!     )?;
//!     let store = JsonDownloadStore::new(&config.data_dir);
//!
//!     let engine = DownloadOrchestrator::new(
//!         config,
//!         Arc::new(repository),
//!         Arc::new(backend),
//!         Arc::new(store),
//!     )?;
//!     engine.resume_all().await?;
//!
//!     let model_id = engine
//!         .start(ModelLocation::remote("Qwen/Qwen3-0.6B"), &FileFilter::model_defaults())
//!         .await?;
//!     let mut events = engine.subscribe(&model_id).await?;
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod cancel;
pub mod config;
pub mod download;
pub mod error;
pub mod metadata;
pub mod model_library;

// Re-export commonly used types
pub use archive::{
    extract_zip, restructure, ArchiveInstaller, ExtractionReport, InstallReport,
    RestructureOutcome, RestructureReport, RestructureRules,
};
pub use cancel::CancellationToken;
pub use config::EngineConfig;
pub use download::{
    ArchiveSummary, BackgroundDownloadHandle, BackgroundDownloadStatus, CompletedInfo,
    CompletionOutcome, DownloadEvent, DownloadOrchestrator, HttpTransferBackend,
    MemoryTransferBackend, MemoryTransferMode, SessionStore, TransferBackend, TransferState,
};
pub use error::{ErrorCategory, FetchError, Result};
pub use model_library::{
    safe_directory_name, DownloadProgress, DownloadState, DownloadStore, FileFilter,
    HuggingFaceRepository, JsonDownloadStore, MemoryDownloadStore, ModelLocation, ModelRecord,
    RemoteFile, RemoteRepository, StaticRepository,
};
