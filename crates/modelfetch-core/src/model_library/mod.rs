//! Model library - data model, naming, file selection, persistence, and
//! repository listing used by the download engine.
//!
//! # Architecture
//!
//! ```text
//! RemoteRepository ──> Vec<RemoteFile> ──> FileFilter (glob) ──> selected files
//!                                                                   │
//! DownloadStore <── ModelRecord { location, state, progress, path } <┘
//! ```

pub mod download_store;
mod glob;
mod naming;
mod repository;
mod types;

pub use download_store::{DownloadStore, JsonDownloadStore, MemoryDownloadStore};
pub use glob::{matches, FileFilter, Glob};
pub use naming::safe_directory_name;
pub use repository::{HuggingFaceRepository, RemoteRepository, StaticRepository};
pub use types::*;
