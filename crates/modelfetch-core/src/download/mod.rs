//! Download engine: transfers, lifecycle, sessions, and completion handling.
//!
//! # Architecture
//!
//! ```text
//! DownloadOrchestrator ──start/pause/resume/cancel/delete──> DownloadStateMachine
//!        │                                                          │
//!        ├──enqueue/cancel──> TransferBackend ──TransferEvent──┐    ├──> DownloadStore
//!        │                                                     │    └──> DownloadEvent stream
//!        └──> BackgroundSessionManager <──SessionFinished──────┘
//!                    │
//!                    └──> ArchiveInstaller (extract + flatten)
//! ```

pub mod backend;
mod events;
mod orchestrator;
mod session;
mod state_machine;
mod throttle;

pub use backend::{
    BackgroundDownloadHandle, BackgroundDownloadStatus, FileTransfer, HttpTransferBackend,
    MemoryTransferBackend, MemoryTransferMode, TransferBackend, TransferEvent, TransferProgress,
    TransferRequest, TransferState,
};
pub use events::{ArchiveSummary, CompletedInfo, DownloadEvent};
pub use orchestrator::DownloadOrchestrator;
pub use session::{
    BackgroundSessionManager, CompletionOutcome, PersistedSession, PersistedTransfer,
    SessionStore, SkipReason,
};
pub use state_machine::{Attempt, DownloadStateMachine, ModelGuard, Teardown};
pub use throttle::{ProgressThrottler, MIN_PROGRESS_DELTA};
