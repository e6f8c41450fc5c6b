//! Shared error types for the services crate.

use thiserror::Error;

use reader_core::model::{BlockIndex, CaseId, Phase};
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

/// Errors from the remote study service.
///
/// Everything except `NotFound` counts as a transport failure: the service was
/// unreachable or answered with something unusable.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RemoteError {
    #[error("resource not found")]
    NotFound,
    #[error("study service returned status {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl RemoteError {
    /// The resource does not exist yet; callers retry later.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound)
    }
}

/// Errors emitted by `ProgressTracker`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProgressError {
    /// The server has no record of a phase that was marked locally.
    #[error("server has no {phase} assessment for case {case_id}")]
    VerificationMismatch { case_id: CaseId, phase: Phase },
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `BlockScheduler`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    /// A new block was requested while a tracked block is still incomplete.
    #[error("block {block} still has incomplete assignments")]
    PreconditionFailed { block: BlockIndex },
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Errors emitted by `ReaderSession`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error(transparent)]
    Progress(#[from] ProgressError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
}
