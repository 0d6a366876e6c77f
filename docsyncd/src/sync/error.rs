use thiserror::Error;

use super::local_fs::LocalFsError;
use super::remote::RemoteError;
use super::store::StoreError;

/// Outcome of applying one record, as seen by the processor.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transient failure: {0}")]
    TransientIo(String),
    #[error("rejected by remote: {0}")]
    PermanentRemoteRejection(String),
    #[error("conflict detected: {0}")]
    ConflictDetected(String),
    #[error("identity mismatch at {path}")]
    IdentityMismatch { path: String },
    /// The record cannot be applied yet; retried shortly without counting
    /// as a failure.
    #[error("deferred: {0}")]
    Deferred(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        if err.is_transient() {
            SyncError::TransientIo(err.to_string())
        } else {
            SyncError::PermanentRemoteRejection(err.to_string())
        }
    }
}

impl From<LocalFsError> for SyncError {
    fn from(err: LocalFsError) -> Self {
        match err {
            LocalFsError::Path(_) => SyncError::PermanentRemoteRejection(err.to_string()),
            other => SyncError::TransientIo(other.to_string()),
        }
    }
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientIo(_) | SyncError::Store(_))
    }
}
