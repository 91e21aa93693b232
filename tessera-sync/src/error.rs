//! Engine-level errors.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("world session closed")]
    Closed,
}

impl SyncError {
    /// Expected when viewing someone else's world; never surfaced.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, SyncError::Store(e) if e.is_permission_denied())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}
