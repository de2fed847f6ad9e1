//! Error types for snapchain

use crate::backend::DriverError;
use crate::strategy::SnapshotOperation;
use crate::types::{DataStoreId, SnapshotId, VmId, VmSnapshotId, VolumeId};
use thiserror::Error;

/// Result type alias for snapchain operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during snapshot lifecycle operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid transition for {entity} {id}: event {event} not allowed in state {state}")]
    InvalidTransition {
        entity: &'static str,
        id: u64,
        state: String,
        event: String,
    },

    #[error("No strategy can {operation} snapshot {snapshot}")]
    NoStrategyAvailable {
        snapshot: SnapshotId,
        operation: SnapshotOperation,
    },

    #[error("Snapshot {snapshot} is in use by volume {volume}. Remove the volume first.")]
    SnapshotInUse {
        snapshot: SnapshotId,
        volume: VolumeId,
    },

    #[error("Another operation holds the lock on {0}")]
    LockAcquisitionFailed(String),

    #[error("Backend unavailable for {target}: {message}")]
    BackendUnavailable { target: String, message: String },

    #[error("Backend operation failed for {target}: {message}")]
    BackendOperationFailed { target: String, message: String },

    #[error("Chain integrity violation on snapshot {snapshot}: {reason}")]
    ChainIntegrityViolation { snapshot: u64, reason: String },

    #[error("Snapshot {0} not found")]
    SnapshotNotFound(SnapshotId),

    #[error("Volume {0} not found")]
    VolumeNotFound(VolumeId),

    #[error("Storage pool {0} not found")]
    PoolNotFound(DataStoreId),

    #[error("VM {0} not found")]
    VmNotFound(VmId),

    #[error("VM snapshot {0} not found")]
    VmSnapshotNotFound(VmSnapshotId),

    #[error("Snapshot {snapshot} lives on pool {snapshot_pool} but its volume is on pool {volume_pool}")]
    PoolMismatch {
        snapshot: SnapshotId,
        snapshot_pool: DataStoreId,
        volume_pool: DataStoreId,
    },

    #[error("Snapshot {0} has no ready copy on primary storage")]
    NotOnPrimary(SnapshotId),

    #[error("VM {0} is running. Stop it first.")]
    VmRunning(VmId),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap a driver failure with the object it was working on
    pub fn backend(target: impl Into<String>, err: DriverError) -> Self {
        let target = target.into();
        match err {
            DriverError::Unavailable(message) => Error::BackendUnavailable { target, message },
            DriverError::Failed(message) => Error::BackendOperationFailed { target, message },
        }
    }

    /// Whether the caller may reasonably retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SnapshotInUse { .. }
                | Error::LockAcquisitionFailed(_)
                | Error::BackendUnavailable { .. }
        )
    }

    /// No backend is able to perform the operation at all
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::NoStrategyAvailable { .. })
    }

    /// Error raised by a backend call, as opposed to validation
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable { .. } | Error::BackendOperationFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_keep_target_and_message() {
        let err = Error::backend("snapshot 7 on store 2", DriverError::Failed("disk full".into()));
        assert_eq!(
            err.to_string(),
            "Backend operation failed for snapshot 7 on store 2: disk full"
        );
        assert!(!err.is_retryable());
        assert!(err.is_backend());

        let err = Error::backend("snapshot 7", DriverError::Unavailable("timeout".into()));
        assert!(err.is_retryable());
    }

    #[test]
    fn in_use_and_unsupported_are_distinguished() {
        let in_use = Error::SnapshotInUse {
            snapshot: SnapshotId(1),
            volume: VolumeId(9),
        };
        assert!(in_use.is_retryable());
        assert!(!in_use.is_unsupported());

        let unsupported = Error::NoStrategyAvailable {
            snapshot: SnapshotId(1),
            operation: SnapshotOperation::Revert,
        };
        assert!(unsupported.is_unsupported());
        assert!(!unsupported.is_retryable());
        assert_eq!(unsupported.to_string(), "No strategy can revert snapshot 1");
    }
}
