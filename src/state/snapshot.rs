//! Lifecycle of the logical snapshot entity

use super::StateMachine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotState {
    Allocated,
    Creating,
    CreatedOnPrimary,
    BackingUp,
    BackedUp,
    Copying,
    Destroying,
    Destroyed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotEvent {
    CreateRequested,
    OperationSucceeded,
    OperationFailed,
    /// The work was already done elsewhere (a parent backup is reused)
    OperationNotPerformed,
    BackupToSecondary,
    CopyingRequested,
    DestroyRequested,
}

impl SnapshotState {
    /// States from which a user delete may start
    pub fn is_deletable(&self) -> bool {
        matches!(
            self,
            SnapshotState::CreatedOnPrimary
                | SnapshotState::BackedUp
                | SnapshotState::Destroying
                | SnapshotState::Error
        )
    }
}

impl StateMachine for SnapshotState {
    type Event = SnapshotEvent;

    const ENTITY: &'static str = "snapshot";

    fn next(self, event: SnapshotEvent) -> Option<SnapshotState> {
        use SnapshotEvent::*;
        use SnapshotState::*;

        match (self, event) {
            (Allocated, CreateRequested) => Some(Creating),
            (Creating, OperationSucceeded) => Some(CreatedOnPrimary),
            (Creating, OperationNotPerformed) => Some(BackedUp),
            (Creating, OperationFailed) => Some(Error),
            (CreatedOnPrimary, BackupToSecondary) => Some(BackingUp),
            (CreatedOnPrimary, OperationNotPerformed) => Some(BackedUp),
            (CreatedOnPrimary, DestroyRequested) => Some(Destroying),
            (BackingUp, OperationSucceeded) => Some(BackedUp),
            (BackingUp, OperationNotPerformed) => Some(BackedUp),
            (BackingUp, OperationFailed) => Some(Error),
            (BackedUp, CopyingRequested) => Some(Copying),
            (BackedUp, DestroyRequested) => Some(Destroying),
            (Copying, OperationSucceeded) => Some(BackedUp),
            (Copying, OperationFailed) => Some(BackedUp),
            (Destroying, OperationSucceeded) => Some(Destroyed),
            (Destroying, OperationFailed) => Some(Error),
            (Error, DestroyRequested) => Some(Destroying),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(events: &[SnapshotEvent]) -> Option<SnapshotState> {
        events
            .iter()
            .try_fold(SnapshotState::Allocated, |s, e| s.next(*e))
    }

    #[test]
    fn take_backup_destroy() {
        use SnapshotEvent::*;
        assert_eq!(
            run(&[
                CreateRequested,
                OperationSucceeded,
                BackupToSecondary,
                OperationSucceeded,
                DestroyRequested,
                OperationSucceeded
            ]),
            Some(SnapshotState::Destroyed)
        );
    }

    #[test]
    fn reused_parent_backup_still_ends_backed_up() {
        use SnapshotEvent::*;
        assert_eq!(
            run(&[
                CreateRequested,
                OperationSucceeded,
                BackupToSecondary,
                OperationNotPerformed
            ]),
            Some(SnapshotState::BackedUp)
        );
    }

    #[test]
    fn errored_snapshot_can_be_destroyed() {
        use SnapshotEvent::*;
        assert_eq!(
            run(&[CreateRequested, OperationFailed, DestroyRequested]),
            Some(SnapshotState::Destroying)
        );
    }

    #[test]
    fn destroyed_is_terminal() {
        for event in [
            SnapshotEvent::CreateRequested,
            SnapshotEvent::DestroyRequested,
            SnapshotEvent::OperationSucceeded,
            SnapshotEvent::BackupToSecondary,
        ] {
            assert_eq!(SnapshotState::Destroyed.next(event), None);
        }
    }
}
