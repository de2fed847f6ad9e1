use super::StateMachine;
use serde::{Deserialize, Serialize};

/// Lifecycle of a VM-level snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmSnapshotState {
    Allocated,
    Creating,
    Ready,
    Reverting,
    Expunging,
    /// Deleted by the user, kept because other snapshots depend on its delta
    Hidden,
    Expunged,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmSnapshotEvent {
    CreateRequested,
    OperationSucceeded,
    OperationFailed,
    RevertRequested,
    ExpungeRequested,
    Hide,
}

impl VmSnapshotState {
    /// Still present on disk, whether or not users can see it
    pub fn is_live(&self) -> bool {
        !matches!(self, VmSnapshotState::Expunged)
    }

    pub fn is_user_visible(&self) -> bool {
        !matches!(self, VmSnapshotState::Hidden | VmSnapshotState::Expunged)
    }
}

impl StateMachine for VmSnapshotState {
    type Event = VmSnapshotEvent;

    const ENTITY: &'static str = "vm snapshot";

    fn next(self, event: VmSnapshotEvent) -> Option<VmSnapshotState> {
        use VmSnapshotEvent::*;
        use VmSnapshotState::*;

        match (self, event) {
            (Allocated, CreateRequested) => Some(Creating),
            (Creating, OperationSucceeded) => Some(Ready),
            (Creating, OperationFailed) => Some(Error),
            (Ready, RevertRequested) => Some(Reverting),
            (Reverting, OperationSucceeded) => Some(Ready),
            (Reverting, OperationFailed) => Some(Ready),
            (Ready, ExpungeRequested) => Some(Expunging),
            (Hidden, ExpungeRequested) => Some(Expunging),
            (Error, ExpungeRequested) => Some(Expunging),
            (Expunging, OperationSucceeded) => Some(Expunged),
            (Expunging, OperationFailed) => Some(Error),
            (Expunging, Hide) => Some(Hidden),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_snapshot_can_still_be_expunged() {
        let s = VmSnapshotState::Ready
            .next(VmSnapshotEvent::ExpungeRequested)
            .and_then(|s| s.next(VmSnapshotEvent::Hide))
            .unwrap();
        assert_eq!(s, VmSnapshotState::Hidden);
        assert!(!s.is_user_visible());
        assert!(s.is_live());
        assert_eq!(
            s.next(VmSnapshotEvent::ExpungeRequested)
                .and_then(|s| s.next(VmSnapshotEvent::OperationSucceeded)),
            Some(VmSnapshotState::Expunged)
        );
    }

    #[test]
    fn hidden_snapshot_cannot_be_reverted_to() {
        assert_eq!(
            VmSnapshotState::Hidden.next(VmSnapshotEvent::RevertRequested),
            None
        );
    }
}
