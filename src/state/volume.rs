use super::StateMachine;
use serde::{Deserialize, Serialize};

/// Volume states the snapshot core cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeState {
    Allocated,
    Ready,
    Snapshotting,
    RevertSnapshotting,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeEvent {
    SnapshotRequested,
    RevertSnapshotRequested,
    OperationSucceeded,
    OperationFailed,
}

impl StateMachine for VolumeState {
    type Event = VolumeEvent;

    const ENTITY: &'static str = "volume";

    fn next(self, event: VolumeEvent) -> Option<VolumeState> {
        use VolumeEvent::*;
        use VolumeState::*;

        match (self, event) {
            (Ready, SnapshotRequested) => Some(Snapshotting),
            (Snapshotting, OperationSucceeded) => Some(Ready),
            (Snapshotting, OperationFailed) => Some(Ready),
            (Ready, RevertSnapshotRequested) => Some(RevertSnapshotting),
            (RevertSnapshotting, OperationSucceeded) => Some(Ready),
            (RevertSnapshotting, OperationFailed) => Some(Ready),
            _ => None,
        }
    }
}
