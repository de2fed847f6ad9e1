//! Lifecycle of a snapshot's representation at one datastore

use super::StateMachine;
use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectState {
    Allocated,
    Creating,
    Ready,
    /// A cross-store copy reading from this object is in flight
    Copying,
    Destroying,
    Destroyed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectEvent {
    CreateOnlyRequested,
    OperationSucceeded,
    OperationFailed,
    DestroyRequested,
    CopyRequested,
}

/// What the store must do with the reference row after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectOutcome {
    /// Persist the row in the new state
    Transitioned(ObjectState),
    /// The object was never created; delete the row outright
    Discard,
}

impl ObjectState {
    /// States the delete walk may reclaim
    pub fn is_deletable(&self) -> bool {
        matches!(
            self,
            ObjectState::Destroying | ObjectState::Destroyed | ObjectState::Error
        )
    }

    /// A reference that still counts as a chain member
    pub fn is_live(&self) -> bool {
        !self.is_deletable()
    }

    fn is_incomplete(&self) -> bool {
        matches!(self, ObjectState::Allocated | ObjectState::Creating)
    }

    /// Resolve `event` into what the store has to do with the row.
    ///
    /// A failure while the object is still being created discards the row.
    /// A failure while destroying keeps the row in `Error` for cleanup.
    pub fn resolve(self, id: u64, event: ObjectEvent) -> Result<ObjectOutcome> {
        let next = self.apply(id, event)?;
        if event == ObjectEvent::OperationFailed && self.is_incomplete() {
            return Ok(ObjectOutcome::Discard);
        }
        Ok(ObjectOutcome::Transitioned(next))
    }
}

impl StateMachine for ObjectState {
    type Event = ObjectEvent;

    const ENTITY: &'static str = "snapshot store ref";

    fn next(self, event: ObjectEvent) -> Option<ObjectState> {
        use ObjectEvent::*;
        use ObjectState::*;

        match (self, event) {
            (Allocated, CreateOnlyRequested) => Some(Creating),
            (Allocated, DestroyRequested) => Some(Destroying),
            (Allocated, OperationFailed) => Some(Error),
            (Creating, OperationSucceeded) => Some(Ready),
            (Creating, OperationFailed) => Some(Error),
            (Ready, CopyRequested) => Some(Copying),
            (Ready, DestroyRequested) => Some(Destroying),
            (Copying, OperationSucceeded) => Some(Ready),
            (Copying, OperationFailed) => Some(Ready),
            (Destroying, OperationSucceeded) => Some(Destroyed),
            (Destroying, OperationFailed) => Some(Error),
            (Error, DestroyRequested) => Some(Destroying),
            _ => None,
        }
    }
}
