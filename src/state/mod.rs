//! Event-driven state machines for snapshots, datastore references,
//! volumes and VM snapshots
//!
//! Every machine is a pure transition table: `next` answers whether an event
//! is legal in a state, and `apply` turns an illegal pair into
//! [`Error::InvalidTransition`]. Persisting the new state is the caller's job,
//! and callers only persist after the backend has confirmed the outcome.

mod object;
mod snapshot;
mod vm_snapshot;
mod volume;

pub use object::{ObjectEvent, ObjectOutcome, ObjectState};
pub use snapshot::{SnapshotEvent, SnapshotState};
pub use vm_snapshot::{VmSnapshotEvent, VmSnapshotState};
pub use volume::{VolumeEvent, VolumeState};

use crate::error::{Error, Result};
use std::fmt::Debug;

/// A finite state machine over `Self` driven by `Self::Event`
pub trait StateMachine: Copy + Debug + Sized {
    type Event: Copy + Debug;

    /// Entity name used in error messages
    const ENTITY: &'static str;

    /// The state reached by `event`, or `None` if the table has no such edge
    fn next(self, event: Self::Event) -> Option<Self>;

    /// Like [`next`](Self::next), but an illegal event is an error
    fn apply(self, id: u64, event: Self::Event) -> Result<Self> {
        self.next(event).ok_or_else(|| Error::InvalidTransition {
            entity: Self::ENTITY,
            id,
            state: format!("{:?}", self),
            event: format!("{:?}", event),
        })
    }
}
