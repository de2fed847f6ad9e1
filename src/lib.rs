//! snapchain: snapshot lifecycle core for volumes and VMs
//!
//! This library keeps delta chains of volume snapshots and VM snapshot trees
//! consistent while a pluggable backend does the actual storage work. It
//! decides between full and delta backups, dispatches each operation to the
//! strategy best suited to the storage pool, prunes chains tail-first and
//! merges VM snapshot files when a node is deleted.

pub mod backend;
pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod lock;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod strategy;
pub mod types;
pub mod vmsnapshot;

#[cfg(test)]
mod testing;

pub use backend::{BackendDriver, MockBackendDriver};
pub use chain::{BackupPlan, VolumeSnapshotChain};
pub use config::SnapshotConfig;
pub use error::{Error, Result};
pub use events::{LogSink, UsageEvent, UsageSink};
pub use snapshot::{DeleteOutcome, SnapshotService};
pub use store::{EntityStore, InMemoryEntityStore};
pub use strategy::{SnapshotOperation, StrategyPriority, StrategyRegistry};
pub use types::{
    DataStoreId, DataStoreRole, HypervisorType, ImageFormat, SnapshotId, SnapshotType, VmId,
    VmSnapshotId, VolumeId,
};
pub use vmsnapshot::{VmSnapshotDeleteOutcome, VmSnapshotManager};
