//! Backend driver trait and implementations
//!
//! A driver performs the actual snapshot, copy, delete, revert and merge I/O.
//! Calls are blocking from the core's point of view: each one returns once the
//! driver's completion has resolved, and an `Err` is the only failure signal.

mod mock;

pub use mock::{DriverCall, DriverOp, MockBackendDriver};

use crate::types::{
    DataStoreId, DataStoreRole, HostId, HypervisorType, ImageFormat, SnapshotId, VmId,
    VmSnapshotId, VolumeId,
};
use std::collections::BTreeMap;
use thiserror::Error;

/// Capabilities keyed by name, as advertised by a datastore
pub type Capabilities = BTreeMap<String, String>;

/// The pool can roll a volume back to one of its snapshots in place
pub const CAN_REVERT_VOLUME_TO_SNAPSHOT: &str = "CAN_REVERT_VOLUME_TO_SNAPSHOT";
/// The pool takes and deletes snapshots natively
pub const STORAGE_SYSTEM_SNAPSHOT: &str = "STORAGE_SYSTEM_SNAPSHOT";

/// Whether `caps` advertises `key` as `true`
pub fn capability_enabled(caps: &Capabilities, key: &str) -> bool {
    caps.get(key)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Failure reported by a driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// A snapshot as seen by a driver at one datastore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotTo {
    pub snapshot_id: SnapshotId,
    pub volume_id: VolumeId,
    pub store_id: DataStoreId,
    pub role: DataStoreRole,
    pub hypervisor: HypervisorType,
    pub path: Option<String>,
    /// Install path of the parent in the same role, for delta operations
    pub parent_path: Option<String>,
    pub full_backup: bool,
}

impl SnapshotTo {
    /// Human-readable target for error context
    pub fn target(&self) -> String {
        format!(
            "snapshot {} on {} store {}",
            self.snapshot_id, self.role, self.store_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeTo {
    pub volume_id: VolumeId,
    pub pool_id: DataStoreId,
    pub path: String,
    pub format: ImageFormat,
}

/// Result of a take or copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotAnswer {
    pub install_path: String,
    pub physical_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmTo {
    pub vm_id: VmId,
    pub name: String,
    pub hypervisor: HypervisorType,
    pub running: bool,
    pub host_id: Option<HostId>,
}

/// One disk file of a VM snapshot tree. `vm_snapshot_id` is `None` for
/// the live top of the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSnapshotTo {
    pub volume_id: VolumeId,
    pub vm_snapshot_id: Option<VmSnapshotId>,
    pub path: String,
}

/// Collapse `child` into `parent` on one disk and rebase `grandchildren`
/// onto the result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeTreeNode {
    pub parent: DiskSnapshotTo,
    pub child: DiskSnapshotTo,
    pub grandchildren: Vec<DiskSnapshotTo>,
}

/// Outcome of one merge-tree node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeAnswer {
    pub volume_id: VolumeId,
    /// File that now holds the merged content
    pub surviving_path: String,
}

/// Per-disk result of taking a VM snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSnapshotAnswer {
    pub volume_id: VolumeId,
    /// The file frozen by the snapshot
    pub snapshot_path: String,
    /// New live top the VM writes to
    pub live_path: String,
    pub physical_size: u64,
}

/// Per-disk result of reverting to a VM snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRevertAnswer {
    pub volume_id: VolumeId,
    pub live_path: String,
}

/// Narrow interface to the storage and hypervisor backends
pub trait BackendDriver: Send + Sync {
    // === Volume snapshots ===

    /// Snapshot a volume on its primary pool
    fn take_snapshot(&self, snapshot: &SnapshotTo) -> DriverResult<SnapshotAnswer>;

    /// Copy a snapshot between datastores (primary to image for backups)
    fn copy(&self, src: &SnapshotTo, dst: &SnapshotTo) -> DriverResult<SnapshotAnswer>;

    /// Delete a snapshot object from its datastore
    fn delete(&self, snapshot: &SnapshotTo) -> DriverResult<()>;

    /// Roll `volume` back to `snapshot` in place
    fn revert_snapshot(&self, snapshot: &SnapshotTo, volume: &VolumeTo) -> DriverResult<()>;

    fn capabilities(&self, store: DataStoreId) -> DriverResult<Capabilities>;

    fn revoke_access(&self, volume: &VolumeTo, host: HostId) -> DriverResult<()>;

    fn grant_access(&self, volume: &VolumeTo, host: HostId) -> DriverResult<()>;

    // === VM snapshots ===

    /// Freeze every disk of the VM and start new live overlays
    fn take_vm_snapshot(
        &self,
        vm: &VmTo,
        snapshot: VmSnapshotId,
        disks: &[DiskSnapshotTo],
    ) -> DriverResult<Vec<DiskSnapshotAnswer>>;

    /// Point every disk of the VM at a new overlay on top of `disks`
    fn revert_vm_snapshot(
        &self,
        vm: &VmTo,
        disks: &[DiskSnapshotTo],
    ) -> DriverResult<Vec<DiskRevertAnswer>>;

    /// Run one merge-tree node per disk as a single operation
    fn merge_snapshot_tree(
        &self,
        vm: &VmTo,
        nodes: &[MergeTreeNode],
    ) -> DriverResult<Vec<MergeAnswer>>;
}
