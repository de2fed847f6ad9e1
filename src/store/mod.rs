//! Entity store: durable records and the DAO the lifecycle core runs against
//!
//! The core never keeps a child pointer. Children are always found through
//! a reverse query on the parent id (`list_by_parent`, `vm_snapshot_children`),
//! so deleting a node out of order cannot leave a dangling child reference.

mod memory;

pub use memory::InMemoryEntityStore;

use crate::error::Result;
use crate::state::{ObjectState, SnapshotState, VmSnapshotState, VolumeState};
use crate::types::{
    DataStoreId, DataStoreRole, HostId, HypervisorType, ImageFormat, LocationType, RefId,
    SnapshotId, SnapshotType, VmId, VmSnapshotId, VmSnapshotType, VolumeId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The logical snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: SnapshotId,
    pub volume_id: VolumeId,
    pub name: String,
    pub state: SnapshotState,
    pub snapshot_type: SnapshotType,
    pub location_type: Option<LocationType>,
    pub hypervisor: HypervisorType,
    /// Unset until the first backup decides it
    pub full_backup: Option<bool>,
    /// Virtual size of the volume at snapshot time
    pub size: u64,
    pub created: DateTime<Utc>,
    pub removed: Option<DateTime<Utc>>,
}

impl SnapshotRecord {
    /// A fresh record in `Allocated`; the store assigns the id on insert
    pub fn allocate(
        volume: &VolumeRecord,
        name: impl Into<String>,
        snapshot_type: SnapshotType,
    ) -> Self {
        Self {
            id: SnapshotId(0),
            volume_id: volume.id,
            name: name.into(),
            state: SnapshotState::Allocated,
            snapshot_type,
            location_type: None,
            hypervisor: volume.hypervisor,
            full_backup: None,
            size: volume.size,
            created: Utc::now(),
            removed: None,
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed.is_some()
    }
}

/// One row per (snapshot, datastore, role)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDataStoreRef {
    pub id: RefId,
    pub snapshot_id: SnapshotId,
    pub volume_id: VolumeId,
    pub store_id: DataStoreId,
    pub role: DataStoreRole,
    pub state: ObjectState,
    pub install_path: Option<String>,
    pub physical_size: u64,
    /// Position in the delta chain for this role only
    pub parent_snapshot_id: Option<SnapshotId>,
    pub ref_count: u32,
    pub created: DateTime<Utc>,
}

impl SnapshotDataStoreRef {
    /// A fresh reference in `Allocated`; the store assigns the id on insert
    pub fn allocate(
        snapshot: &SnapshotRecord,
        store_id: DataStoreId,
        role: DataStoreRole,
        parent_snapshot_id: Option<SnapshotId>,
    ) -> Self {
        Self {
            id: RefId(0),
            snapshot_id: snapshot.id,
            volume_id: snapshot.volume_id,
            store_id,
            role,
            state: ObjectState::Allocated,
            install_path: None,
            physical_size: 0,
            parent_snapshot_id,
            ref_count: 0,
            created: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: VolumeId,
    pub name: String,
    pub state: VolumeState,
    pub pool_id: Option<DataStoreId>,
    pub format: ImageFormat,
    pub hypervisor: HypervisorType,
    pub size: u64,
    /// Current top of the disk chain on primary storage
    pub path: String,
    pub vm_id: Option<VmId>,
    /// Set on volumes created from a snapshot
    pub source_snapshot_id: Option<SnapshotId>,
    pub removed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePoolRecord {
    pub id: DataStoreId,
    pub name: String,
    pub role: DataStoreRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: VmId,
    pub name: String,
    pub hypervisor: HypervisorType,
    pub running: bool,
    pub host_id: Option<HostId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSnapshotRecord {
    pub id: VmSnapshotId,
    pub vm_id: VmId,
    pub name: String,
    pub parent: Option<VmSnapshotId>,
    /// The live disks sit on top of this snapshot
    pub current: bool,
    pub state: VmSnapshotState,
    pub kind: VmSnapshotType,
    /// Recorded when the snapshot is hidden
    pub physical_size: u64,
    pub created: DateTime<Utc>,
    pub removed: Option<DateTime<Utc>>,
}

impl VmSnapshotRecord {
    pub fn allocate(vm: &VmRecord, name: impl Into<String>, kind: VmSnapshotType) -> Self {
        Self {
            id: VmSnapshotId(0),
            vm_id: vm.id,
            name: name.into(),
            parent: None,
            current: false,
            state: VmSnapshotState::Allocated,
            kind,
            physical_size: 0,
            created: Utc::now(),
            removed: None,
        }
    }
}

/// The delta file one VM snapshot froze for one disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSnapshotDiskRef {
    pub id: RefId,
    pub vm_snapshot_id: VmSnapshotId,
    pub volume_id: VolumeId,
    pub store_id: DataStoreId,
    pub path: String,
    pub physical_size: u64,
}

/// One mutation inside an atomic [`EntityStore::apply`] batch
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    UpdateSnapshot(SnapshotRecord),
    UpdateRef(SnapshotDataStoreRef),
    ExpungeRef(RefId),
    UpdateVolume(VolumeRecord),
    UpdateVmSnapshot(VmSnapshotRecord),
    /// The store assigns the id; the owning VM snapshot must exist
    InsertVmSnapshotDisk(VmSnapshotDiskRef),
    UpdateVmSnapshotDisk(VmSnapshotDiskRef),
    ExpungeVmSnapshotDisk(RefId),
}

/// Narrow CRUD and chain-navigation queries over the durable records
///
/// Single-row updates are last-writer-wins. Anything that must change
/// several rows together goes through [`apply`](EntityStore::apply).
pub trait EntityStore: Send + Sync {
    // === Snapshots ===

    fn snapshot(&self, id: SnapshotId) -> Result<Option<SnapshotRecord>>;

    /// Insert a new record and return it with its assigned id
    fn insert_snapshot(&self, snapshot: SnapshotRecord) -> Result<SnapshotRecord>;

    fn update_snapshot(&self, snapshot: &SnapshotRecord) -> Result<()>;

    fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>>;

    // === Snapshot datastore references ===

    fn insert_ref(&self, store_ref: SnapshotDataStoreRef) -> Result<SnapshotDataStoreRef>;

    fn update_ref(&self, store_ref: &SnapshotDataStoreRef) -> Result<()>;

    fn expunge_ref(&self, id: RefId) -> Result<()>;

    fn refs_for_snapshot(&self, snapshot: SnapshotId) -> Result<Vec<SnapshotDataStoreRef>>;

    /// The reference of `snapshot` in `role`, if any
    fn find_by_snapshot(
        &self,
        snapshot: SnapshotId,
        role: DataStoreRole,
    ) -> Result<Option<SnapshotDataStoreRef>>;

    /// Newest `Ready` reference of a volume's snapshots in `role`
    fn latest_ref_for_volume(
        &self,
        volume: VolumeId,
        role: DataStoreRole,
    ) -> Result<Option<SnapshotDataStoreRef>>;

    /// Oldest `Ready` reference of a volume's snapshots in `role`
    fn oldest_ref_for_volume(
        &self,
        volume: VolumeId,
        role: DataStoreRole,
    ) -> Result<Option<SnapshotDataStoreRef>>;

    /// All references whose parent in `role` is `parent`
    fn list_by_parent(
        &self,
        parent: SnapshotId,
        role: DataStoreRole,
    ) -> Result<Vec<SnapshotDataStoreRef>>;

    fn refs_for_volume(
        &self,
        volume: VolumeId,
        role: DataStoreRole,
    ) -> Result<Vec<SnapshotDataStoreRef>>;

    // === Volumes, pools, VMs ===

    fn volume(&self, id: VolumeId) -> Result<Option<VolumeRecord>>;

    fn update_volume(&self, volume: &VolumeRecord) -> Result<()>;

    /// Live volumes created from `snapshot`
    fn volumes_from_snapshot(&self, snapshot: SnapshotId) -> Result<Vec<VolumeRecord>>;

    fn volumes_for_vm(&self, vm: VmId) -> Result<Vec<VolumeRecord>>;

    fn pool(&self, id: DataStoreId) -> Result<Option<StoragePoolRecord>>;

    /// All stores holding `role` data
    fn pools_by_role(&self, role: DataStoreRole) -> Result<Vec<StoragePoolRecord>>;

    fn vm(&self, id: VmId) -> Result<Option<VmRecord>>;

    // === VM snapshots ===

    fn vm_snapshot(&self, id: VmSnapshotId) -> Result<Option<VmSnapshotRecord>>;

    fn insert_vm_snapshot(&self, snapshot: VmSnapshotRecord) -> Result<VmSnapshotRecord>;

    fn update_vm_snapshot(&self, snapshot: &VmSnapshotRecord) -> Result<()>;

    /// Non-removed VM snapshots of a VM
    fn vm_snapshots_for_vm(&self, vm: VmId) -> Result<Vec<VmSnapshotRecord>>;

    /// Non-removed children of a VM snapshot
    fn vm_snapshot_children(&self, id: VmSnapshotId) -> Result<Vec<VmSnapshotRecord>>;

    fn current_vm_snapshot(&self, vm: VmId) -> Result<Option<VmSnapshotRecord>>;

    fn vm_snapshot_disks(&self, id: VmSnapshotId) -> Result<Vec<VmSnapshotDiskRef>>;

    // === Transactions ===

    /// Apply every op or none of them
    fn apply(&self, ops: Vec<StoreOp>) -> Result<()>;
}
