//! In-memory entity store with optional JSON persistence

use super::{
    EntityStore, SnapshotDataStoreRef, SnapshotRecord, StoragePoolRecord, StoreOp, VmRecord,
    VmSnapshotDiskRef, VmSnapshotRecord, VolumeRecord,
};
use crate::error::{Error, Result};
use crate::state::{ObjectState, VolumeState};
use crate::types::{
    DataStoreId, DataStoreRole, RefId, SnapshotId, VmId, VmSnapshotId, VolumeId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Serialized form of the whole store
#[derive(Debug, Default, Serialize, Deserialize)]
struct Dump {
    #[serde(default)]
    pools: Vec<StoragePoolRecord>,
    #[serde(default)]
    vms: Vec<VmRecord>,
    #[serde(default)]
    volumes: Vec<VolumeRecord>,
    #[serde(default)]
    snapshots: Vec<SnapshotRecord>,
    #[serde(default)]
    snapshot_refs: Vec<SnapshotDataStoreRef>,
    #[serde(default)]
    vm_snapshots: Vec<VmSnapshotRecord>,
    #[serde(default)]
    vm_snapshot_disks: Vec<VmSnapshotDiskRef>,
}

/// Secondary index from parent id to child ids
#[derive(Debug, Default)]
struct ParentIndex {
    refs: HashMap<(SnapshotId, DataStoreRole), BTreeSet<RefId>>,
    vm_snapshots: HashMap<VmSnapshotId, BTreeSet<VmSnapshotId>>,
}

impl ParentIndex {
    fn link_ref(&mut self, r: &SnapshotDataStoreRef) {
        if let Some(parent) = r.parent_snapshot_id {
            self.refs.entry((parent, r.role)).or_default().insert(r.id);
        }
    }

    fn unlink_ref(&mut self, r: &SnapshotDataStoreRef) {
        if let Some(parent) = r.parent_snapshot_id {
            if let Some(children) = self.refs.get_mut(&(parent, r.role)) {
                children.remove(&r.id);
                if children.is_empty() {
                    self.refs.remove(&(parent, r.role));
                }
            }
        }
    }

    fn link_vm_snapshot(&mut self, s: &VmSnapshotRecord) {
        if let (Some(parent), None) = (s.parent, s.removed) {
            self.vm_snapshots.entry(parent).or_default().insert(s.id);
        }
    }

    fn unlink_vm_snapshot(&mut self, s: &VmSnapshotRecord) {
        if let Some(parent) = s.parent {
            if let Some(children) = self.vm_snapshots.get_mut(&parent) {
                children.remove(&s.id);
                if children.is_empty() {
                    self.vm_snapshots.remove(&parent);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    pools: BTreeMap<DataStoreId, StoragePoolRecord>,
    vms: BTreeMap<VmId, VmRecord>,
    volumes: BTreeMap<VolumeId, VolumeRecord>,
    snapshots: BTreeMap<SnapshotId, SnapshotRecord>,
    refs: BTreeMap<RefId, SnapshotDataStoreRef>,
    vm_snapshots: BTreeMap<VmSnapshotId, VmSnapshotRecord>,
    vm_snapshot_disks: BTreeMap<RefId, VmSnapshotDiskRef>,
    index: ParentIndex,
}

fn next_key<K: Copy + Ord, V>(map: &BTreeMap<K, V>, raw: impl Fn(K) -> u64) -> u64 {
    map.keys().next_back().map(|k| raw(*k) + 1).unwrap_or(1)
}

impl Tables {
    fn from_dump(dump: Dump) -> Self {
        let mut tables = Tables {
            pools: dump.pools.into_iter().map(|p| (p.id, p)).collect(),
            vms: dump.vms.into_iter().map(|v| (v.id, v)).collect(),
            volumes: dump.volumes.into_iter().map(|v| (v.id, v)).collect(),
            snapshots: dump.snapshots.into_iter().map(|s| (s.id, s)).collect(),
            refs: dump.snapshot_refs.into_iter().map(|r| (r.id, r)).collect(),
            vm_snapshots: dump.vm_snapshots.into_iter().map(|s| (s.id, s)).collect(),
            vm_snapshot_disks: dump
                .vm_snapshot_disks
                .into_iter()
                .map(|d| (d.id, d))
                .collect(),
            index: ParentIndex::default(),
        };
        tables.rebuild_index();
        tables
    }

    fn to_dump(&self) -> Dump {
        Dump {
            pools: self.pools.values().cloned().collect(),
            vms: self.vms.values().cloned().collect(),
            volumes: self.volumes.values().cloned().collect(),
            snapshots: self.snapshots.values().cloned().collect(),
            snapshot_refs: self.refs.values().cloned().collect(),
            vm_snapshots: self.vm_snapshots.values().cloned().collect(),
            vm_snapshot_disks: self.vm_snapshot_disks.values().cloned().collect(),
        }
    }

    fn rebuild_index(&mut self) {
        let mut index = ParentIndex::default();
        for r in self.refs.values() {
            index.link_ref(r);
        }
        for s in self.vm_snapshots.values() {
            index.link_vm_snapshot(s);
        }
        self.index = index;
    }

    /// Snapshot refs and VM snapshot disk refs share one id space
    fn next_ref_id(&self) -> RefId {
        RefId(next_key(&self.refs, RefId::get).max(next_key(&self.vm_snapshot_disks, RefId::get)))
    }

    fn put_ref(&mut self, r: SnapshotDataStoreRef) {
        if let Some(old) = self.refs.get(&r.id) {
            self.index.unlink_ref(old);
        }
        self.index.link_ref(&r);
        self.refs.insert(r.id, r);
    }

    fn remove_ref(&mut self, id: RefId) {
        if let Some(old) = self.refs.remove(&id) {
            self.index.unlink_ref(&old);
        }
    }

    fn put_vm_snapshot(&mut self, s: VmSnapshotRecord) {
        if let Some(old) = self.vm_snapshots.get(&s.id) {
            self.index.unlink_vm_snapshot(old);
        }
        self.index.link_vm_snapshot(&s);
        self.vm_snapshots.insert(s.id, s);
    }

    fn check(&self, op: &StoreOp) -> Result<()> {
        let present = match op {
            StoreOp::UpdateSnapshot(s) => self.snapshots.contains_key(&s.id),
            StoreOp::UpdateRef(r) => self.refs.contains_key(&r.id),
            StoreOp::ExpungeRef(id) => self.refs.contains_key(id),
            StoreOp::UpdateVolume(v) => self.volumes.contains_key(&v.id),
            StoreOp::UpdateVmSnapshot(s) => self.vm_snapshots.contains_key(&s.id),
            StoreOp::InsertVmSnapshotDisk(d) => self.vm_snapshots.contains_key(&d.vm_snapshot_id),
            StoreOp::UpdateVmSnapshotDisk(d) => self.vm_snapshot_disks.contains_key(&d.id),
            StoreOp::ExpungeVmSnapshotDisk(id) => self.vm_snapshot_disks.contains_key(id),
        };
        if present {
            Ok(())
        } else {
            Err(Error::Other(format!("Transaction references a missing row: {:?}", op)))
        }
    }

    fn run(&mut self, op: StoreOp) {
        match op {
            StoreOp::UpdateSnapshot(s) => {
                self.snapshots.insert(s.id, s);
            }
            StoreOp::UpdateRef(r) => self.put_ref(r),
            StoreOp::ExpungeRef(id) => self.remove_ref(id),
            StoreOp::UpdateVolume(v) => {
                self.volumes.insert(v.id, v);
            }
            StoreOp::UpdateVmSnapshot(s) => self.put_vm_snapshot(s),
            StoreOp::InsertVmSnapshotDisk(mut d) => {
                d.id = self.next_ref_id();
                self.vm_snapshot_disks.insert(d.id, d);
            }
            StoreOp::UpdateVmSnapshotDisk(d) => {
                self.vm_snapshot_disks.insert(d.id, d);
            }
            StoreOp::ExpungeVmSnapshotDisk(id) => {
                self.vm_snapshot_disks.remove(&id);
            }
        }
    }

    fn ready_refs_for_volume(
        &self,
        volume: VolumeId,
        role: DataStoreRole,
    ) -> impl Iterator<Item = &SnapshotDataStoreRef> + '_ {
        self.refs.values().filter(move |r| {
            r.volume_id == volume && r.role == role && r.state == ObjectState::Ready
        })
    }
}

/// Entity store kept in process memory
///
/// Used as the test store and, through [`load`](Self::load) and
/// [`save`](Self::save), as the JSON-file store behind the CLI.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    tables: Mutex<Tables>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from a JSON file; a missing file gives an empty store
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let dump: Dump = serde_json::from_str(&content)?;
            Ok(Self {
                tables: Mutex::new(Tables::from_dump(dump)),
            })
        } else {
            Ok(Self::default())
        }
    }

    /// Save the store to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let dump = self.lock()?.to_dump();
        let content = serde_json::to_string_pretty(&dump)?;
        fs::write(path, content)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| Error::Other("entity store lock poisoned".to_string()))
    }

    pub fn insert_pool(&self, pool: StoragePoolRecord) -> Result<()> {
        self.lock()?.pools.insert(pool.id, pool);
        Ok(())
    }

    pub fn insert_vm(&self, vm: VmRecord) -> Result<()> {
        self.lock()?.vms.insert(vm.id, vm);
        Ok(())
    }

    pub fn update_vm(&self, vm: &VmRecord) -> Result<()> {
        let mut tables = self.lock()?;
        match tables.vms.get_mut(&vm.id) {
            Some(row) => {
                *row = vm.clone();
                Ok(())
            }
            None => Err(Error::VmNotFound(vm.id)),
        }
    }

    pub fn insert_volume(&self, volume: VolumeRecord) -> Result<()> {
        self.lock()?.volumes.insert(volume.id, volume);
        Ok(())
    }

    pub fn list_pools(&self) -> Result<Vec<StoragePoolRecord>> {
        Ok(self.lock()?.pools.values().cloned().collect())
    }

    pub fn list_vms(&self) -> Result<Vec<VmRecord>> {
        Ok(self.lock()?.vms.values().cloned().collect())
    }

    pub fn list_volumes(&self) -> Result<Vec<VolumeRecord>> {
        Ok(self.lock()?.volumes.values().cloned().collect())
    }
}

impl EntityStore for InMemoryEntityStore {
    fn snapshot(&self, id: SnapshotId) -> Result<Option<SnapshotRecord>> {
        Ok(self.lock()?.snapshots.get(&id).cloned())
    }

    fn insert_snapshot(&self, mut snapshot: SnapshotRecord) -> Result<SnapshotRecord> {
        let mut tables = self.lock()?;
        snapshot.id = SnapshotId(next_key(&tables.snapshots, SnapshotId::get));
        tables.snapshots.insert(snapshot.id, snapshot.clone());
        Ok(snapshot)
    }

    fn update_snapshot(&self, snapshot: &SnapshotRecord) -> Result<()> {
        let mut tables = self.lock()?;
        match tables.snapshots.get_mut(&snapshot.id) {
            Some(row) => {
                *row = snapshot.clone();
                Ok(())
            }
            None => Err(Error::SnapshotNotFound(snapshot.id)),
        }
    }

    fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>> {
        Ok(self.lock()?.snapshots.values().cloned().collect())
    }

    fn insert_ref(&self, mut store_ref: SnapshotDataStoreRef) -> Result<SnapshotDataStoreRef> {
        let mut tables = self.lock()?;
        store_ref.id = tables.next_ref_id();
        tables.put_ref(store_ref.clone());
        Ok(store_ref)
    }

    fn update_ref(&self, store_ref: &SnapshotDataStoreRef) -> Result<()> {
        let mut tables = self.lock()?;
        if !tables.refs.contains_key(&store_ref.id) {
            return Err(Error::Other(format!(
                "Snapshot store ref {} not found",
                store_ref.id
            )));
        }
        tables.put_ref(store_ref.clone());
        Ok(())
    }

    fn expunge_ref(&self, id: RefId) -> Result<()> {
        self.lock()?.remove_ref(id);
        Ok(())
    }

    fn refs_for_snapshot(&self, snapshot: SnapshotId) -> Result<Vec<SnapshotDataStoreRef>> {
        Ok(self
            .lock()?
            .refs
            .values()
            .filter(|r| r.snapshot_id == snapshot)
            .cloned()
            .collect())
    }

    fn find_by_snapshot(
        &self,
        snapshot: SnapshotId,
        role: DataStoreRole,
    ) -> Result<Option<SnapshotDataStoreRef>> {
        Ok(self
            .lock()?
            .refs
            .values()
            .find(|r| r.snapshot_id == snapshot && r.role == role)
            .cloned())
    }

    fn latest_ref_for_volume(
        &self,
        volume: VolumeId,
        role: DataStoreRole,
    ) -> Result<Option<SnapshotDataStoreRef>> {
        Ok(self
            .lock()?
            .ready_refs_for_volume(volume, role)
            .max_by_key(|r| (r.created, r.id))
            .cloned())
    }

    fn oldest_ref_for_volume(
        &self,
        volume: VolumeId,
        role: DataStoreRole,
    ) -> Result<Option<SnapshotDataStoreRef>> {
        Ok(self
            .lock()?
            .ready_refs_for_volume(volume, role)
            .min_by_key(|r| (r.created, r.id))
            .cloned())
    }

    fn list_by_parent(
        &self,
        parent: SnapshotId,
        role: DataStoreRole,
    ) -> Result<Vec<SnapshotDataStoreRef>> {
        let tables = self.lock()?;
        let children = match tables.index.refs.get(&(parent, role)) {
            Some(ids) => ids.iter().filter_map(|id| tables.refs.get(id)).cloned().collect(),
            None => Vec::new(),
        };
        Ok(children)
    }

    fn refs_for_volume(
        &self,
        volume: VolumeId,
        role: DataStoreRole,
    ) -> Result<Vec<SnapshotDataStoreRef>> {
        Ok(self
            .lock()?
            .refs
            .values()
            .filter(|r| r.volume_id == volume && r.role == role)
            .cloned()
            .collect())
    }

    fn volume(&self, id: VolumeId) -> Result<Option<VolumeRecord>> {
        Ok(self.lock()?.volumes.get(&id).cloned())
    }

    fn update_volume(&self, volume: &VolumeRecord) -> Result<()> {
        let mut tables = self.lock()?;
        match tables.volumes.get_mut(&volume.id) {
            Some(row) => {
                *row = volume.clone();
                Ok(())
            }
            None => Err(Error::VolumeNotFound(volume.id)),
        }
    }

    fn volumes_from_snapshot(&self, snapshot: SnapshotId) -> Result<Vec<VolumeRecord>> {
        Ok(self
            .lock()?
            .volumes
            .values()
            .filter(|v| {
                v.source_snapshot_id == Some(snapshot)
                    && v.removed.is_none()
                    && v.state != VolumeState::Destroyed
            })
            .cloned()
            .collect())
    }

    fn volumes_for_vm(&self, vm: VmId) -> Result<Vec<VolumeRecord>> {
        Ok(self
            .lock()?
            .volumes
            .values()
            .filter(|v| v.vm_id == Some(vm) && v.removed.is_none())
            .cloned()
            .collect())
    }

    fn pool(&self, id: DataStoreId) -> Result<Option<StoragePoolRecord>> {
        Ok(self.lock()?.pools.get(&id).cloned())
    }

    fn pools_by_role(&self, role: DataStoreRole) -> Result<Vec<StoragePoolRecord>> {
        Ok(self
            .lock()?
            .pools
            .values()
            .filter(|p| p.role == role)
            .cloned()
            .collect())
    }

    fn vm(&self, id: VmId) -> Result<Option<VmRecord>> {
        Ok(self.lock()?.vms.get(&id).cloned())
    }

    fn vm_snapshot(&self, id: VmSnapshotId) -> Result<Option<VmSnapshotRecord>> {
        Ok(self.lock()?.vm_snapshots.get(&id).cloned())
    }

    fn insert_vm_snapshot(&self, mut snapshot: VmSnapshotRecord) -> Result<VmSnapshotRecord> {
        let mut tables = self.lock()?;
        snapshot.id = VmSnapshotId(next_key(&tables.vm_snapshots, VmSnapshotId::get));
        tables.put_vm_snapshot(snapshot.clone());
        Ok(snapshot)
    }

    fn update_vm_snapshot(&self, snapshot: &VmSnapshotRecord) -> Result<()> {
        let mut tables = self.lock()?;
        if !tables.vm_snapshots.contains_key(&snapshot.id) {
            return Err(Error::VmSnapshotNotFound(snapshot.id));
        }
        tables.put_vm_snapshot(snapshot.clone());
        Ok(())
    }

    fn vm_snapshots_for_vm(&self, vm: VmId) -> Result<Vec<VmSnapshotRecord>> {
        Ok(self
            .lock()?
            .vm_snapshots
            .values()
            .filter(|s| s.vm_id == vm && s.removed.is_none())
            .cloned()
            .collect())
    }

    fn vm_snapshot_children(&self, id: VmSnapshotId) -> Result<Vec<VmSnapshotRecord>> {
        let tables = self.lock()?;
        let children = match tables.index.vm_snapshots.get(&id) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| tables.vm_snapshots.get(id))
                .filter(|s| s.removed.is_none())
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        Ok(children)
    }

    fn current_vm_snapshot(&self, vm: VmId) -> Result<Option<VmSnapshotRecord>> {
        Ok(self
            .lock()?
            .vm_snapshots
            .values()
            .find(|s| s.vm_id == vm && s.current && s.removed.is_none())
            .cloned())
    }

    fn vm_snapshot_disks(&self, id: VmSnapshotId) -> Result<Vec<VmSnapshotDiskRef>> {
        Ok(self
            .lock()?
            .vm_snapshot_disks
            .values()
            .filter(|d| d.vm_snapshot_id == id)
            .cloned()
            .collect())
    }

    fn apply(&self, ops: Vec<StoreOp>) -> Result<()> {
        let mut tables = self.lock()?;
        for op in &ops {
            tables.check(op)?;
        }
        for op in ops {
            tables.run(op);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use crate::types::{SnapshotType, VmSnapshotType};

    #[test]
    fn children_index_follows_reparenting() {
        let fx = Fixture::xen();
        let a = fx.backed_up_snapshot("a", None);
        let b = fx.backed_up_snapshot("b", Some(a.id));
        let c = fx.backed_up_snapshot("c", Some(b.id));

        let kids = fx.store.list_by_parent(b.id, DataStoreRole::Image).unwrap();
        assert_eq!(kids.len(), 1);
        assert_eq!(kids[0].snapshot_id, c.id);

        let mut c_ref = fx
            .store
            .find_by_snapshot(c.id, DataStoreRole::Image)
            .unwrap()
            .unwrap();
        c_ref.parent_snapshot_id = Some(a.id);
        fx.store.update_ref(&c_ref).unwrap();

        assert!(fx.store.list_by_parent(b.id, DataStoreRole::Image).unwrap().is_empty());
        assert_eq!(fx.store.list_by_parent(a.id, DataStoreRole::Image).unwrap().len(), 2);

        fx.store.expunge_ref(c_ref.id).unwrap();
        assert_eq!(fx.store.list_by_parent(a.id, DataStoreRole::Image).unwrap().len(), 1);
    }

    #[test]
    fn latest_and_oldest_ignore_unready_refs() {
        let fx = Fixture::xen();
        let a = fx.backed_up_snapshot("a", None);
        let b = fx.backed_up_snapshot("b", Some(a.id));
        let mut b_ref = fx
            .store
            .find_by_snapshot(b.id, DataStoreRole::Image)
            .unwrap()
            .unwrap();

        let latest = fx
            .store
            .latest_ref_for_volume(fx.volume_id, DataStoreRole::Image)
            .unwrap()
            .unwrap();
        assert_eq!(latest.snapshot_id, b.id);

        b_ref.state = ObjectState::Destroying;
        fx.store.update_ref(&b_ref).unwrap();
        let latest = fx
            .store
            .latest_ref_for_volume(fx.volume_id, DataStoreRole::Image)
            .unwrap()
            .unwrap();
        assert_eq!(latest.snapshot_id, a.id);
        let oldest = fx
            .store
            .oldest_ref_for_volume(fx.volume_id, DataStoreRole::Image)
            .unwrap()
            .unwrap();
        assert_eq!(oldest.snapshot_id, a.id);
    }

    #[test]
    fn apply_is_all_or_nothing() {
        let fx = Fixture::xen();
        let a = fx.backed_up_snapshot("a", None);
        let mut renamed = a.clone();
        renamed.name = "renamed".into();

        let err = fx
            .store
            .apply(vec![
                StoreOp::UpdateSnapshot(renamed),
                StoreOp::ExpungeRef(RefId(9_999)),
            ])
            .unwrap_err();
        assert!(err.to_string().contains("missing row"));
        assert_eq!(fx.store.snapshot(a.id).unwrap().unwrap().name, "a");
    }

    #[test]
    fn json_round_trip_rebuilds_index() {
        let fx = Fixture::xen();
        let a = fx.backed_up_snapshot("a", None);
        fx.backed_up_snapshot("b", Some(a.id));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fx.store.save(&path).unwrap();

        let loaded = InMemoryEntityStore::load(&path).unwrap();
        assert_eq!(loaded.list_snapshots().unwrap().len(), 2);
        assert_eq!(
            loaded.list_by_parent(a.id, DataStoreRole::Image).unwrap().len(),
            1
        );
        assert!(loaded.volume(fx.volume_id).unwrap().is_some());
    }

    #[test]
    fn missing_file_loads_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryEntityStore::load(&dir.path().join("nope.json")).unwrap();
        assert!(store.list_snapshots().unwrap().is_empty());
    }

    #[test]
    fn inserted_snapshots_get_increasing_ids() {
        let fx = Fixture::xen();
        let volume = fx.store.volume(fx.volume_id).unwrap().unwrap();
        let first = fx
            .store
            .insert_snapshot(SnapshotRecord::allocate(&volume, "x", SnapshotType::Manual))
            .unwrap();
        let second = fx
            .store
            .insert_snapshot(SnapshotRecord::allocate(&volume, "y", SnapshotType::Manual))
            .unwrap();
        assert!(second.id > first.id);
    }

    #[test]
    fn vm_snapshot_disks_are_inserted_with_the_batch() {
        let fx = Fixture::kvm();
        let (vm_id, volumes) = fx.vm_with_disks(VmId(4), false, 2);
        let vm = fx.store.vm(vm_id).unwrap().unwrap();
        let snap = fx
            .store
            .insert_vm_snapshot(VmSnapshotRecord::allocate(&vm, "s1", VmSnapshotType::Disk))
            .unwrap();
        let disk = |volume: VolumeId, vm_snapshot_id: VmSnapshotId| VmSnapshotDiskRef {
            id: RefId(0),
            vm_snapshot_id,
            volume_id: volume,
            store_id: DataStoreId(1),
            path: format!("frozen-{}", volume),
            physical_size: 10,
        };

        // a disk of an unknown snapshot sinks the whole batch
        let err = fx
            .store
            .apply(vec![
                StoreOp::InsertVmSnapshotDisk(disk(volumes[0], snap.id)),
                StoreOp::InsertVmSnapshotDisk(disk(volumes[1], VmSnapshotId(99))),
            ])
            .unwrap_err();
        assert!(err.to_string().contains("missing row"));
        assert!(fx.store.vm_snapshot_disks(snap.id).unwrap().is_empty());

        fx.store
            .apply(vec![
                StoreOp::InsertVmSnapshotDisk(disk(volumes[0], snap.id)),
                StoreOp::InsertVmSnapshotDisk(disk(volumes[1], snap.id)),
            ])
            .unwrap();
        let disks = fx.store.vm_snapshot_disks(snap.id).unwrap();
        assert_eq!(disks.len(), 2);
        assert_ne!(disks[0].id, disks[1].id);
        assert!(disks.iter().all(|d| d.id != RefId(0)));
    }
}
