//! Shared fixtures for unit tests

use crate::backend::{Capabilities, MockBackendDriver};
use crate::config::SnapshotConfig;
use crate::events::RecordingSink;
use crate::snapshot::SnapshotService;
use crate::state::{ObjectState, SnapshotState, VolumeState};
use crate::store::{
    EntityStore, InMemoryEntityStore, SnapshotDataStoreRef, SnapshotRecord, StoragePoolRecord,
    VmRecord, VolumeRecord,
};
use crate::strategy::StrategyContext;
use crate::types::{
    DataStoreId, DataStoreRole, HostId, HypervisorType, ImageFormat, SnapshotId, SnapshotType,
    VmId, VolumeId,
};
use crate::vmsnapshot::VmSnapshotManager;
use std::sync::Arc;

pub const POOL: DataStoreId = DataStoreId(1);
pub const IMAGE_STORE: DataStoreId = DataStoreId(2);
pub const CACHE_STORE: DataStoreId = DataStoreId(3);

/// One volume on one primary pool, an image store and an image cache
pub struct Fixture {
    pub store: Arc<InMemoryEntityStore>,
    pub driver: Arc<MockBackendDriver>,
    pub events: Arc<RecordingSink>,
    pub config: SnapshotConfig,
    pub volume_id: VolumeId,
}

impl Fixture {
    pub fn xen() -> Self {
        Self::build(HypervisorType::XenServer, ImageFormat::Vhd)
    }

    pub fn kvm() -> Self {
        Self::build(HypervisorType::Kvm, ImageFormat::Qcow2)
    }

    fn build(hypervisor: HypervisorType, format: ImageFormat) -> Self {
        let store = Arc::new(InMemoryEntityStore::new());
        for (id, name, role) in [
            (POOL, "pool-1", DataStoreRole::Primary),
            (IMAGE_STORE, "secondary-1", DataStoreRole::Image),
            (CACHE_STORE, "cache-1", DataStoreRole::ImageCache),
        ] {
            store
                .insert_pool(StoragePoolRecord {
                    id,
                    name: name.into(),
                    role,
                })
                .unwrap();
        }
        let volume_id = VolumeId(10);
        store
            .insert_volume(VolumeRecord {
                id: volume_id,
                name: "root-10".into(),
                state: VolumeState::Ready,
                pool_id: Some(POOL),
                format,
                hypervisor,
                size: 20 << 30,
                path: "vol-10/base".into(),
                vm_id: None,
                source_snapshot_id: None,
                removed: None,
            })
            .unwrap();
        Self {
            store,
            driver: Arc::new(MockBackendDriver::new()),
            events: Arc::new(RecordingSink::new()),
            config: SnapshotConfig::default(),
            volume_id,
        }
    }

    pub fn with_delta_max(self, delta_max: u32) -> Self {
        self.with_config("snapshot.delta.max", &delta_max.to_string())
    }

    pub fn with_config(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value).unwrap();
        self
    }

    pub fn context(&self) -> StrategyContext {
        StrategyContext::new(
            self.store.clone(),
            self.driver.clone(),
            self.config.clone(),
            self.events.clone(),
        )
    }

    pub fn service(&self) -> SnapshotService {
        SnapshotService::new(
            self.store.clone(),
            self.driver.clone(),
            self.config.clone(),
            self.events.clone(),
        )
    }

    pub fn vm_snapshots(&self) -> VmSnapshotManager {
        VmSnapshotManager::new(
            self.store.clone(),
            self.driver.clone(),
            self.config.clone(),
            self.events.clone(),
        )
    }

    /// Advertise capabilities as `true` on the volume's pool
    pub fn advertise(&self, keys: &[&str]) {
        let caps: Capabilities = keys
            .iter()
            .map(|k| (k.to_string(), "true".to_string()))
            .collect();
        self.driver.set_capabilities(POOL, caps);
    }

    pub fn volume(&self) -> VolumeRecord {
        self.store.volume(self.volume_id).unwrap().unwrap()
    }

    pub fn snapshot(&self, id: SnapshotId) -> SnapshotRecord {
        self.store.snapshot(id).unwrap().unwrap()
    }

    pub fn ref_of(&self, id: SnapshotId, role: DataStoreRole) -> Option<SnapshotDataStoreRef> {
        self.store.find_by_snapshot(id, role).unwrap()
    }

    pub fn set_ref_state(&self, id: SnapshotId, role: DataStoreRole, state: ObjectState) {
        let mut r = self.ref_of(id, role).unwrap();
        r.state = state;
        self.store.update_ref(&r).unwrap();
    }

    fn insert_snapshot(&self, name: &str, state: SnapshotState) -> SnapshotRecord {
        let mut snap = SnapshotRecord::allocate(&self.volume(), name, SnapshotType::Manual);
        snap.state = state;
        self.store.insert_snapshot(snap).unwrap()
    }

    fn insert_ref(
        &self,
        snap: &SnapshotRecord,
        store_id: DataStoreId,
        role: DataStoreRole,
        parent: Option<SnapshotId>,
        path: String,
        size: u64,
    ) -> SnapshotDataStoreRef {
        let mut r = SnapshotDataStoreRef::allocate(snap, store_id, role, parent);
        r.state = ObjectState::Ready;
        r.install_path = Some(path);
        r.physical_size = size;
        self.store.insert_ref(r).unwrap()
    }

    /// A snapshot that exists on primary only, chained like a fresh take
    pub fn primary_snapshot(&self, name: &str) -> SnapshotRecord {
        let volume = self.volume();
        let parent = if self.config.supports_incremental(volume.hypervisor) {
            self.store
                .latest_ref_for_volume(volume.id, DataStoreRole::Primary)
                .unwrap()
                .map(|r| r.snapshot_id)
        } else {
            None
        };
        let snap = self.insert_snapshot(name, SnapshotState::CreatedOnPrimary);
        self.insert_ref(
            &snap,
            volume.pool_id.unwrap(),
            DataStoreRole::Primary,
            parent,
            format!("primary/{}/snap-{}", volume.id, snap.id),
            1024,
        );
        snap
    }

    /// A backed-up snapshot whose primary and image references both hang
    /// off `parent`
    pub fn backed_up_snapshot(&self, name: &str, parent: Option<SnapshotId>) -> SnapshotRecord {
        let volume = self.volume();
        let mut snap = self.insert_snapshot(name, SnapshotState::BackedUp);
        snap.full_backup = Some(parent.is_none());
        self.store.update_snapshot(&snap).unwrap();
        self.insert_ref(
            &snap,
            volume.pool_id.unwrap(),
            DataStoreRole::Primary,
            parent,
            format!("primary/{}/snap-{}", volume.id, snap.id),
            1024,
        );
        self.insert_ref(
            &snap,
            IMAGE_STORE,
            DataStoreRole::Image,
            parent,
            format!("snapshots/{}/{}", volume.id, snap.id),
            if parent.is_none() { 4096 } else { 512 },
        );
        snap
    }

    /// Stage a copy of a backed-up snapshot on the image cache
    pub fn cache_copy(&self, id: SnapshotId) -> SnapshotDataStoreRef {
        let snap = self.snapshot(id);
        self.insert_ref(
            &snap,
            CACHE_STORE,
            DataStoreRole::ImageCache,
            None,
            format!("cache/{}/{}", snap.volume_id, id),
            4096,
        )
    }

    /// A live volume created from `snapshot`
    pub fn volume_from_snapshot(&self, id: VolumeId, snapshot: SnapshotId) {
        let mut volume = self.volume();
        volume.id = id;
        volume.name = format!("restored-{}", id);
        volume.path = format!("vol-{}/base", id);
        volume.source_snapshot_id = Some(snapshot);
        self.store.insert_volume(volume).unwrap();
    }

    /// Put the fixture volume on a running VM
    pub fn attach_to_vm(&self, vm_id: VmId, host_id: Option<HostId>) {
        let volume = self.volume();
        self.store
            .insert_vm(VmRecord {
                id: vm_id,
                name: format!("vm-{}", vm_id),
                hypervisor: volume.hypervisor,
                running: true,
                host_id,
            })
            .unwrap();
        let mut volume = volume;
        volume.vm_id = Some(vm_id);
        self.store.update_volume(&volume).unwrap();
    }

    /// A VM with `disks` volumes of its own; returns the VM id and its volumes
    pub fn vm_with_disks(&self, vm_id: VmId, running: bool, disks: u64) -> (VmId, Vec<VolumeId>) {
        self.store
            .insert_vm(VmRecord {
                id: vm_id,
                name: format!("vm-{}", vm_id),
                hypervisor: HypervisorType::Kvm,
                running,
                host_id: Some(HostId(1)),
            })
            .unwrap();
        let volumes = (1..=disks)
            .map(|n| {
                let id = VolumeId(vm_id.get() * 100 + n);
                self.store
                    .insert_volume(VolumeRecord {
                        id,
                        name: format!("disk-{}", id),
                        state: VolumeState::Ready,
                        pool_id: Some(POOL),
                        format: ImageFormat::Qcow2,
                        hypervisor: HypervisorType::Kvm,
                        size: 10 << 30,
                        path: format!("vol-{}/base", id),
                        vm_id: Some(vm_id),
                        source_snapshot_id: None,
                        removed: None,
                    })
                    .unwrap();
                id
            })
            .collect();
        (vm_id, volumes)
    }
}
