//! VM snapshot trees: create, revert and delete with merge
//!
//! A VM snapshot covers every disk of the VM at once, so every mutation is
//! serialized on a per-VM lock rather than per snapshot.

pub mod merge;

use crate::backend::{BackendDriver, DiskSnapshotTo, MergeAnswer, MergeTreeNode, VmTo};
use crate::config::SnapshotConfig;
use crate::error::{Error, Result};
use crate::events::{UsageEvent, UsageSink};
use crate::lock::LockTable;
use crate::state::{StateMachine, VmSnapshotEvent, VmSnapshotState};
use crate::store::{
    EntityStore, StoreOp, VmRecord, VmSnapshotDiskRef, VmSnapshotRecord, VolumeRecord,
};
use crate::types::{RefId, VmId, VmSnapshotId, VmSnapshotType};
use chrono::Utc;
use merge::MergeCase;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What a VM snapshot delete did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VmSnapshotDeleteOutcome {
    /// Snapshots whose files were merged away, the requested one first
    pub merged: Vec<VmSnapshotId>,
    /// Snapshots kept on disk but hidden from users
    pub hidden: Vec<VmSnapshotId>,
    /// Hidden ancestors whose follow-up merge failed; they stay hidden
    pub failed: Vec<VmSnapshotId>,
}

pub struct VmSnapshotManager {
    store: Arc<dyn EntityStore>,
    driver: Arc<dyn BackendDriver>,
    events: Arc<dyn UsageSink>,
    locks: LockTable<VmId>,
}

fn set_state(snapshot: &mut VmSnapshotRecord, event: VmSnapshotEvent) -> Result<()> {
    snapshot.state = snapshot.state.apply(snapshot.id.get(), event)?;
    Ok(())
}

/// Expunged, or removed after a failed create that left nothing on disk
fn is_gone(snapshot: &VmSnapshotRecord) -> bool {
    snapshot.state == VmSnapshotState::Expunged || snapshot.removed.is_some()
}

fn vm_to(vm: &VmRecord) -> VmTo {
    VmTo {
        vm_id: vm.id,
        name: vm.name.clone(),
        hypervisor: vm.hypervisor,
        running: vm.running,
        host_id: vm.host_id,
    }
}

impl VmSnapshotManager {
    pub fn new(
        store: Arc<dyn EntityStore>,
        driver: Arc<dyn BackendDriver>,
        config: SnapshotConfig,
        events: Arc<dyn UsageSink>,
    ) -> Self {
        Self {
            store,
            driver,
            events,
            locks: LockTable::new("vm", config.lock_wait()),
        }
    }

    pub fn locks(&self) -> &LockTable<VmId> {
        &self.locks
    }

    fn vm(&self, id: VmId) -> Result<VmRecord> {
        self.store.vm(id)?.ok_or(Error::VmNotFound(id))
    }

    fn vm_snapshot(&self, id: VmSnapshotId) -> Result<VmSnapshotRecord> {
        self.store
            .vm_snapshot(id)?
            .ok_or(Error::VmSnapshotNotFound(id))
    }

    fn volumes(&self, vm: VmId) -> Result<Vec<VolumeRecord>> {
        let volumes = self.store.volumes_for_vm(vm)?;
        if volumes.is_empty() {
            return Err(Error::Other(format!("VM {} has no volumes", vm)));
        }
        Ok(volumes)
    }

    // === Create ===

    /// Freeze every disk of the VM. The new snapshot becomes current.
    #[instrument(skip(self))]
    pub fn create_vm_snapshot(
        &self,
        vm_id: VmId,
        name: &str,
        kind: VmSnapshotType,
    ) -> Result<VmSnapshotRecord> {
        let vm = self.vm(vm_id)?;
        if kind == VmSnapshotType::DiskAndMemory && !vm.running {
            return Err(Error::Other(format!(
                "VM {} must be running to snapshot its memory",
                vm.id
            )));
        }
        let _guard = self.locks.acquire(vm.id)?;
        let volumes = self.volumes(vm.id)?;
        if let Some(volume) = volumes.iter().find(|v| v.pool_id.is_none()) {
            return Err(Error::Other(format!(
                "Volume {} is not on a primary pool",
                volume.id
            )));
        }

        let mut snapshot = self
            .store
            .insert_vm_snapshot(VmSnapshotRecord::allocate(&vm, name, kind))?;
        set_state(&mut snapshot, VmSnapshotEvent::CreateRequested)?;
        self.store.update_vm_snapshot(&snapshot)?;

        let disks: Vec<_> = volumes
            .iter()
            .map(|v| DiskSnapshotTo {
                volume_id: v.id,
                vm_snapshot_id: None,
                path: v.path.clone(),
            })
            .collect();

        let answers = match self.driver.take_vm_snapshot(&vm_to(&vm), snapshot.id, &disks) {
            Ok(answers) => answers,
            Err(e) => {
                set_state(&mut snapshot, VmSnapshotEvent::OperationFailed)?;
                snapshot.removed = Some(Utc::now());
                self.store.update_vm_snapshot(&snapshot)?;
                warn!(vm_id = %vm.id, error = %e, "VM snapshot failed");
                return Err(Error::backend(format!("VM {}", vm.id), e));
            }
        };

        let previous = self.store.current_vm_snapshot(vm.id)?;
        let mut ops = Vec::new();
        for answer in &answers {
            let Some(volume) = volumes.iter().find(|v| v.id == answer.volume_id) else {
                continue;
            };
            let Some(store_id) = volume.pool_id else {
                continue;
            };
            ops.push(StoreOp::InsertVmSnapshotDisk(VmSnapshotDiskRef {
                id: RefId(0),
                vm_snapshot_id: snapshot.id,
                volume_id: volume.id,
                store_id,
                path: answer.snapshot_path.clone(),
                physical_size: answer.physical_size,
            }));
            let mut volume = volume.clone();
            volume.path = answer.live_path.clone();
            ops.push(StoreOp::UpdateVolume(volume));
        }
        if let Some(mut previous) = previous.clone() {
            previous.current = false;
            ops.push(StoreOp::UpdateVmSnapshot(previous));
        }
        snapshot.parent = previous.map(|p| p.id);
        snapshot.current = true;
        set_state(&mut snapshot, VmSnapshotEvent::OperationSucceeded)?;
        ops.push(StoreOp::UpdateVmSnapshot(snapshot.clone()));
        self.store.apply(ops)?;

        info!(vm_id = %vm.id, vm_snapshot_id = %snapshot.id, "VM snapshot created");
        self.events.emit(UsageEvent::VmSnapshotCreated {
            vm_snapshot: snapshot.id,
        });
        Ok(snapshot)
    }

    // === Revert ===

    /// Put the VM's disks back on top of a snapshot, which becomes current
    #[instrument(skip(self))]
    pub fn revert_vm_snapshot(&self, id: VmSnapshotId) -> Result<VmSnapshotRecord> {
        let snapshot = self.vm_snapshot(id)?;
        let vm = self.vm(snapshot.vm_id)?;
        let _guard = self.locks.acquire(vm.id)?;
        let mut snapshot = self.vm_snapshot(id)?;

        if !snapshot.state.is_user_visible() || snapshot.removed.is_some() {
            return Err(Error::VmSnapshotNotFound(id));
        }
        snapshot
            .state
            .apply(id.get(), VmSnapshotEvent::RevertRequested)?;
        if snapshot.kind == VmSnapshotType::Disk && vm.running {
            return Err(Error::VmRunning(vm.id));
        }

        let volumes = self.volumes(vm.id)?;
        let disks: Vec<_> = self
            .store
            .vm_snapshot_disks(id)?
            .iter()
            .map(|d| DiskSnapshotTo {
                volume_id: d.volume_id,
                vm_snapshot_id: Some(id),
                path: d.path.clone(),
            })
            .collect();

        set_state(&mut snapshot, VmSnapshotEvent::RevertRequested)?;
        self.store.update_vm_snapshot(&snapshot)?;

        let answers = match self.driver.revert_vm_snapshot(&vm_to(&vm), &disks) {
            Ok(answers) => answers,
            Err(e) => {
                set_state(&mut snapshot, VmSnapshotEvent::OperationFailed)?;
                self.store.update_vm_snapshot(&snapshot)?;
                return Err(Error::backend(format!("VM snapshot {}", id), e));
            }
        };

        let mut ops = Vec::new();
        for answer in answers {
            if let Some(volume) = volumes.iter().find(|v| v.id == answer.volume_id) {
                let mut volume = volume.clone();
                volume.path = answer.live_path;
                ops.push(StoreOp::UpdateVolume(volume));
            }
        }
        if let Some(mut previous) = self.store.current_vm_snapshot(vm.id)? {
            if previous.id != id {
                previous.current = false;
                ops.push(StoreOp::UpdateVmSnapshot(previous));
            }
        }
        snapshot.current = true;
        set_state(&mut snapshot, VmSnapshotEvent::OperationSucceeded)?;
        ops.push(StoreOp::UpdateVmSnapshot(snapshot.clone()));
        self.store.apply(ops)?;

        info!(vm_id = %vm.id, vm_snapshot_id = %id, "VM reverted to snapshot");
        self.events
            .emit(UsageEvent::VmSnapshotReverted { vm_snapshot: id });
        Ok(snapshot)
    }

    // === Delete ===

    /// Delete a VM snapshot, merging its files away or hiding it while
    /// other snapshots still need them
    #[instrument(skip(self))]
    pub fn delete_vm_snapshot(&self, id: VmSnapshotId) -> Result<VmSnapshotDeleteOutcome> {
        let snapshot = self.vm_snapshot(id)?;
        if is_gone(&snapshot) {
            debug!(vm_snapshot_id = %id, "already expunged");
            return Ok(VmSnapshotDeleteOutcome::default());
        }
        let vm = self.vm(snapshot.vm_id)?;
        let _guard = self.locks.acquire(vm.id)?;

        let snapshot = self.vm_snapshot(id)?;
        if is_gone(&snapshot) {
            return Ok(VmSnapshotDeleteOutcome::default());
        }
        if snapshot.state == VmSnapshotState::Hidden {
            return Err(Error::VmSnapshotNotFound(id));
        }

        let mut outcome = VmSnapshotDeleteOutcome::default();
        self.collapse(&vm, snapshot, true, &mut outcome)?;
        Ok(outcome)
    }

    /// Remove one node from the tree and follow up on a hidden parent
    fn collapse(
        &self,
        vm: &VmRecord,
        mut node: VmSnapshotRecord,
        requested: bool,
        outcome: &mut VmSnapshotDeleteOutcome,
    ) -> Result<()> {
        let children = self.store.vm_snapshot_children(node.id)?;
        let case = merge::classify(&node, &children)?;
        if case == MergeCase::Defer && node.state == VmSnapshotState::Hidden {
            return Ok(());
        }

        node.state
            .apply(node.id.get(), VmSnapshotEvent::ExpungeRequested)?;
        let disks = self.store.vm_snapshot_disks(node.id)?;
        let volumes = self.store.volumes_for_vm(vm.id)?;

        let tree = match case {
            MergeCase::Defer => return self.hide(node, &disks, outcome),
            MergeCase::IntoLive => merge::into_live(&disks, &volumes),
            MergeCase::IntoParent(parent) => {
                merge::into_parent(&disks, &self.store.vm_snapshot_disks(parent)?)
            }
            MergeCase::IntoChild(child) => {
                self.child_merge_tree(vm, &disks, child, &volumes)?
            }
        };

        set_state(&mut node, VmSnapshotEvent::ExpungeRequested)?;
        self.store.update_vm_snapshot(&node)?;

        let answers = match self.driver.merge_snapshot_tree(&vm_to(vm), &tree) {
            Ok(answers) => answers,
            Err(e) => {
                let event = if requested {
                    VmSnapshotEvent::OperationFailed
                } else {
                    VmSnapshotEvent::Hide
                };
                set_state(&mut node, event)?;
                self.store.update_vm_snapshot(&node)?;
                warn!(vm_snapshot_id = %node.id, error = %e, "merge failed");
                return Err(Error::backend(format!("VM snapshot {}", node.id), e));
            }
        };

        self.commit_merge(vm, &mut node, case, &disks, &tree, &answers)?;
        outcome.merged.push(node.id);
        info!(vm_snapshot_id = %node.id, ?case, "VM snapshot merged");
        self.events.emit(UsageEvent::VmSnapshotDeleted {
            vm_snapshot: node.id,
        });

        self.follow_up_parent(vm, node.parent, outcome);
        Ok(())
    }

    fn child_merge_tree(
        &self,
        vm: &VmRecord,
        disks: &[VmSnapshotDiskRef],
        child: VmSnapshotId,
        volumes: &[VolumeRecord],
    ) -> Result<Vec<MergeTreeNode>> {
        let child_record = self.vm_snapshot(child)?;
        let live = merge::live_chain(&self.store.vm_snapshots_for_vm(vm.id)?);

        let mut grandchildren = Vec::new();
        for grandchild in self.store.vm_snapshot_children(child)? {
            if vm.running && live.contains(&grandchild.id) {
                debug!(vm_snapshot_id = %grandchild.id, "skipping grandchild on the live chain");
                continue;
            }
            grandchildren.extend(self.store.vm_snapshot_disks(grandchild.id)?);
        }
        let live_tops: &[VolumeRecord] = if child_record.current && !vm.running {
            volumes
        } else {
            &[]
        };

        Ok(merge::into_child(
            disks,
            &self.store.vm_snapshot_disks(child)?,
            &grandchildren,
            live_tops,
        ))
    }

    /// Record a successful merge in one transaction
    fn commit_merge(
        &self,
        vm: &VmRecord,
        node: &mut VmSnapshotRecord,
        case: MergeCase,
        disks: &[VmSnapshotDiskRef],
        tree: &[MergeTreeNode],
        answers: &[MergeAnswer],
    ) -> Result<()> {
        let moved = merge::surviving_paths(tree, answers);
        let mut ops = Vec::new();

        for volume in self.store.volumes_for_vm(vm.id)? {
            if let Some(path) = moved.get(&volume.path) {
                let mut volume = volume;
                volume.path = path.clone();
                ops.push(StoreOp::UpdateVolume(volume));
            }
        }
        for other in self.store.vm_snapshots_for_vm(vm.id)? {
            if other.id == node.id {
                continue;
            }
            for disk in self.store.vm_snapshot_disks(other.id)? {
                if let Some(path) = moved.get(&disk.path) {
                    let mut disk = disk;
                    disk.path = path.clone();
                    ops.push(StoreOp::UpdateVmSnapshotDisk(disk));
                }
            }
        }
        for disk in disks {
            ops.push(StoreOp::ExpungeVmSnapshotDisk(disk.id));
        }

        match case {
            MergeCase::IntoLive => {
                if let Some(parent) = node.parent {
                    let mut parent = self.vm_snapshot(parent)?;
                    parent.current = true;
                    ops.push(StoreOp::UpdateVmSnapshot(parent));
                }
            }
            MergeCase::IntoChild(child) => {
                let mut child = self.vm_snapshot(child)?;
                child.parent = node.parent;
                ops.push(StoreOp::UpdateVmSnapshot(child));
            }
            MergeCase::IntoParent(_) | MergeCase::Defer => {}
        }

        set_state(node, VmSnapshotEvent::OperationSucceeded)?;
        node.current = false;
        node.removed = Some(Utc::now());
        ops.push(StoreOp::UpdateVmSnapshot(node.clone()));

        self.store.apply(ops)
    }

    fn hide(
        &self,
        mut node: VmSnapshotRecord,
        disks: &[VmSnapshotDiskRef],
        outcome: &mut VmSnapshotDeleteOutcome,
    ) -> Result<()> {
        set_state(&mut node, VmSnapshotEvent::ExpungeRequested)?;
        set_state(&mut node, VmSnapshotEvent::Hide)?;
        node.physical_size = disks.iter().map(|d| d.physical_size).sum();
        self.store.update_vm_snapshot(&node)?;

        info!(vm_snapshot_id = %node.id, physical_size = node.physical_size, "VM snapshot hidden");
        outcome.hidden.push(node.id);
        self.events.emit(UsageEvent::VmSnapshotHidden {
            vm_snapshot: node.id,
            physical_size: node.physical_size,
        });
        Ok(())
    }

    /// A hidden parent whose fan-in dropped to one can now be merged too
    fn follow_up_parent(
        &self,
        vm: &VmRecord,
        parent: Option<VmSnapshotId>,
        outcome: &mut VmSnapshotDeleteOutcome,
    ) {
        let Some(parent_id) = parent else {
            return;
        };
        let candidate = self.store.vm_snapshot(parent_id).and_then(|parent| {
            let Some(parent) = parent.filter(|p| p.state == VmSnapshotState::Hidden) else {
                return Ok(None);
            };
            let siblings = self.store.vm_snapshot_children(parent_id)?;
            Ok((parent.current || siblings.len() == 1).then_some(parent))
        });

        match candidate {
            Ok(Some(parent)) => {
                debug!(vm_snapshot_id = %parent_id, "collapsing hidden parent");
                if let Err(e) = self.collapse(vm, parent, false, outcome) {
                    warn!(vm_snapshot_id = %parent_id, error = %e, "hidden parent stays hidden");
                    outcome.failed.push(parent_id);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(vm_snapshot_id = %parent_id, error = %e, "cannot inspect parent"),
        }
    }
}

/// VMs with more than one current snapshot
pub fn current_violations(store: &dyn EntityStore, vms: &[VmId]) -> Result<Vec<(VmId, usize)>> {
    let mut out = Vec::new();
    for vm in vms {
        let current = store
            .vm_snapshots_for_vm(*vm)?
            .iter()
            .filter(|s| s.current)
            .count();
        if current > 1 {
            out.push((*vm, current));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DriverCall, DriverOp};
    use crate::testing::Fixture;
    use crate::types::VolumeId;

    struct Tree {
        fx: Fixture,
        manager: VmSnapshotManager,
        vm: VmId,
        volumes: Vec<VolumeId>,
    }

    impl Tree {
        fn new(running: bool, disks: u64) -> Self {
            let fx = Fixture::kvm();
            let (vm, volumes) = fx.vm_with_disks(VmId(4), running, disks);
            let manager = fx.vm_snapshots();
            Self {
                fx,
                manager,
                vm,
                volumes,
            }
        }

        fn take(&self, name: &str) -> VmSnapshotRecord {
            self.manager
                .create_vm_snapshot(self.vm, name, VmSnapshotType::Disk)
                .unwrap()
        }

        fn get(&self, id: VmSnapshotId) -> VmSnapshotRecord {
            self.fx.store.vm_snapshot(id).unwrap().unwrap()
        }

        fn disk_path(&self, id: VmSnapshotId, volume: VolumeId) -> Option<String> {
            self.fx
                .store
                .vm_snapshot_disks(id)
                .unwrap()
                .into_iter()
                .find(|d| d.volume_id == volume)
                .map(|d| d.path)
        }

        fn volume_path(&self, volume: VolumeId) -> String {
            self.fx.store.volume(volume).unwrap().unwrap().path
        }

        fn current(&self) -> Option<VmSnapshotId> {
            self.fx
                .store
                .current_vm_snapshot(self.vm)
                .unwrap()
                .map(|s| s.id)
        }

        fn assert_single_current(&self) {
            assert!(current_violations(self.fx.store.as_ref(), &[self.vm])
                .unwrap()
                .is_empty());
        }

        /// Revert to `id` with the VM stopped, as disk snapshots require
        fn revert_stopped(&self, id: VmSnapshotId) {
            let mut vm = self.fx.store.vm(self.vm).unwrap().unwrap();
            let running = vm.running;
            vm.running = false;
            self.fx.store.update_vm(&vm).unwrap();
            self.manager.revert_vm_snapshot(id).unwrap();
            vm.running = running;
            self.fx.store.update_vm(&vm).unwrap();
        }
    }

    #[test]
    fn create_moves_current_and_freezes_every_disk() {
        let t = Tree::new(false, 2);
        let base = t.volume_path(t.volumes[0]);
        let s1 = t.take("s1");
        assert!(s1.current);
        assert_eq!(s1.state, VmSnapshotState::Ready);
        assert_eq!(t.disk_path(s1.id, t.volumes[0]), Some(base.clone()));
        assert_ne!(t.volume_path(t.volumes[0]), base);

        let s2 = t.take("s2");
        assert_eq!(s2.parent, Some(s1.id));
        assert!(!t.get(s1.id).current);
        assert_eq!(t.current(), Some(s2.id));
        t.assert_single_current();
    }

    #[test]
    fn failed_create_leaves_no_artifact() {
        let t = Tree::new(false, 1);
        let s1 = t.take("s1");
        t.fx.driver.fail(DriverOp::TakeVm);
        let err = t
            .manager
            .create_vm_snapshot(t.vm, "broken", VmSnapshotType::Disk)
            .unwrap_err();
        assert!(err.is_backend());
        assert_eq!(t.current(), Some(s1.id));
        assert_eq!(t.fx.store.vm_snapshots_for_vm(t.vm).unwrap().len(), 1);
    }

    #[test]
    fn deleting_a_failed_create_is_a_noop() {
        let t = Tree::new(false, 1);
        let s1 = t.take("s1");
        t.fx.driver.fail(DriverOp::TakeVm);
        t.manager
            .create_vm_snapshot(t.vm, "broken", VmSnapshotType::Disk)
            .unwrap_err();
        let broken = t
            .fx
            .store
            .vm_snapshot(VmSnapshotId(s1.id.get() + 1))
            .unwrap()
            .unwrap();
        assert_eq!(broken.state, VmSnapshotState::Error);
        assert!(broken.removed.is_some());
        t.fx.driver.clear_calls();

        let outcome = t.manager.delete_vm_snapshot(broken.id).unwrap();
        assert_eq!(outcome, VmSnapshotDeleteOutcome::default());
        assert!(t.fx.driver.io_calls().is_empty());
        assert_eq!(t.current(), Some(s1.id));
        assert_eq!(t.get(s1.id).state, VmSnapshotState::Ready);
    }

    #[test]
    fn memory_snapshot_needs_a_running_vm() {
        let t = Tree::new(false, 1);
        assert!(t
            .manager
            .create_vm_snapshot(t.vm, "mem", VmSnapshotType::DiskAndMemory)
            .is_err());
        assert!(t.fx.driver.io_calls().is_empty());
    }

    #[test]
    fn deleting_a_middle_snapshot_merges_it_into_its_child() {
        let t = Tree::new(true, 1);
        let root = t.take("root");
        let s1 = t.take("s1");
        let s2 = t.take("s2");
        let s1_file = t.disk_path(s1.id, t.volumes[0]).unwrap();

        let outcome = t.manager.delete_vm_snapshot(s1.id).unwrap();
        assert_eq!(outcome.merged, vec![s1.id]);

        let s2 = t.get(s2.id);
        assert_eq!(s2.parent, Some(root.id));
        assert!(s2.current);
        assert_eq!(t.disk_path(s2.id, t.volumes[0]), Some(s1_file));
        let s1 = t.get(s1.id);
        assert_eq!(s1.state, VmSnapshotState::Expunged);
        assert!(s1.removed.is_some());
        assert!(t.fx.store.vm_snapshot_disks(s1.id).unwrap().is_empty());
        t.assert_single_current();

        let merges: Vec<_> = t
            .fx
            .driver
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Merge(nodes) => Some(nodes),
                _ => None,
            })
            .collect();
        assert_eq!(merges.len(), 1);
        assert!(merges[0][0].grandchildren.is_empty());
    }

    #[test]
    fn deleting_the_current_leaf_merges_into_the_live_disk() {
        let t = Tree::new(false, 2);
        let s1 = t.take("s1");
        let s2 = t.take("s2");
        let s2_file = t.disk_path(s2.id, t.volumes[1]).unwrap();

        let outcome = t.manager.delete_vm_snapshot(s2.id).unwrap();
        assert_eq!(outcome.merged, vec![s2.id]);
        assert_eq!(t.current(), Some(s1.id));
        assert_eq!(t.volume_path(t.volumes[1]), s2_file);
        t.assert_single_current();
    }

    #[test]
    fn deleting_a_leaf_off_the_live_chain_folds_it_into_its_parent() {
        let t = Tree::new(false, 1);
        let s1 = t.take("s1");
        let s2 = t.take("s2");
        t.revert_stopped(s1.id);
        let s1_file = t.disk_path(s1.id, t.volumes[0]).unwrap();

        let outcome = t.manager.delete_vm_snapshot(s2.id).unwrap();
        assert_eq!(outcome.merged, vec![s2.id]);
        assert!(t.fx.store.vm_snapshot_disks(s2.id).unwrap().is_empty());
        assert_eq!(t.disk_path(s1.id, t.volumes[0]), Some(s1_file));
        assert_eq!(t.current(), Some(s1.id));
    }

    #[test]
    fn branching_snapshot_is_hidden_then_collapsed() {
        let t = Tree::new(false, 1);
        let s1 = t.take("s1");
        let a = t.take("a");
        t.revert_stopped(s1.id);
        let b = t.take("b");

        // s1 has two children: it can only be hidden
        let outcome = t.manager.delete_vm_snapshot(s1.id).unwrap();
        assert_eq!(outcome.hidden, vec![s1.id]);
        let hidden = t.get(s1.id);
        assert_eq!(hidden.state, VmSnapshotState::Hidden);
        assert_eq!(hidden.physical_size, 256);
        assert!(t.fx.events.events().contains(&UsageEvent::VmSnapshotHidden {
            vm_snapshot: s1.id,
            physical_size: 256,
        }));

        // Dropping branch `a` leaves s1 with one child, so s1 goes too
        let outcome = t.manager.delete_vm_snapshot(a.id).unwrap();
        assert_eq!(outcome.merged, vec![a.id, s1.id]);
        assert!(outcome.failed.is_empty());
        assert_eq!(t.get(s1.id).state, VmSnapshotState::Expunged);
        assert_eq!(t.get(b.id).parent, None);
        assert_eq!(t.current(), Some(b.id));
        t.assert_single_current();
    }

    #[test]
    fn hidden_current_parent_waits_for_its_last_child() {
        let t = Tree::new(false, 1);
        let s1 = t.take("s1");
        let a = t.take("a");
        t.revert_stopped(s1.id);
        let b = t.take("b");
        let outcome = t.manager.delete_vm_snapshot(s1.id).unwrap();
        assert_eq!(outcome.hidden, vec![s1.id]);

        // b was current, so s1 takes over as current but still backs a
        let outcome = t.manager.delete_vm_snapshot(b.id).unwrap();
        assert_eq!(outcome.merged, vec![b.id]);
        let parked = t.get(s1.id);
        assert_eq!(parked.state, VmSnapshotState::Hidden);
        assert!(parked.current);
        t.assert_single_current();

        let outcome = t.manager.delete_vm_snapshot(a.id).unwrap();
        assert_eq!(outcome.merged, vec![a.id, s1.id]);
        assert!(outcome.failed.is_empty());
        let s1 = t.get(s1.id);
        assert_eq!(s1.state, VmSnapshotState::Expunged);
        assert!(!s1.current);
        assert_eq!(t.current(), None);
        assert!(t.fx.store.vm_snapshots_for_vm(t.vm).unwrap().is_empty());
    }

    #[test]
    fn failed_follow_up_merge_keeps_parent_hidden() {
        let t = Tree::new(false, 1);
        let s1 = t.take("s1");
        let a = t.take("a");
        t.revert_stopped(s1.id);
        let b = t.take("b");
        t.manager.delete_vm_snapshot(s1.id).unwrap();
        t.fx.driver.fail_merge_of(b.id);

        let outcome = t.manager.delete_vm_snapshot(a.id).unwrap();
        assert_eq!(outcome.merged, vec![a.id]);
        assert_eq!(outcome.failed, vec![s1.id]);
        assert_eq!(t.get(s1.id).state, VmSnapshotState::Hidden);
        assert_eq!(t.get(b.id).parent, Some(s1.id));
    }

    #[test]
    fn failed_merge_on_user_delete_changes_no_metadata() {
        let t = Tree::new(false, 1);
        let s1 = t.take("s1");
        let before = t.volume_path(t.volumes[0]);
        t.fx.driver.fail(DriverOp::Merge);

        let err = t.manager.delete_vm_snapshot(s1.id).unwrap_err();
        assert!(err.is_backend());
        let s1 = t.get(s1.id);
        assert_eq!(s1.state, VmSnapshotState::Error);
        assert!(s1.current);
        assert_eq!(t.volume_path(t.volumes[0]), before);
        assert_eq!(t.fx.store.vm_snapshot_disks(s1.id).unwrap().len(), 1);
    }

    #[test]
    fn deleting_an_expunged_snapshot_is_a_noop() {
        let t = Tree::new(false, 1);
        let s1 = t.take("s1");
        t.manager.delete_vm_snapshot(s1.id).unwrap();
        t.fx.driver.clear_calls();

        let outcome = t.manager.delete_vm_snapshot(s1.id).unwrap();
        assert_eq!(outcome, VmSnapshotDeleteOutcome::default());
        assert!(t.fx.driver.io_calls().is_empty());
    }

    #[test]
    fn disk_only_revert_needs_a_stopped_vm() {
        let t = Tree::new(true, 1);
        let s1 = t.take("s1");
        t.take("s2");
        let err = t.manager.revert_vm_snapshot(s1.id).unwrap_err();
        assert!(matches!(err, Error::VmRunning(_)));
        assert_eq!(t.get(s1.id).state, VmSnapshotState::Ready);
    }

    #[test]
    fn running_vm_keeps_live_chain_out_of_the_merge() {
        let t = Tree::new(true, 1);
        let root = t.take("root");
        let s1 = t.take("s1");
        let s2 = t.take("s2");
        t.take("s3");
        t.revert_stopped(s2.id);
        t.take("side");

        // s1 -> s2 -> {s3, side}; side is current and on the live chain
        t.manager.delete_vm_snapshot(s1.id).unwrap();
        let nodes = t
            .fx
            .driver
            .calls()
            .into_iter()
            .find_map(|c| match c {
                DriverCall::Merge(nodes) => Some(nodes),
                _ => None,
            })
            .unwrap();
        let rebased: Vec<_> = nodes[0]
            .grandchildren
            .iter()
            .filter_map(|g| g.vm_snapshot_id)
            .collect();
        assert_eq!(rebased.len(), 1);
        assert_eq!(t.get(s2.id).parent, Some(root.id));
    }
}
