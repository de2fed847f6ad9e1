//! Mock backend driver for testing and dry runs

use super::{
    BackendDriver, Capabilities, DiskRevertAnswer, DiskSnapshotAnswer, DiskSnapshotTo,
    DriverError, DriverResult, MergeAnswer, MergeTreeNode, SnapshotAnswer, SnapshotTo, VmTo,
    VolumeTo,
};
use crate::types::{DataStoreId, HostId, SnapshotId, VmSnapshotId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Driver operations that can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    Take,
    Copy,
    Delete,
    Revert,
    Capabilities,
    RevokeAccess,
    GrantAccess,
    TakeVm,
    RevertVm,
    Merge,
}

/// A recorded driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Take(SnapshotTo),
    Copy { src: SnapshotTo, dst: SnapshotTo },
    Delete(SnapshotTo),
    Revert { snapshot: SnapshotTo, volume: VolumeTo },
    Capabilities(DataStoreId),
    RevokeAccess(HostId),
    GrantAccess(HostId),
    TakeVm { snapshot: VmSnapshotId, disks: Vec<DiskSnapshotTo> },
    RevertVm(Vec<DiskSnapshotTo>),
    Merge(Vec<MergeTreeNode>),
}

impl DriverCall {
    pub fn op(&self) -> DriverOp {
        match self {
            DriverCall::Take(_) => DriverOp::Take,
            DriverCall::Copy { .. } => DriverOp::Copy,
            DriverCall::Delete(_) => DriverOp::Delete,
            DriverCall::Revert { .. } => DriverOp::Revert,
            DriverCall::Capabilities(_) => DriverOp::Capabilities,
            DriverCall::RevokeAccess(_) => DriverOp::RevokeAccess,
            DriverCall::GrantAccess(_) => DriverOp::GrantAccess,
            DriverCall::TakeVm { .. } => DriverOp::TakeVm,
            DriverCall::RevertVm(_) => DriverOp::RevertVm,
            DriverCall::Merge(_) => DriverOp::Merge,
        }
    }
}

/// Records every call and answers with predictable paths.
///
/// Capability probes are recorded separately from I/O calls so tests can
/// assert that dispatch alone never touches the backend.
#[derive(Debug, Default)]
pub struct MockBackendDriver {
    calls: Mutex<Vec<DriverCall>>,
    failing: Mutex<HashSet<DriverOp>>,
    failing_snapshots: Mutex<HashSet<SnapshotId>>,
    failing_merges: Mutex<HashSet<VmSnapshotId>>,
    capabilities: Mutex<HashMap<DataStoreId, Capabilities>>,
    empty_deltas: Mutex<bool>,
    counter: AtomicU64,
}

impl MockBackendDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `op` fail
    pub fn fail(&self, op: DriverOp) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(op);
        }
    }

    pub fn succeed(&self, op: DriverOp) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.remove(&op);
        }
    }

    /// Make deletes of one snapshot fail
    pub fn fail_delete_of(&self, snapshot: SnapshotId) {
        if let Ok(mut failing) = self.failing_snapshots.lock() {
            failing.insert(snapshot);
        }
    }

    /// Make merges that collapse `child`'s files fail
    pub fn fail_merge_of(&self, child: VmSnapshotId) {
        if let Ok(mut failing) = self.failing_merges.lock() {
            failing.insert(child);
        }
    }

    /// Have `take_snapshot` return the parent's path, as a hypervisor does
    /// when it cannot produce an incremental delta
    pub fn produce_empty_deltas(&self, enabled: bool) {
        if let Ok(mut flag) = self.empty_deltas.lock() {
            *flag = enabled;
        }
    }

    pub fn set_capabilities(&self, store: DataStoreId, caps: Capabilities) {
        if let Ok(mut all) = self.capabilities.lock() {
            all.insert(store, caps);
        }
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Calls other than capability probes
    pub fn io_calls(&self) -> Vec<DriverCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.op() != DriverOp::Capabilities)
            .collect()
    }

    pub fn count(&self, op: DriverOp) -> usize {
        self.calls().iter().filter(|c| c.op() == op).count()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    fn record(&self, call: DriverCall) -> DriverResult<()> {
        let op = call.op();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        let failing = self
            .failing
            .lock()
            .map(|f| f.contains(&op))
            .unwrap_or(false);
        if failing {
            Err(DriverError::Failed(format!("simulated {:?} failure", op)))
        } else {
            Ok(())
        }
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl BackendDriver for MockBackendDriver {
    fn take_snapshot(&self, snapshot: &SnapshotTo) -> DriverResult<SnapshotAnswer> {
        self.record(DriverCall::Take(snapshot.clone()))?;
        let empty = self.empty_deltas.lock().map(|f| *f).unwrap_or(false);
        let install_path = match (&snapshot.parent_path, empty) {
            (Some(parent), true) => parent.clone(),
            _ => format!("primary/{}/snap-{}", snapshot.volume_id, snapshot.snapshot_id),
        };
        Ok(SnapshotAnswer {
            install_path,
            physical_size: 1024,
        })
    }

    fn copy(&self, src: &SnapshotTo, dst: &SnapshotTo) -> DriverResult<SnapshotAnswer> {
        self.record(DriverCall::Copy {
            src: src.clone(),
            dst: dst.clone(),
        })?;
        Ok(SnapshotAnswer {
            install_path: format!("snapshots/{}/{}", dst.volume_id, dst.snapshot_id),
            physical_size: if dst.full_backup { 4096 } else { 512 },
        })
    }

    fn delete(&self, snapshot: &SnapshotTo) -> DriverResult<()> {
        self.record(DriverCall::Delete(snapshot.clone()))?;
        let targeted = self
            .failing_snapshots
            .lock()
            .map(|f| f.contains(&snapshot.snapshot_id))
            .unwrap_or(false);
        if targeted {
            return Err(DriverError::Failed(format!(
                "simulated delete failure for snapshot {}",
                snapshot.snapshot_id
            )));
        }
        Ok(())
    }

    fn revert_snapshot(&self, snapshot: &SnapshotTo, volume: &VolumeTo) -> DriverResult<()> {
        self.record(DriverCall::Revert {
            snapshot: snapshot.clone(),
            volume: volume.clone(),
        })
    }

    fn capabilities(&self, store: DataStoreId) -> DriverResult<Capabilities> {
        self.record(DriverCall::Capabilities(store))?;
        Ok(self
            .capabilities
            .lock()
            .ok()
            .and_then(|all| all.get(&store).cloned())
            .unwrap_or_default())
    }

    fn revoke_access(&self, _volume: &VolumeTo, host: HostId) -> DriverResult<()> {
        self.record(DriverCall::RevokeAccess(host))
    }

    fn grant_access(&self, _volume: &VolumeTo, host: HostId) -> DriverResult<()> {
        self.record(DriverCall::GrantAccess(host))
    }

    fn take_vm_snapshot(
        &self,
        _vm: &VmTo,
        snapshot: VmSnapshotId,
        disks: &[DiskSnapshotTo],
    ) -> DriverResult<Vec<DiskSnapshotAnswer>> {
        self.record(DriverCall::TakeVm {
            snapshot,
            disks: disks.to_vec(),
        })?;
        Ok(disks
            .iter()
            .map(|d| DiskSnapshotAnswer {
                volume_id: d.volume_id,
                snapshot_path: d.path.clone(),
                live_path: format!("vol-{}/overlay-{}", d.volume_id, self.next()),
                physical_size: 256,
            })
            .collect())
    }

    fn revert_vm_snapshot(
        &self,
        _vm: &VmTo,
        disks: &[DiskSnapshotTo],
    ) -> DriverResult<Vec<DiskRevertAnswer>> {
        self.record(DriverCall::RevertVm(disks.to_vec()))?;
        Ok(disks
            .iter()
            .map(|d| DiskRevertAnswer {
                volume_id: d.volume_id,
                live_path: format!("vol-{}/overlay-{}", d.volume_id, self.next()),
            })
            .collect())
    }

    fn merge_snapshot_tree(
        &self,
        _vm: &VmTo,
        nodes: &[MergeTreeNode],
    ) -> DriverResult<Vec<MergeAnswer>> {
        self.record(DriverCall::Merge(nodes.to_vec()))?;
        let targeted = self
            .failing_merges
            .lock()
            .map(|f| {
                nodes
                    .iter()
                    .any(|n| n.child.vm_snapshot_id.map(|c| f.contains(&c)).unwrap_or(false))
            })
            .unwrap_or(false);
        if targeted {
            return Err(DriverError::Failed("simulated merge failure".to_string()));
        }
        Ok(nodes
            .iter()
            .map(|n| MergeAnswer {
                volume_id: n.parent.volume_id,
                surviving_path: n.parent.path.clone(),
            })
            .collect())
    }
}
