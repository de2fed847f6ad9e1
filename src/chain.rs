//! Delta chains of volume snapshots and the full-versus-delta backup decision
//!
//! A chain is never stored. It is derived from the `parent_snapshot_id` links
//! of one volume's references in one datastore role, and the same snapshot
//! may sit at different positions on primary and on secondary storage.

use crate::config::SnapshotConfig;
use crate::error::Result;
use crate::store::{EntityStore, SnapshotDataStoreRef, SnapshotRecord, VolumeRecord};
use crate::types::{DataStoreRole, RefId, SnapshotId, VolumeId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// References of `parent` in `role` that still count as chain members
pub fn live_children(
    store: &dyn EntityStore,
    parent: SnapshotId,
    role: DataStoreRole,
) -> Result<Vec<SnapshotDataStoreRef>> {
    Ok(store
        .list_by_parent(parent, role)?
        .into_iter()
        .filter(|r| r.snapshot_id != parent && r.state.is_live())
        .collect())
}

/// All snapshot references of one volume in one role, linked by parent id
#[derive(Debug, Clone)]
pub struct VolumeSnapshotChain {
    pub volume_id: VolumeId,
    pub role: DataStoreRole,
    refs: BTreeMap<SnapshotId, SnapshotDataStoreRef>,
    children: BTreeMap<SnapshotId, Vec<SnapshotId>>,
}

impl VolumeSnapshotChain {
    pub fn load(store: &dyn EntityStore, volume_id: VolumeId, role: DataStoreRole) -> Result<Self> {
        Ok(Self::from_refs(volume_id, role, store.refs_for_volume(volume_id, role)?))
    }

    pub fn from_refs(
        volume_id: VolumeId,
        role: DataStoreRole,
        refs: Vec<SnapshotDataStoreRef>,
    ) -> Self {
        let refs: BTreeMap<_, _> = refs
            .into_iter()
            .filter(|r| r.role == role)
            .map(|r| (r.snapshot_id, r))
            .collect();
        let mut children: BTreeMap<SnapshotId, Vec<SnapshotId>> = BTreeMap::new();
        for r in refs.values() {
            if let Some(parent) = r.parent_snapshot_id {
                if refs.contains_key(&parent) {
                    children.entry(parent).or_default().push(r.snapshot_id);
                }
            }
        }
        Self {
            volume_id,
            role,
            refs,
            children,
        }
    }

    pub fn get(&self, id: SnapshotId) -> Option<&SnapshotDataStoreRef> {
        self.refs.get(&id)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// References with no parent present in this chain
    pub fn roots(&self) -> Vec<SnapshotId> {
        self.refs
            .values()
            .filter(|r| {
                r.parent_snapshot_id
                    .map(|p| !self.refs.contains_key(&p))
                    .unwrap_or(true)
            })
            .map(|r| r.snapshot_id)
            .collect()
    }

    pub fn children(&self, id: SnapshotId) -> &[SnapshotId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Parent, grandparent, ... of `id`, nearest first
    pub fn ancestors(&self, id: SnapshotId) -> Vec<SnapshotId> {
        let mut seen = BTreeSet::from([id]);
        let mut out = Vec::new();
        let mut cursor = self.refs.get(&id).and_then(|r| r.parent_snapshot_id);
        while let Some(parent) = cursor {
            if !seen.insert(parent) || !self.refs.contains_key(&parent) {
                break;
            }
            out.push(parent);
            cursor = self.refs.get(&parent).and_then(|r| r.parent_snapshot_id);
        }
        out
    }

    /// Number of backups in the chain ending at `id`, itself included
    pub fn depth(&self, id: SnapshotId) -> usize {
        if self.refs.contains_key(&id) {
            self.ancestors(id).len() + 1
        } else {
            0
        }
    }

    /// Live references whose parent is gone or already being reclaimed
    pub fn dangling(&self) -> Vec<SnapshotId> {
        self.refs
            .values()
            .filter(|r| r.state.is_live())
            .filter(|r| match r.parent_snapshot_id {
                Some(p) => self.refs.get(&p).map(|pr| !pr.state.is_live()).unwrap_or(true),
                None => false,
            })
            .map(|r| r.snapshot_id)
            .collect()
    }
}

/// Outcome of the full-versus-delta decision
#[derive(Debug, Clone, PartialEq)]
pub struct BackupPlan {
    pub full_backup: bool,
    /// Newest backup of the volume on secondary storage, the delta parent
    pub parent: Option<SnapshotDataStoreRef>,
    /// Primary reference left behind on the pool a volume migrated from
    pub stale_primary_ref: Option<RefId>,
    /// Backups found in the existing chain, capped at `delta_max`
    pub chain_depth: u32,
}

impl BackupPlan {
    fn full() -> Self {
        Self {
            full_backup: true,
            parent: None,
            stale_primary_ref: None,
            chain_depth: 0,
        }
    }
}

/// Decide whether backing `snapshot` up to secondary storage takes a full
/// copy or a delta on top of the volume's newest backup.
///
/// Reads only: the caller purges `stale_primary_ref` under its lock. The
/// walk follows ancestors only, which never change once backed up, so new
/// leaves appended concurrently do not disturb it.
pub fn plan_backup(
    store: &dyn EntityStore,
    config: &SnapshotConfig,
    snapshot: &SnapshotRecord,
    volume: &VolumeRecord,
) -> Result<BackupPlan> {
    if !config.supports_incremental(snapshot.hypervisor) {
        return Ok(BackupPlan::full());
    }

    let latest_backup = store.latest_ref_for_volume(volume.id, DataStoreRole::Image)?;
    let latest_primary = store.latest_ref_for_volume(volume.id, DataStoreRole::Primary)?;
    let (Some(latest_backup), Some(latest_primary)) = (latest_backup, latest_primary) else {
        return Ok(BackupPlan::full());
    };

    // With two primary entries for the same volume, the oldest one tells us
    // whether the volume moved pools since the chain was started.
    let Some(oldest_primary) = store.oldest_ref_for_volume(volume.id, DataStoreRole::Primary)?
    else {
        return Ok(BackupPlan::full());
    };
    if oldest_primary.id == latest_primary.id {
        return Ok(BackupPlan::full());
    }
    if Some(oldest_primary.store_id) != volume.pool_id {
        debug!(
            volume_id = %volume.id,
            stale_ref = %oldest_primary.id,
            "volume migrated since its last snapshot, forcing a full backup"
        );
        return Ok(BackupPlan {
            stale_primary_ref: Some(oldest_primary.id),
            ..BackupPlan::full()
        });
    }

    let delta_max = config.delta_max();
    let mut cursor = latest_backup.clone();
    let mut depth = 1;
    while depth < delta_max {
        let Some(prev) = cursor.parent_snapshot_id else {
            break;
        };
        match store.find_by_snapshot(prev, DataStoreRole::Image)? {
            Some(prev_ref) => cursor = prev_ref,
            None => break,
        }
        depth += 1;
    }

    let full_backup = depth >= delta_max;
    debug!(
        snapshot_id = %snapshot.id,
        chain_depth = depth,
        delta_max,
        full_backup,
        "backup plan"
    );
    Ok(BackupPlan {
        full_backup,
        parent: if full_backup { None } else { Some(latest_backup) },
        stale_primary_ref: None,
        chain_depth: depth,
    })
}
