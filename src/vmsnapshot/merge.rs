//! Merge-tree planning for VM snapshot deletion
//!
//! Each VM snapshot froze one delta file per disk; the volume's own path is
//! the live overlay written on top of the current snapshot. Deleting a node
//! collapses its file into a neighbour, described to the backend as one
//! `(parent, child, grandchildren)` triple per disk.

use crate::backend::{DiskSnapshotTo, MergeAnswer, MergeTreeNode};
use crate::error::{Error, Result};
use crate::store::{VmSnapshotDiskRef, VmSnapshotRecord, VolumeRecord};
use crate::types::VmSnapshotId;
use std::collections::{BTreeMap, BTreeSet};

/// How a node leaves the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeCase {
    /// Current with no children: fold the live overlay into the node's file
    IntoLive,
    /// Not current, no children: drop the node onto its parent
    IntoParent(VmSnapshotId),
    /// Not current, one child: fold the child into the node's file
    IntoChild(VmSnapshotId),
    /// Still needed by other snapshots or the live disks
    Defer,
}

pub fn classify(node: &VmSnapshotRecord, children: &[VmSnapshotRecord]) -> Result<MergeCase> {
    match (node.current, children) {
        (true, []) => Ok(MergeCase::IntoLive),
        (false, []) => node.parent.map(MergeCase::IntoParent).ok_or_else(|| {
            Error::ChainIntegrityViolation {
                snapshot: node.id.get(),
                reason: "root snapshot with no children is not under the live disks".to_string(),
            }
        }),
        (false, [child]) => Ok(MergeCase::IntoChild(child.id)),
        _ => Ok(MergeCase::Defer),
    }
}

/// The current snapshot and its ancestors, which the live disks sit on
pub fn live_chain(snapshots: &[VmSnapshotRecord]) -> BTreeSet<VmSnapshotId> {
    let by_id: BTreeMap<_, _> = snapshots.iter().map(|s| (s.id, s)).collect();
    let mut chain = BTreeSet::new();
    let mut cursor = snapshots.iter().find(|s| s.current).map(|s| s.id);
    while let Some(id) = cursor {
        if !chain.insert(id) {
            break;
        }
        cursor = by_id.get(&id).and_then(|s| s.parent);
    }
    chain
}

fn frozen(disk: &VmSnapshotDiskRef) -> DiskSnapshotTo {
    DiskSnapshotTo {
        volume_id: disk.volume_id,
        vm_snapshot_id: Some(disk.vm_snapshot_id),
        path: disk.path.clone(),
    }
}

fn live(volume: &VolumeRecord) -> DiskSnapshotTo {
    DiskSnapshotTo {
        volume_id: volume.id,
        vm_snapshot_id: None,
        path: volume.path.clone(),
    }
}

fn on_volume<'a>(
    disks: &'a [VmSnapshotDiskRef],
    volume: crate::types::VolumeId,
) -> Option<&'a VmSnapshotDiskRef> {
    disks.iter().find(|d| d.volume_id == volume)
}

/// Fold each disk's live overlay into the node's frozen file
pub fn into_live(disks: &[VmSnapshotDiskRef], volumes: &[VolumeRecord]) -> Vec<MergeTreeNode> {
    volumes
        .iter()
        .filter_map(|v| {
            on_volume(disks, v.id).map(|d| MergeTreeNode {
                parent: frozen(d),
                child: live(v),
                grandchildren: Vec::new(),
            })
        })
        .collect()
}

/// Collapse the node's files into its parent's
pub fn into_parent(
    disks: &[VmSnapshotDiskRef],
    parent_disks: &[VmSnapshotDiskRef],
) -> Vec<MergeTreeNode> {
    disks
        .iter()
        .filter_map(|d| {
            on_volume(parent_disks, d.volume_id).map(|p| MergeTreeNode {
                parent: frozen(p),
                child: frozen(d),
                grandchildren: Vec::new(),
            })
        })
        .collect()
}

/// Collapse the only child's files into the node's and rebase whatever
/// sat on the child. `live_tops` are volumes whose overlay sits directly on
/// the child and must be rebased too.
pub fn into_child(
    disks: &[VmSnapshotDiskRef],
    child_disks: &[VmSnapshotDiskRef],
    grandchildren: &[VmSnapshotDiskRef],
    live_tops: &[VolumeRecord],
) -> Vec<MergeTreeNode> {
    disks
        .iter()
        .filter_map(|d| {
            on_volume(child_disks, d.volume_id).map(|c| {
                let mut rebased: Vec<_> = grandchildren
                    .iter()
                    .filter(|g| g.volume_id == d.volume_id)
                    .map(frozen)
                    .collect();
                rebased.extend(
                    live_tops
                        .iter()
                        .filter(|v| v.id == d.volume_id)
                        .map(live),
                );
                MergeTreeNode {
                    parent: frozen(d),
                    child: frozen(c),
                    grandchildren: rebased,
                }
            })
        })
        .collect()
}

/// Old path to surviving path for every file a merge consumed
pub fn surviving_paths(
    nodes: &[MergeTreeNode],
    answers: &[MergeAnswer],
) -> BTreeMap<String, String> {
    let mut moved = BTreeMap::new();
    for (node, answer) in nodes.iter().zip(answers) {
        for old in [&node.parent.path, &node.child.path] {
            if *old != answer.surviving_path {
                moved.insert(old.clone(), answer.surviving_path.clone());
            }
        }
    }
    moved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{VmSnapshotState, VolumeState};
    use crate::types::{
        DataStoreId, HypervisorType, ImageFormat, RefId, VmId, VmSnapshotType, VolumeId,
    };
    use chrono::Utc;

    fn snap(id: u64, parent: Option<u64>, current: bool) -> VmSnapshotRecord {
        VmSnapshotRecord {
            id: VmSnapshotId(id),
            vm_id: VmId(1),
            name: format!("s{}", id),
            parent: parent.map(VmSnapshotId),
            current,
            state: VmSnapshotState::Ready,
            kind: VmSnapshotType::Disk,
            physical_size: 0,
            created: Utc::now(),
            removed: None,
        }
    }

    fn disk(snapshot: u64, volume: u64, path: &str) -> VmSnapshotDiskRef {
        VmSnapshotDiskRef {
            id: RefId(snapshot * 10 + volume),
            vm_snapshot_id: VmSnapshotId(snapshot),
            volume_id: VolumeId(volume),
            store_id: DataStoreId(1),
            path: path.to_string(),
            physical_size: 100,
        }
    }

    fn volume(id: u64, path: &str) -> VolumeRecord {
        VolumeRecord {
            id: VolumeId(id),
            name: format!("v{}", id),
            state: VolumeState::Ready,
            pool_id: Some(DataStoreId(1)),
            format: ImageFormat::Qcow2,
            hypervisor: HypervisorType::Kvm,
            size: 1,
            path: path.to_string(),
            vm_id: Some(VmId(1)),
            source_snapshot_id: None,
            removed: None,
        }
    }

    #[test]
    fn classification() {
        let root = snap(1, None, false);
        let mid = snap(2, Some(1), false);
        let top = snap(3, Some(2), true);

        assert_eq!(classify(&top, &[]).unwrap(), MergeCase::IntoLive);
        assert_eq!(classify(&mid, &[]).unwrap(), MergeCase::IntoParent(VmSnapshotId(1)));
        assert_eq!(
            classify(&mid, &[top.clone()]).unwrap(),
            MergeCase::IntoChild(VmSnapshotId(3))
        );
        assert_eq!(
            classify(&root, &[mid.clone(), snap(4, Some(1), false)]).unwrap(),
            MergeCase::Defer
        );
        let mut current_with_child = mid.clone();
        current_with_child.current = true;
        assert_eq!(classify(&current_with_child, &[top]).unwrap(), MergeCase::Defer);
        assert!(classify(&root, &[]).is_err());
    }

    #[test]
    fn live_chain_follows_current_ancestors() {
        let all = vec![
            snap(1, None, false),
            snap(2, Some(1), false),
            snap(3, Some(2), true),
            snap(4, Some(1), false),
        ];
        let chain = live_chain(&all);
        assert_eq!(
            chain.into_iter().collect::<Vec<_>>(),
            vec![VmSnapshotId(1), VmSnapshotId(2), VmSnapshotId(3)]
        );
        assert!(live_chain(&[snap(1, None, false)]).is_empty());
    }

    #[test]
    fn one_node_per_disk() {
        let node = vec![disk(2, 7, "f2-a"), disk(2, 8, "f2-b")];
        let parent = vec![disk(1, 7, "f1-a"), disk(1, 8, "f1-b")];
        let tree = into_parent(&node, &parent);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].parent.path, "f1-a");
        assert_eq!(tree[0].child.path, "f2-a");
        assert!(tree[0].grandchildren.is_empty());

        let volumes = vec![volume(7, "live-a"), volume(8, "live-b")];
        let tree = into_live(&node, &volumes);
        assert_eq!(tree[1].parent.path, "f2-b");
        assert_eq!(tree[1].child.vm_snapshot_id, None);
        assert_eq!(tree[1].child.path, "live-b");
    }

    #[test]
    fn child_merge_rebases_grandchildren_and_live_tops() {
        let node = vec![disk(1, 7, "f1")];
        let child = vec![disk(2, 7, "f2")];
        let grandchildren = vec![disk(3, 7, "f3"), disk(4, 7, "f4")];
        let tree = into_child(&node, &child, &grandchildren, &[volume(7, "live")]);
        assert_eq!(tree.len(), 1);
        let paths: Vec<_> = tree[0].grandchildren.iter().map(|g| g.path.as_str()).collect();
        assert_eq!(paths, vec!["f3", "f4", "live"]);
    }

    #[test]
    fn consumed_paths_point_at_the_survivor() {
        let tree = into_parent(&[disk(2, 7, "f2")], &[disk(1, 7, "f1")]);
        let answers = vec![MergeAnswer {
            volume_id: VolumeId(7),
            surviving_path: "f1".into(),
        }];
        let moved = surviving_paths(&tree, &answers);
        assert_eq!(moved.len(), 1);
        assert_eq!(moved.get("f2").map(String::as_str), Some("f1"));
    }
}
