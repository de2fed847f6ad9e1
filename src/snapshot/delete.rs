//! Volume snapshot deletion and tail-first chain pruning

use super::lifecycle::{advance_ref, advance_snapshot, snapshot_to};
use crate::chain::live_children;
use crate::error::{Error, Result};
use crate::events::UsageEvent;
use crate::state::{ObjectEvent, ObjectState, SnapshotEvent, SnapshotState, StateMachine};
use crate::store::{EntityStore, SnapshotDataStoreRef, SnapshotRecord};
use crate::strategy::StrategyContext;
use crate::types::{DataStoreRole, SnapshotId};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

/// What a delete did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub snapshot: SnapshotId,
    /// Snapshots whose datastore objects were reclaimed, in walk order
    pub reclaimed: Vec<SnapshotId>,
    /// Snapshots whose backend delete failed; their rows stay for later GC
    pub failed: Vec<SnapshotId>,
    /// The snapshot was already destroyed and nothing was done
    pub already_destroyed: bool,
}

impl DeleteOutcome {
    pub(crate) fn noop(snapshot: SnapshotId) -> Self {
        Self {
            snapshot,
            already_destroyed: true,
            ..Self::default()
        }
    }
}

/// Nodes processed by one prune walk
#[derive(Debug, Default)]
struct PruneReport {
    reclaimed: Vec<SnapshotId>,
    failed: Vec<(SnapshotId, String)>,
}

/// Delete a snapshot and whatever of its chain became unreferenced
pub(crate) fn destroy_snapshot(
    ctx: &StrategyContext,
    snapshot: &SnapshotRecord,
) -> Result<DeleteOutcome> {
    let store = ctx.store.as_ref();
    let (_guard, mut snapshot) = ctx.lock_snapshot(snapshot.id)?;

    if snapshot.state == SnapshotState::Destroyed {
        debug!(snapshot_id = %snapshot.id, "already destroyed");
        return Ok(DeleteOutcome::noop(snapshot.id));
    }
    if snapshot.state != SnapshotState::Destroying {
        snapshot
            .state
            .apply(snapshot.id.get(), SnapshotEvent::DestroyRequested)?;
    }

    let refs = store.refs_for_snapshot(snapshot.id)?;
    ensure_no_live_children(store, &snapshot, &refs)?;
    ensure_not_in_use(store, &snapshot, &refs)?;

    if snapshot.state != SnapshotState::Destroying {
        advance_snapshot(store, &mut snapshot, SnapshotEvent::DestroyRequested)?;
    }

    let mut report = PruneReport::default();
    let has_image = refs.iter().any(|r| r.role == DataStoreRole::Image);
    for store_ref in refs {
        match store_ref.role {
            DataStoreRole::Primary | DataStoreRole::Image => {
                prune_chain(ctx, store_ref, &mut report)?
            }
            DataStoreRole::ImageCache if !has_image => {
                purge_cache_copy(ctx, &snapshot, store_ref)?
            }
            DataStoreRole::ImageCache => {}
        }
    }

    let own_failure = report
        .failed
        .iter()
        .find(|(id, _)| *id == snapshot.id)
        .map(|(_, message)| message.clone());

    if let Some(message) = own_failure {
        let in_use = store.volumes_from_snapshot(snapshot.id)?;
        if let Some(volume) = in_use.first() {
            advance_snapshot(store, &mut snapshot, SnapshotEvent::OperationFailed)?;
            warn!(
                snapshot_id = %snapshot.id,
                volume_id = %volume.id,
                "delete failed while still referenced"
            );
            return Err(Error::BackendOperationFailed {
                target: format!("snapshot {}", snapshot.id),
                message,
            });
        }
        warn!(
            snapshot_id = %snapshot.id,
            error = %message,
            "backend delete failed, marking destroyed and leaving objects for garbage collection"
        );
    }

    advance_snapshot(store, &mut snapshot, SnapshotEvent::OperationSucceeded)?;
    snapshot.removed = Some(Utc::now());
    store.update_snapshot(&snapshot)?;

    info!(
        snapshot_id = %snapshot.id,
        reclaimed = report.reclaimed.len(),
        failed = report.failed.len(),
        "snapshot deleted"
    );
    ctx.events.emit(UsageEvent::SnapshotDeleted {
        snapshot: snapshot.id,
        volume: snapshot.volume_id,
    });

    Ok(DeleteOutcome {
        snapshot: snapshot.id,
        reclaimed: report.reclaimed,
        failed: report.failed.into_iter().map(|(id, _)| id).collect(),
        already_destroyed: false,
    })
}

fn ensure_no_live_children(
    store: &dyn EntityStore,
    snapshot: &SnapshotRecord,
    refs: &[SnapshotDataStoreRef],
) -> Result<()> {
    for store_ref in refs {
        let children = live_children(store, snapshot.id, store_ref.role)?;
        if let Some(child) = children.first() {
            return Err(Error::ChainIntegrityViolation {
                snapshot: snapshot.id.get(),
                reason: format!(
                    "snapshot {} on {} store {} still depends on it",
                    child.snapshot_id, child.role, child.store_id
                ),
            });
        }
    }
    Ok(())
}

/// A snapshot that only exists on secondary storage cannot go while a live
/// volume was created from it
fn ensure_not_in_use(
    store: &dyn EntityStore,
    snapshot: &SnapshotRecord,
    refs: &[SnapshotDataStoreRef],
) -> Result<()> {
    let on_primary = refs
        .iter()
        .any(|r| r.role == DataStoreRole::Primary && r.state.is_live());
    if on_primary {
        return Ok(());
    }
    match store.volumes_from_snapshot(snapshot.id)?.first() {
        Some(volume) => Err(Error::SnapshotInUse {
            snapshot: snapshot.id,
            volume: volume.id,
        }),
        None => Ok(()),
    }
}

/// Walk `start → parent → ...` within one role, reclaiming each node that
/// has no live child. Failures are recorded and the walk goes on.
fn prune_chain(
    ctx: &StrategyContext,
    start: SnapshotDataStoreRef,
    report: &mut PruneReport,
) -> Result<()> {
    let store = ctx.store.as_ref();
    let role = start.role;
    let mut node = Some(start);

    while let Some(current) = node.take() {
        if !live_children(store, current.snapshot_id, role)?.is_empty() {
            debug!(
                snapshot_id = %current.snapshot_id,
                %role,
                "chain walk stops at a node with live children"
            );
            break;
        }

        let parent = match current.parent_snapshot_id {
            Some(parent_id) => store.find_by_snapshot(parent_id, role)?,
            None => None,
        };

        reclaim(ctx, current, parent.as_ref(), report)?;

        node = parent.filter(|p| p.state.is_deletable());
    }
    Ok(())
}

/// Reclaim one chain node.
///
/// An empty delta shares its parent's install path and is only dropped
/// from metadata; the object itself still belongs to the parent.
fn reclaim(
    ctx: &StrategyContext,
    node: SnapshotDataStoreRef,
    parent: Option<&SnapshotDataStoreRef>,
    report: &mut PruneReport,
) -> Result<()> {
    let store = ctx.store.as_ref();
    let snapshot_id = node.snapshot_id;

    let node = match node.state {
        ObjectState::Destroyed => {
            store.expunge_ref(node.id)?;
            report.reclaimed.push(snapshot_id);
            return Ok(());
        }
        ObjectState::Destroying => node,
        _ => match advance_ref(store, node, ObjectEvent::DestroyRequested)? {
            Some(node) => node,
            None => return Ok(()),
        },
    };

    let empty_delta = node.install_path.is_some()
        && parent
            .map(|p| p.install_path == node.install_path)
            .unwrap_or(false);
    if empty_delta {
        debug!(
            snapshot_id = %snapshot_id,
            role = %node.role,
            "empty delta, dropping metadata only"
        );
        finish_reclaim(store, node)?;
        report.reclaimed.push(snapshot_id);
        return Ok(());
    }

    let owner = match store.snapshot(snapshot_id)? {
        Some(owner) => owner,
        None => {
            finish_reclaim(store, node)?;
            return Ok(());
        }
    };
    let to = snapshot_to(&owner, &node, None);
    let role = node.role;
    match ctx.driver.delete(&to) {
        Ok(()) => {
            finish_reclaim(store, node)?;
            if role == DataStoreRole::Image {
                for cached in store.refs_for_snapshot(snapshot_id)? {
                    if cached.role == DataStoreRole::ImageCache {
                        purge_cache_copy(ctx, &owner, cached)?;
                    }
                }
            }
            report.reclaimed.push(snapshot_id);
        }
        Err(e) => {
            warn!(
                object = %to.target(),
                error = %e,
                "backend delete failed, leaving object for garbage collection"
            );
            advance_ref(store, node, ObjectEvent::OperationFailed)?;
            report.failed.push((snapshot_id, e.to_string()));
        }
    }
    Ok(())
}

fn finish_reclaim(store: &dyn EntityStore, node: SnapshotDataStoreRef) -> Result<()> {
    if let Some(node) = advance_ref(store, node, ObjectEvent::OperationSucceeded)? {
        store.expunge_ref(node.id)?;
    }
    Ok(())
}

/// Best-effort removal of a copy on an image-cache store
fn purge_cache_copy(
    ctx: &StrategyContext,
    owner: &SnapshotRecord,
    cached: SnapshotDataStoreRef,
) -> Result<()> {
    let store = ctx.store.as_ref();
    let to = snapshot_to(owner, &cached, None);
    let cached = match cached.state {
        ObjectState::Destroying => cached,
        _ => match cached.state.next(ObjectEvent::DestroyRequested) {
            Some(_) => match advance_ref(store, cached, ObjectEvent::DestroyRequested)? {
                Some(cached) => cached,
                None => return Ok(()),
            },
            None => {
                store.expunge_ref(cached.id)?;
                return Ok(());
            }
        },
    };
    match ctx.driver.delete(&to) {
        Ok(()) => finish_reclaim(store, cached),
        Err(e) => {
            warn!(object = %to.target(), error = %e, "could not purge image-cache copy");
            advance_ref(store, cached, ObjectEvent::OperationFailed)?;
            Ok(())
        }
    }
}
