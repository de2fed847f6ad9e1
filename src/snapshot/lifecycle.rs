//! Take, backup and revert steps shared by the strategies
//!
//! Each step validates before touching the backend, then drives every state
//! machine it moved to a terminal state from the backend's answer.

use crate::backend::{
    capability_enabled, DriverError, SnapshotTo, VolumeTo, CAN_REVERT_VOLUME_TO_SNAPSHOT,
};
use crate::chain;
use crate::error::{Error, Result};
use crate::events::UsageEvent;
use crate::state::{
    ObjectEvent, ObjectOutcome, ObjectState, SnapshotEvent, StateMachine, VolumeEvent,
};
use crate::store::{EntityStore, SnapshotDataStoreRef, SnapshotRecord, VolumeRecord};
use crate::strategy::{SnapshotOperation, StrategyContext};
use crate::types::{DataStoreId, DataStoreRole, HostId, LocationType};
use chrono::Utc;
use tracing::{debug, info, warn};

// === State transitions ===

pub(crate) fn advance_snapshot(
    store: &dyn EntityStore,
    snapshot: &mut SnapshotRecord,
    event: SnapshotEvent,
) -> Result<()> {
    snapshot.state = snapshot.state.apply(snapshot.id.get(), event)?;
    store.update_snapshot(snapshot)
}

/// Move a reference; a failed creation drops the row entirely
pub(crate) fn advance_ref(
    store: &dyn EntityStore,
    mut store_ref: SnapshotDataStoreRef,
    event: ObjectEvent,
) -> Result<Option<SnapshotDataStoreRef>> {
    match store_ref.state.resolve(store_ref.id.get(), event)? {
        ObjectOutcome::Transitioned(state) => {
            store_ref.state = state;
            store.update_ref(&store_ref)?;
            Ok(Some(store_ref))
        }
        ObjectOutcome::Discard => {
            debug!(ref_id = %store_ref.id, "discarding reference of failed creation");
            store.expunge_ref(store_ref.id)?;
            Ok(None)
        }
    }
}

pub(crate) fn advance_volume(
    store: &dyn EntityStore,
    volume: &mut VolumeRecord,
    event: VolumeEvent,
) -> Result<()> {
    volume.state = volume.state.apply(volume.id.get(), event)?;
    store.update_volume(volume)
}

/// Driver view of a reference
pub(crate) fn snapshot_to(
    snapshot: &SnapshotRecord,
    store_ref: &SnapshotDataStoreRef,
    parent_path: Option<String>,
) -> SnapshotTo {
    SnapshotTo {
        snapshot_id: snapshot.id,
        volume_id: snapshot.volume_id,
        store_id: store_ref.store_id,
        role: store_ref.role,
        hypervisor: snapshot.hypervisor,
        path: store_ref.install_path.clone(),
        parent_path,
        full_backup: snapshot.full_backup.unwrap_or(true),
    }
}

pub(crate) fn volume_to(volume: &VolumeRecord, pool_id: DataStoreId) -> VolumeTo {
    VolumeTo {
        volume_id: volume.id,
        pool_id,
        path: volume.path.clone(),
        format: volume.format,
    }
}

fn primary_pool(volume: &VolumeRecord) -> Result<DataStoreId> {
    volume
        .pool_id
        .ok_or_else(|| Error::Other(format!("Volume {} is not on a primary pool", volume.id)))
}

fn ready_primary_ref(
    store: &dyn EntityStore,
    snapshot: &SnapshotRecord,
) -> Result<SnapshotDataStoreRef> {
    store
        .find_by_snapshot(snapshot.id, DataStoreRole::Primary)?
        .filter(|r| r.state == ObjectState::Ready)
        .ok_or(Error::NotOnPrimary(snapshot.id))
}

// === Take ===

/// Snapshot the volume on its primary pool.
///
/// On incremental hypervisors the new primary object is linked to the
/// volume's newest primary snapshot, so the backend can take a delta.
pub(crate) fn take_on_primary(
    ctx: &StrategyContext,
    snapshot: &SnapshotRecord,
    location: Option<LocationType>,
) -> Result<SnapshotRecord> {
    let store = ctx.store.as_ref();
    let (_guard, mut snapshot) = ctx.lock_snapshot(snapshot.id)?;
    let mut volume = ctx.volume(snapshot.volume_id)?;
    let pool_id = primary_pool(&volume)?;

    volume.state.apply(volume.id.get(), VolumeEvent::SnapshotRequested)?;
    snapshot
        .state
        .apply(snapshot.id.get(), SnapshotEvent::CreateRequested)?;

    let parent = if ctx.config.supports_incremental(snapshot.hypervisor) {
        store.latest_ref_for_volume(volume.id, DataStoreRole::Primary)?
    } else {
        None
    };

    advance_snapshot(store, &mut snapshot, SnapshotEvent::CreateRequested)?;
    advance_volume(store, &mut volume, VolumeEvent::SnapshotRequested)?;

    let primary = store.insert_ref(SnapshotDataStoreRef::allocate(
        &snapshot,
        pool_id,
        DataStoreRole::Primary,
        parent.as_ref().map(|p| p.snapshot_id),
    ))?;
    let primary = advance_ref(store, primary, ObjectEvent::CreateOnlyRequested)?
        .ok_or_else(|| Error::Other("primary reference vanished".to_string()))?;

    let to = snapshot_to(
        &snapshot,
        &primary,
        parent.as_ref().and_then(|p| p.install_path.clone()),
    );
    debug!(snapshot_id = %snapshot.id, object = %to.target(), "taking snapshot");

    match ctx.driver.take_snapshot(&to) {
        Ok(answer) => {
            let mut primary = primary;
            primary.install_path = Some(answer.install_path);
            primary.physical_size = answer.physical_size;
            advance_ref(store, primary, ObjectEvent::OperationSucceeded)?;

            snapshot.location_type = location;
            advance_snapshot(store, &mut snapshot, SnapshotEvent::OperationSucceeded)?;
            advance_volume(store, &mut volume, VolumeEvent::OperationSucceeded)?;

            info!(
                snapshot_id = %snapshot.id,
                volume_id = %volume.id,
                "snapshot created on primary"
            );
            ctx.events.emit(UsageEvent::SnapshotCreated {
                snapshot: snapshot.id,
                volume: volume.id,
                size: snapshot.size,
            });
            Ok(snapshot)
        }
        Err(e) => {
            advance_ref(store, primary, ObjectEvent::OperationFailed)?;
            advance_snapshot(store, &mut snapshot, SnapshotEvent::OperationFailed)?;
            advance_volume(store, &mut volume, VolumeEvent::OperationFailed)?;
            warn!(snapshot_id = %snapshot.id, error = %e, "snapshot failed on primary");
            Err(Error::backend(to.target(), e))
        }
    }
}

// === Backup ===

/// Copy a primary snapshot to secondary storage as a full copy or a delta
pub(crate) fn backup_to_secondary(
    ctx: &StrategyContext,
    snapshot: &SnapshotRecord,
) -> Result<SnapshotRecord> {
    let store = ctx.store.as_ref();
    let (_guard, mut snapshot) = ctx.lock_snapshot(snapshot.id)?;
    snapshot
        .state
        .apply(snapshot.id.get(), SnapshotEvent::BackupToSecondary)?;

    let volume = ctx.volume(snapshot.volume_id)?;
    let primary = ready_primary_ref(store, &snapshot)?;
    let image_store = store
        .pools_by_role(DataStoreRole::Image)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Other("No image store available for backups".to_string()))?;

    let plan = chain::plan_backup(store, &ctx.config, &snapshot, &volume)?;
    if let Some(stale) = plan.stale_primary_ref {
        info!(
            ref_id = %stale,
            volume_id = %volume.id,
            "purging primary snapshot left on a previous pool"
        );
        store.expunge_ref(stale)?;
    }

    advance_snapshot(store, &mut snapshot, SnapshotEvent::BackupToSecondary)?;
    snapshot.full_backup = Some(plan.full_backup);

    if !plan.full_backup {
        if let Some(reused) = reusable_parent_backup(store, &primary)? {
            return record_reused_backup(ctx, snapshot, image_store.id, reused);
        }
    }

    let parent = plan.parent.filter(|_| !plan.full_backup);
    let image = store.insert_ref(SnapshotDataStoreRef::allocate(
        &snapshot,
        image_store.id,
        DataStoreRole::Image,
        parent.as_ref().map(|p| p.snapshot_id),
    ))?;
    let image = advance_ref(store, image, ObjectEvent::CreateOnlyRequested)?
        .ok_or_else(|| Error::Other("image reference vanished".to_string()))?;
    let primary = advance_ref(store, primary, ObjectEvent::CopyRequested)?
        .ok_or_else(|| Error::Other("primary reference vanished".to_string()))?;

    let src = snapshot_to(&snapshot, &primary, None);
    let dst = snapshot_to(
        &snapshot,
        &image,
        parent.as_ref().and_then(|p| p.install_path.clone()),
    );

    match ctx.driver.copy(&src, &dst) {
        Ok(answer) => {
            let mut image = image;
            image.install_path = Some(answer.install_path);
            image.physical_size = answer.physical_size;
            advance_ref(store, image, ObjectEvent::OperationSucceeded)?;
            advance_ref(store, primary, ObjectEvent::OperationSucceeded)?;
            advance_snapshot(store, &mut snapshot, SnapshotEvent::OperationSucceeded)?;

            info!(
                snapshot_id = %snapshot.id,
                full_backup = plan.full_backup,
                physical_size = answer.physical_size,
                "snapshot backed up"
            );
            ctx.events.emit(UsageEvent::SnapshotBackedUp {
                snapshot: snapshot.id,
                full_backup: plan.full_backup,
                physical_size: answer.physical_size,
            });
            Ok(snapshot)
        }
        Err(e) => {
            advance_ref(store, image, ObjectEvent::OperationFailed)?;
            advance_ref(store, primary, ObjectEvent::OperationFailed)?;
            advance_snapshot(store, &mut snapshot, SnapshotEvent::OperationFailed)?;
            warn!(snapshot_id = %snapshot.id, error = %e, "backup failed");
            cleanup_failed_backup(ctx, &mut snapshot)?;
            Err(Error::backend(dst.target(), e))
        }
    }
}

/// The parent's backup, when the primary snapshot is an empty delta that
/// shares its parent's install path
fn reusable_parent_backup(
    store: &dyn EntityStore,
    primary: &SnapshotDataStoreRef,
) -> Result<Option<SnapshotDataStoreRef>> {
    let Some(parent_id) = primary.parent_snapshot_id else {
        return Ok(None);
    };
    let Some(parent_primary) = store.find_by_snapshot(parent_id, DataStoreRole::Primary)? else {
        return Ok(None);
    };
    if parent_primary.install_path.is_none() || parent_primary.install_path != primary.install_path
    {
        return Ok(None);
    }
    Ok(store
        .find_by_snapshot(parent_id, DataStoreRole::Image)?
        .filter(|r| r.state == ObjectState::Ready))
}

fn record_reused_backup(
    ctx: &StrategyContext,
    mut snapshot: SnapshotRecord,
    image_store: DataStoreId,
    reused: SnapshotDataStoreRef,
) -> Result<SnapshotRecord> {
    let store = ctx.store.as_ref();
    let mut image = SnapshotDataStoreRef::allocate(
        &snapshot,
        image_store,
        DataStoreRole::Image,
        Some(reused.snapshot_id),
    );
    image.install_path = reused.install_path.clone();
    let image = store.insert_ref(image)?;
    if let Some(image) = advance_ref(store, image, ObjectEvent::CreateOnlyRequested)? {
        advance_ref(store, image, ObjectEvent::OperationSucceeded)?;
    }
    advance_snapshot(store, &mut snapshot, SnapshotEvent::OperationNotPerformed)?;

    info!(
        snapshot_id = %snapshot.id,
        parent_id = %reused.snapshot_id,
        "empty delta, reusing parent backup"
    );
    ctx.events.emit(UsageEvent::SnapshotBackedUp {
        snapshot: snapshot.id,
        full_backup: false,
        physical_size: 0,
    });
    Ok(snapshot)
}

/// Strict purge after a failed backup: the primary object is deleted
/// best-effort, every reference row goes and the logical row is removed.
fn cleanup_failed_backup(ctx: &StrategyContext, snapshot: &mut SnapshotRecord) -> Result<()> {
    let store = ctx.store.as_ref();
    for store_ref in store.refs_for_snapshot(snapshot.id)? {
        if store_ref.role == DataStoreRole::Primary && store_ref.install_path.is_some() {
            let to = snapshot_to(snapshot, &store_ref, None);
            if let Err(e) = ctx.driver.delete(&to) {
                warn!(
                    object = %to.target(),
                    error = %e,
                    "could not delete primary object after failed backup"
                );
            }
        }
        store.expunge_ref(store_ref.id)?;
    }
    snapshot.removed = Some(Utc::now());
    store.update_snapshot(snapshot)?;
    info!(snapshot_id = %snapshot.id, "removed snapshot after failed backup");
    Ok(())
}

// === Revert ===

/// Roll the volume back to a snapshot held on its own primary pool
pub(crate) fn revert_on_primary(ctx: &StrategyContext, snapshot: &SnapshotRecord) -> Result<()> {
    let store = ctx.store.as_ref();
    let (_guard, snapshot) = ctx.lock_snapshot(snapshot.id)?;
    let mut volume = ctx.volume(snapshot.volume_id)?;
    let unsupported = Error::NoStrategyAvailable {
        snapshot: snapshot.id,
        operation: SnapshotOperation::Revert,
    };

    if !volume.format.is_revertible() {
        return Err(unsupported);
    }
    let pool_id = primary_pool(&volume)?;
    store.pool(pool_id)?.ok_or(Error::PoolNotFound(pool_id))?;
    let primary = ready_primary_ref(store, &snapshot)?;
    if primary.store_id != pool_id {
        return Err(Error::PoolMismatch {
            snapshot: snapshot.id,
            snapshot_pool: primary.store_id,
            volume_pool: pool_id,
        });
    }
    if !capability_enabled(&ctx.capabilities(pool_id), CAN_REVERT_VOLUME_TO_SNAPSHOT) {
        return Err(unsupported);
    }
    volume
        .state
        .apply(volume.id.get(), VolumeEvent::RevertSnapshotRequested)?;

    let host = resignature_host(store, &volume)?;
    let target = volume_to(&volume, pool_id);
    let snap_to = snapshot_to(&snapshot, &primary, None);

    advance_volume(store, &mut volume, VolumeEvent::RevertSnapshotRequested)?;

    if let Some(host) = host {
        if let Err(e) = ctx.driver.revoke_access(&target, host) {
            advance_volume(store, &mut volume, VolumeEvent::OperationFailed)?;
            return Err(Error::backend(format!("volume {} on host {}", volume.id, host), e));
        }
    }

    let reverted = ctx.driver.revert_snapshot(&snap_to, &target);

    let regranted = match host {
        Some(host) => ctx
            .driver
            .grant_access(&target, host)
            .map_err(|e| (host, e)),
        None => Ok(()),
    };

    match reverted {
        Ok(()) => {
            advance_volume(store, &mut volume, VolumeEvent::OperationSucceeded)?;
            info!(snapshot_id = %snapshot.id, volume_id = %volume.id, "volume reverted");
            ctx.events.emit(UsageEvent::VolumeReverted {
                snapshot: snapshot.id,
                volume: volume.id,
            });
            regranted.map_err(|(host, e)| regrant_error(&volume, host, e))
        }
        Err(e) => {
            advance_volume(store, &mut volume, VolumeEvent::OperationFailed)?;
            if let Err((host, grant_err)) = regranted {
                warn!(
                    volume_id = %volume.id,
                    host_id = %host,
                    error = %grant_err,
                    "could not restore host access"
                );
            }
            Err(Error::backend(snap_to.target(), e))
        }
    }
}

fn regrant_error(volume: &VolumeRecord, host: HostId, err: DriverError) -> Error {
    Error::backend(format!("volume {} on host {}", volume.id, host), err)
}

/// Host that must lose access to the volume while it is reverted
fn resignature_host(store: &dyn EntityStore, volume: &VolumeRecord) -> Result<Option<HostId>> {
    if !volume.format.requires_host_resignature() {
        return Ok(None);
    }
    let Some(vm_id) = volume.vm_id else {
        return Ok(None);
    };
    Ok(store.vm(vm_id)?.and_then(|vm| vm.host_id))
}
