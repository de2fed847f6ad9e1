//! Snapshots taken natively by the storage system on primary

use super::{SnapshotOperation, SnapshotStrategy, StrategyContext, StrategyPriority};
use crate::backend::{capability_enabled, CAN_REVERT_VOLUME_TO_SNAPSHOT, STORAGE_SYSTEM_SNAPSHOT};
use crate::error::{Error, Result};
use crate::snapshot::lifecycle;
use crate::snapshot::{delete, DeleteOutcome};
use crate::store::SnapshotRecord;
use crate::types::{DataStoreRole, LocationType};
use tracing::debug;

/// Keeps snapshots on the primary pool that took them and reverts in place
/// when the pool supports it
#[derive(Debug, Default, Clone, Copy)]
pub struct StorageSystemSnapshotStrategy;

impl StorageSystemSnapshotStrategy {
    fn pool_advertises(ctx: &StrategyContext, snapshot: &SnapshotRecord, key: &str) -> bool {
        let pool = match ctx.store.volume(snapshot.volume_id) {
            Ok(Some(volume)) => volume.pool_id,
            _ => None,
        };
        pool.map(|p| capability_enabled(&ctx.capabilities(p), key))
            .unwrap_or(false)
    }

    /// Only a primary copy on a storage-system pool, nothing on image stores
    fn primary_only(ctx: &StrategyContext, snapshot: &SnapshotRecord) -> bool {
        let refs = match ctx.store.refs_for_snapshot(snapshot.id) {
            Ok(refs) => refs,
            Err(e) => {
                debug!(snapshot_id = %snapshot.id, error = %e, "cannot read references");
                return false;
            }
        };
        let on_image = refs.iter().any(|r| r.role != DataStoreRole::Primary);
        let primary_pools: Vec<_> = refs
            .iter()
            .filter(|r| r.role == DataStoreRole::Primary)
            .map(|r| r.store_id)
            .collect();
        !on_image
            && !primary_pools.is_empty()
            && primary_pools.iter().all(|pool| {
                capability_enabled(&ctx.capabilities(*pool), STORAGE_SYSTEM_SNAPSHOT)
            })
    }
}

impl SnapshotStrategy for StorageSystemSnapshotStrategy {
    fn name(&self) -> &'static str {
        "storage-system"
    }

    fn can_handle(
        &self,
        ctx: &StrategyContext,
        snapshot: &SnapshotRecord,
        operation: SnapshotOperation,
    ) -> StrategyPriority {
        let handles = match operation {
            SnapshotOperation::Take => {
                Self::pool_advertises(ctx, snapshot, STORAGE_SYSTEM_SNAPSHOT)
            }
            SnapshotOperation::Backup => false,
            SnapshotOperation::Delete => Self::primary_only(ctx, snapshot),
            SnapshotOperation::Revert => {
                let revertible = matches!(
                    ctx.store.volume(snapshot.volume_id),
                    Ok(Some(volume)) if volume.format.is_revertible()
                );
                revertible && Self::pool_advertises(ctx, snapshot, CAN_REVERT_VOLUME_TO_SNAPSHOT)
            }
        };
        if handles {
            StrategyPriority::Highest
        } else {
            StrategyPriority::CantHandle
        }
    }

    fn take_snapshot(
        &self,
        ctx: &StrategyContext,
        snapshot: &SnapshotRecord,
    ) -> Result<SnapshotRecord> {
        lifecycle::take_on_primary(ctx, snapshot, Some(LocationType::Primary))
    }

    fn backup_snapshot(
        &self,
        _ctx: &StrategyContext,
        snapshot: &SnapshotRecord,
    ) -> Result<SnapshotRecord> {
        Err(Error::NoStrategyAvailable {
            snapshot: snapshot.id,
            operation: SnapshotOperation::Backup,
        })
    }

    /// Same chain pruning as the default strategy; the vote only claims
    /// primary-only snapshots on storage-system pools
    fn delete_snapshot(
        &self,
        ctx: &StrategyContext,
        snapshot: &SnapshotRecord,
    ) -> Result<DeleteOutcome> {
        delete::destroy_snapshot(ctx, snapshot)
    }

    fn revert_snapshot(&self, ctx: &StrategyContext, snapshot: &SnapshotRecord) -> Result<()> {
        lifecycle::revert_on_primary(ctx, snapshot)
    }
}
