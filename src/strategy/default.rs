//! Hypervisor-driven snapshots backed up to secondary storage

use super::{SnapshotOperation, SnapshotStrategy, StrategyContext, StrategyPriority};
use crate::error::{Error, Result};
use crate::snapshot::lifecycle;
use crate::snapshot::{delete, DeleteOutcome};
use crate::store::SnapshotRecord;
use crate::types::LocationType;

/// Takes snapshots through the hypervisor and keeps the backup chain on
/// image stores. Cannot revert in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSnapshotStrategy;

impl SnapshotStrategy for DefaultSnapshotStrategy {
    fn name(&self) -> &'static str {
        "default"
    }

    fn can_handle(
        &self,
        _ctx: &StrategyContext,
        snapshot: &SnapshotRecord,
        operation: SnapshotOperation,
    ) -> StrategyPriority {
        match operation {
            SnapshotOperation::Take | SnapshotOperation::Delete => StrategyPriority::Default,
            SnapshotOperation::Backup => {
                if snapshot.location_type == Some(LocationType::Primary) {
                    StrategyPriority::CantHandle
                } else {
                    StrategyPriority::Default
                }
            }
            SnapshotOperation::Revert => StrategyPriority::CantHandle,
        }
    }

    fn take_snapshot(
        &self,
        ctx: &StrategyContext,
        snapshot: &SnapshotRecord,
    ) -> Result<SnapshotRecord> {
        lifecycle::take_on_primary(ctx, snapshot, None)
    }

    fn backup_snapshot(
        &self,
        ctx: &StrategyContext,
        snapshot: &SnapshotRecord,
    ) -> Result<SnapshotRecord> {
        lifecycle::backup_to_secondary(ctx, snapshot)
    }

    fn delete_snapshot(
        &self,
        ctx: &StrategyContext,
        snapshot: &SnapshotRecord,
    ) -> Result<DeleteOutcome> {
        delete::destroy_snapshot(ctx, snapshot)
    }

    fn revert_snapshot(&self, _ctx: &StrategyContext, snapshot: &SnapshotRecord) -> Result<()> {
        Err(Error::NoStrategyAvailable {
            snapshot: snapshot.id,
            operation: SnapshotOperation::Revert,
        })
    }
}
