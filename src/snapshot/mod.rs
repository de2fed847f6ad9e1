//! Volume snapshot lifecycle: take, back up, delete and revert
//!
//! [`SnapshotService`] validates a request, asks the registry for the
//! strategy with the highest vote and hands the operation over. Strategies
//! take the per-snapshot lock themselves and re-read the row under it.

pub(crate) mod delete;
pub(crate) mod lifecycle;

pub use delete::DeleteOutcome;

use crate::backend::BackendDriver;
use crate::chain::{self, BackupPlan};
use crate::config::SnapshotConfig;
use crate::error::{Error, Result};
use crate::events::UsageSink;
use crate::state::{SnapshotState, StateMachine, VolumeEvent};
use crate::store::{EntityStore, SnapshotRecord};
use crate::strategy::{SnapshotOperation, StrategyContext, StrategyRegistry};
use crate::types::{SnapshotId, SnapshotType, VolumeId};
use std::sync::Arc;
use tracing::{debug, instrument};

pub struct SnapshotService {
    ctx: StrategyContext,
    registry: StrategyRegistry,
}

impl SnapshotService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        driver: Arc<dyn BackendDriver>,
        config: SnapshotConfig,
        events: Arc<dyn UsageSink>,
    ) -> Self {
        Self::with_registry(
            StrategyContext::new(store, driver, config, events),
            StrategyRegistry::with_defaults(),
        )
    }

    pub fn with_registry(ctx: StrategyContext, registry: StrategyRegistry) -> Self {
        Self { ctx, registry }
    }

    pub fn context(&self) -> &StrategyContext {
        &self.ctx
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    fn snapshot(&self, id: SnapshotId) -> Result<SnapshotRecord> {
        self.ctx
            .store
            .snapshot(id)?
            .ok_or(Error::SnapshotNotFound(id))
    }

    /// Snapshot a volume, then back it up when configured to.
    ///
    /// A backup failure is returned after the snapshot has been purged.
    /// When no strategy can back the snapshot up, it stays on primary.
    #[instrument(skip(self))]
    pub fn take_snapshot(
        &self,
        volume_id: VolumeId,
        name: &str,
        snapshot_type: SnapshotType,
    ) -> Result<SnapshotRecord> {
        let volume = self.ctx.volume(volume_id)?;
        volume
            .state
            .apply(volume.id.get(), VolumeEvent::SnapshotRequested)?;

        let candidate = SnapshotRecord::allocate(&volume, name, snapshot_type);
        let strategy = self
            .registry
            .select(&self.ctx, &candidate, SnapshotOperation::Take)?;

        let snapshot = self.ctx.store.insert_snapshot(candidate)?;
        let snapshot = strategy.take_snapshot(&self.ctx, &snapshot)?;

        if !self.ctx.config.backup_to_secondary {
            return Ok(snapshot);
        }
        match self
            .registry
            .select(&self.ctx, &snapshot, SnapshotOperation::Backup)
        {
            Ok(strategy) => strategy.backup_snapshot(&self.ctx, &snapshot),
            Err(e) if e.is_unsupported() => {
                debug!(
                    snapshot_id = %snapshot.id,
                    "no backup strategy, keeping snapshot on primary"
                );
                Ok(snapshot)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    pub fn backup_snapshot(&self, id: SnapshotId) -> Result<SnapshotRecord> {
        let snapshot = self.snapshot(id)?;
        let strategy = self
            .registry
            .select(&self.ctx, &snapshot, SnapshotOperation::Backup)?;
        strategy.backup_snapshot(&self.ctx, &snapshot)
    }

    /// Delete a snapshot. Deleting one that is already destroyed succeeds
    /// without touching the backend.
    #[instrument(skip(self))]
    pub fn delete_snapshot(&self, id: SnapshotId) -> Result<DeleteOutcome> {
        let snapshot = self.snapshot(id)?;
        if snapshot.state == SnapshotState::Destroyed {
            return Ok(DeleteOutcome::noop(id));
        }
        let strategy = self
            .registry
            .select(&self.ctx, &snapshot, SnapshotOperation::Delete)?;
        strategy.delete_snapshot(&self.ctx, &snapshot)
    }

    #[instrument(skip(self))]
    pub fn revert_snapshot(&self, id: SnapshotId) -> Result<()> {
        let snapshot = self.snapshot(id)?;
        let strategy = self
            .registry
            .select(&self.ctx, &snapshot, SnapshotOperation::Revert)?;
        strategy.revert_snapshot(&self.ctx, &snapshot)
    }

    /// The full-versus-delta decision a backup would make right now
    pub fn plan_backup(&self, id: SnapshotId) -> Result<BackupPlan> {
        let snapshot = self.snapshot(id)?;
        let volume = self.ctx.volume(snapshot.volume_id)?;
        chain::plan_backup(self.ctx.store.as_ref(), &self.ctx.config, &snapshot, &volume)
    }
}
