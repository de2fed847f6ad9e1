//! Snapshot strategies and the priority dispatcher
//!
//! Every registered strategy votes on every request with a
//! [`StrategyPriority`]; the highest vote runs the operation. Voting only
//! probes capabilities and formats, it never mutates anything.

mod default;
mod storage_system;

pub use default::DefaultSnapshotStrategy;
pub use storage_system::StorageSystemSnapshotStrategy;

use crate::backend::{BackendDriver, Capabilities};
use crate::config::SnapshotConfig;
use crate::error::{Error, Result};
use crate::events::UsageSink;
use crate::lock::{LockGuard, LockTable};
use crate::snapshot::DeleteOutcome;
use crate::store::{EntityStore, SnapshotRecord, VolumeRecord};
use crate::types::{DataStoreId, SnapshotId, VolumeId};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotOperation {
    Take,
    Backup,
    Delete,
    Revert,
}

impl SnapshotOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotOperation::Take => "take",
            SnapshotOperation::Backup => "backup",
            SnapshotOperation::Delete => "delete",
            SnapshotOperation::Revert => "revert",
        }
    }
}

impl fmt::Display for SnapshotOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Vote cast by a strategy; higher wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StrategyPriority {
    CantHandle = 0,
    /// Generic path every pool supports
    Default = 1,
    /// Strategies registered for one hypervisor class
    Hypervisor = 2,
    /// The storage system does the work natively
    Highest = 3,
}

/// Everything a strategy needs to run an operation
#[derive(Clone)]
pub struct StrategyContext {
    pub store: Arc<dyn EntityStore>,
    pub driver: Arc<dyn BackendDriver>,
    pub locks: Arc<LockTable<SnapshotId>>,
    pub config: SnapshotConfig,
    pub events: Arc<dyn UsageSink>,
}

impl StrategyContext {
    pub fn new(
        store: Arc<dyn EntityStore>,
        driver: Arc<dyn BackendDriver>,
        config: SnapshotConfig,
        events: Arc<dyn UsageSink>,
    ) -> Self {
        let locks = Arc::new(LockTable::new("snapshot", config.lock_wait()));
        Self {
            store,
            driver,
            locks,
            config,
            events,
        }
    }

    /// Lock a snapshot and re-read its row under the lock
    pub fn lock_snapshot(
        &self,
        id: SnapshotId,
    ) -> Result<(LockGuard<'_, SnapshotId>, SnapshotRecord)> {
        let guard = self.locks.acquire(id)?;
        let snapshot = self
            .store
            .snapshot(id)?
            .ok_or(Error::SnapshotNotFound(id))?;
        Ok((guard, snapshot))
    }

    pub fn volume(&self, id: VolumeId) -> Result<VolumeRecord> {
        self.store.volume(id)?.ok_or(Error::VolumeNotFound(id))
    }

    /// Capabilities of a datastore; an unreachable backend advertises nothing
    pub fn capabilities(&self, store: DataStoreId) -> Capabilities {
        match self.driver.capabilities(store) {
            Ok(caps) => caps,
            Err(e) => {
                warn!(store_id = %store, error = %e, "capability probe failed");
                Capabilities::new()
            }
        }
    }
}

impl fmt::Debug for StrategyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// One way of carrying out snapshot operations against a class of backend
pub trait SnapshotStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Read-only vote on whether this strategy should run `operation`
    fn can_handle(
        &self,
        ctx: &StrategyContext,
        snapshot: &SnapshotRecord,
        operation: SnapshotOperation,
    ) -> StrategyPriority;

    fn take_snapshot(&self, ctx: &StrategyContext, snapshot: &SnapshotRecord)
        -> Result<SnapshotRecord>;

    fn backup_snapshot(
        &self,
        ctx: &StrategyContext,
        snapshot: &SnapshotRecord,
    ) -> Result<SnapshotRecord>;

    fn delete_snapshot(&self, ctx: &StrategyContext, snapshot: &SnapshotRecord)
        -> Result<DeleteOutcome>;

    fn revert_snapshot(&self, ctx: &StrategyContext, snapshot: &SnapshotRecord) -> Result<()>;
}

/// Index of the winning vote; the first registered strategy wins a tie
pub fn pick(votes: &[StrategyPriority]) -> Option<usize> {
    let mut best: Option<(usize, StrategyPriority)> = None;
    for (i, vote) in votes.iter().copied().enumerate() {
        if vote == StrategyPriority::CantHandle {
            continue;
        }
        if best.map(|(_, b)| vote > b).unwrap_or(true) {
            best = Some((i, vote));
        }
    }
    best.map(|(i, _)| i)
}

/// Registered strategies in registration order
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn SnapshotStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in strategy
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DefaultSnapshotStrategy));
        registry.register(Arc::new(StorageSystemSnapshotStrategy));
        registry
    }

    pub fn register(&mut self, strategy: Arc<dyn SnapshotStrategy>) {
        self.strategies.push(strategy);
    }

    /// Every strategy's vote, in registration order
    pub fn votes(
        &self,
        ctx: &StrategyContext,
        snapshot: &SnapshotRecord,
        operation: SnapshotOperation,
    ) -> Vec<(&'static str, StrategyPriority)> {
        self.strategies
            .iter()
            .map(|s| (s.name(), s.can_handle(ctx, snapshot, operation)))
            .collect()
    }

    /// The strategy that should run `operation` on `snapshot`
    pub fn select(
        &self,
        ctx: &StrategyContext,
        snapshot: &SnapshotRecord,
        operation: SnapshotOperation,
    ) -> Result<Arc<dyn SnapshotStrategy>> {
        let votes: Vec<_> = self
            .votes(ctx, snapshot, operation)
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        let winner = pick(&votes).and_then(|i| Some((self.strategies.get(i)?, votes.get(i)?)));
        match winner {
            Some((strategy, priority)) => {
                debug!(
                    snapshot_id = %snapshot.id,
                    %operation,
                    strategy = strategy.name(),
                    ?priority,
                    "strategy selected"
                );
                Ok(Arc::clone(strategy))
            }
            None => Err(Error::NoStrategyAvailable {
                snapshot: snapshot.id,
                operation,
            }),
        }
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.strategies.iter().map(|s| s.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DriverOp, CAN_REVERT_VOLUME_TO_SNAPSHOT, STORAGE_SYSTEM_SNAPSHOT};
    use crate::testing::Fixture;
    use StrategyPriority::*;

    #[test]
    fn pick_takes_highest_vote() {
        assert_eq!(pick(&[Default, Highest, Hypervisor]), Some(1));
        assert_eq!(pick(&[Hypervisor, Default]), Some(0));
        assert_eq!(pick(&[Default, Default]), Some(0));
        assert_eq!(pick(&[CantHandle, CantHandle]), None);
        assert_eq!(pick(&[]), None);
    }

    #[test]
    fn operation_names() {
        assert_eq!(SnapshotOperation::Take.to_string(), "take");
        assert_eq!(SnapshotOperation::Backup.to_string(), "backup");
    }

    #[test]
    fn plain_pool_uses_default_strategy() {
        let fx = Fixture::kvm();
        let ctx = fx.context();
        let snap = fx.backed_up_snapshot("a", None);
        let registry = StrategyRegistry::with_defaults();

        for op in [
            SnapshotOperation::Take,
            SnapshotOperation::Backup,
            SnapshotOperation::Delete,
        ] {
            let chosen = registry.select(&ctx, &snap, op).unwrap();
            assert_eq!(chosen.name(), "default");
        }
    }

    #[test]
    fn revert_without_capability_is_unsupported_before_any_io() {
        let fx = Fixture::kvm();
        let ctx = fx.context();
        let snap = fx.backed_up_snapshot("a", None);
        let registry = StrategyRegistry::with_defaults();

        let err = registry
            .select(&ctx, &snap, SnapshotOperation::Revert)
            .err()
            .unwrap();
        assert!(err.is_unsupported());
        assert!(fx.driver.io_calls().is_empty());
    }

    #[test]
    fn storage_system_pool_outranks_default() {
        let fx = Fixture::kvm();
        fx.advertise(&[STORAGE_SYSTEM_SNAPSHOT, CAN_REVERT_VOLUME_TO_SNAPSHOT]);
        let ctx = fx.context();
        let snap = fx.primary_snapshot("a");
        let registry = StrategyRegistry::with_defaults();

        let votes = registry.votes(&ctx, &snap, SnapshotOperation::Take);
        assert_eq!(votes, vec![("default", Default), ("storage-system", Highest)]);
        assert_eq!(
            registry
                .select(&ctx, &snap, SnapshotOperation::Revert)
                .unwrap()
                .name(),
            "storage-system"
        );
        assert_eq!(fx.driver.io_calls().len(), 0);
        assert!(fx.driver.count(DriverOp::Capabilities) > 0);
    }

    #[test]
    fn revert_needs_an_eligible_format() {
        let fx = Fixture::kvm();
        fx.advertise(&[CAN_REVERT_VOLUME_TO_SNAPSHOT]);
        let mut volume = fx.volume();
        volume.format = crate::types::ImageFormat::Iso;
        fx.store.update_volume(&volume).unwrap();
        let snap = fx.primary_snapshot("a");

        let err = StrategyRegistry::with_defaults()
            .select(&fx.context(), &snap, SnapshotOperation::Revert)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::NoStrategyAvailable {
                operation: SnapshotOperation::Revert,
                ..
            }
        ));
    }

    /// Stand-in for a strategy registered for a single hypervisor class
    struct KvmOnly;

    impl SnapshotStrategy for KvmOnly {
        fn name(&self) -> &'static str {
            "kvm"
        }

        fn can_handle(
            &self,
            _ctx: &StrategyContext,
            snapshot: &SnapshotRecord,
            operation: SnapshotOperation,
        ) -> StrategyPriority {
            match (snapshot.hypervisor, operation) {
                (crate::types::HypervisorType::Kvm, SnapshotOperation::Take) => Hypervisor,
                _ => CantHandle,
            }
        }

        fn take_snapshot(
            &self,
            _ctx: &StrategyContext,
            snapshot: &SnapshotRecord,
        ) -> Result<SnapshotRecord> {
            Ok(snapshot.clone())
        }

        fn backup_snapshot(
            &self,
            _ctx: &StrategyContext,
            snapshot: &SnapshotRecord,
        ) -> Result<SnapshotRecord> {
            Ok(snapshot.clone())
        }

        fn delete_snapshot(
            &self,
            _ctx: &StrategyContext,
            snapshot: &SnapshotRecord,
        ) -> Result<DeleteOutcome> {
            Ok(DeleteOutcome::noop(snapshot.id))
        }

        fn revert_snapshot(
            &self,
            _ctx: &StrategyContext,
            _snapshot: &SnapshotRecord,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn hypervisor_strategy_sits_between_default_and_storage_system() {
        let fx = Fixture::kvm();
        let snap = fx.primary_snapshot("a");
        let mut registry = StrategyRegistry::with_defaults();
        registry.register(Arc::new(KvmOnly));

        let chosen = registry
            .select(&fx.context(), &snap, SnapshotOperation::Take)
            .unwrap();
        assert_eq!(chosen.name(), "kvm");
        assert_eq!(
            registry
                .select(&fx.context(), &snap, SnapshotOperation::Delete)
                .unwrap()
                .name(),
            "default"
        );

        fx.advertise(&[STORAGE_SYSTEM_SNAPSHOT]);
        let ctx = fx.context();
        let votes = registry.votes(&ctx, &snap, SnapshotOperation::Take);
        assert_eq!(
            votes,
            vec![("default", Default), ("storage-system", Highest), ("kvm", Hypervisor)]
        );
        assert_eq!(
            registry.select(&ctx, &snap, SnapshotOperation::Take).unwrap().name(),
            "storage-system"
        );

        let xen = Fixture::xen();
        let snap = xen.primary_snapshot("b");
        assert_eq!(
            registry
                .select(&xen.context(), &snap, SnapshotOperation::Take)
                .unwrap()
                .name(),
            "default"
        );
    }
}
