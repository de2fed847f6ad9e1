//! Usage and lifecycle notifications

use crate::types::{SnapshotId, VmSnapshotId, VolumeId};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageEvent {
    SnapshotCreated {
        snapshot: SnapshotId,
        volume: VolumeId,
        size: u64,
    },
    SnapshotBackedUp {
        snapshot: SnapshotId,
        full_backup: bool,
        physical_size: u64,
    },
    SnapshotDeleted {
        snapshot: SnapshotId,
        volume: VolumeId,
    },
    VolumeReverted {
        snapshot: SnapshotId,
        volume: VolumeId,
    },
    VmSnapshotCreated {
        vm_snapshot: VmSnapshotId,
    },
    VmSnapshotReverted {
        vm_snapshot: VmSnapshotId,
    },
    VmSnapshotDeleted {
        vm_snapshot: VmSnapshotId,
    },
    VmSnapshotHidden {
        vm_snapshot: VmSnapshotId,
        physical_size: u64,
    },
}

/// Fire-and-forget receiver of usage events.
///
/// `emit` has no error channel; implementations swallow their own failures.
pub trait UsageSink: Send + Sync {
    fn emit(&self, event: UsageEvent);
}

/// Writes every event to the log
#[derive(Debug, Default)]
pub struct LogSink;

impl UsageSink for LogSink {
    fn emit(&self, event: UsageEvent) {
        info!(?event, "usage event");
    }
}

/// Keeps events in memory for inspection
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<UsageEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UsageEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl UsageSink for RecordingSink {
    fn emit(&self, event: UsageEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
