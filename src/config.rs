//! Operator-tunable settings for the snapshot core

use crate::error::{Error, Result};
use crate::types::HypervisorType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Default bound on delta-chain depth on secondary storage
pub const DEFAULT_DELTA_MAX: u32 = 16;

pub const KEY_DELTA_MAX: &str = "snapshot.delta.max";
pub const KEY_BACKUP_TO_SECONDARY: &str = "snapshot.backup.to.secondary";
pub const KEY_LOCK_WAIT_MS: &str = "snapshot.lock.wait.ms";
pub const KEY_INCREMENTAL_HYPERVISORS: &str = "snapshot.incremental.hypervisors";

/// Configuration for the snapshot lifecycle core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Ancestor hops on secondary storage after which a full backup is forced
    pub delta_max: u32,
    /// Back a snapshot up to secondary storage right after taking it
    pub backup_to_secondary: bool,
    /// How long a lock acquire waits for a busy entry; 0 fails fast
    pub lock_wait_ms: u64,
    /// Hypervisor classes whose snapshots form incremental chains
    pub incremental_hypervisors: Vec<HypervisorType>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            delta_max: DEFAULT_DELTA_MAX,
            backup_to_secondary: true,
            lock_wait_ms: 0,
            incremental_hypervisors: vec![HypervisorType::XenServer],
        }
    }
}

impl SnapshotConfig {
    /// Every key accepted by [`get`](Self::get) and [`set`](Self::set)
    pub const KEYS: [&'static str; 4] = [
        KEY_DELTA_MAX,
        KEY_BACKUP_TO_SECONDARY,
        KEY_LOCK_WAIT_MS,
        KEY_INCREMENTAL_HYPERVISORS,
    ];

    /// Load from a JSON file; a missing file gives the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let mut config: SnapshotConfig = serde_json::from_str(&content)?;
            config.delta_max = config.delta_max.max(1);
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Effective chain bound, never below one
    pub fn delta_max(&self) -> u32 {
        self.delta_max.max(1)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn supports_incremental(&self, hypervisor: HypervisorType) -> bool {
        self.incremental_hypervisors.contains(&hypervisor)
    }

    /// String value of a dotted key
    pub fn get(&self, key: &str) -> Result<String> {
        match key {
            KEY_DELTA_MAX => Ok(self.delta_max().to_string()),
            KEY_BACKUP_TO_SECONDARY => Ok(self.backup_to_secondary.to_string()),
            KEY_LOCK_WAIT_MS => Ok(self.lock_wait_ms.to_string()),
            KEY_INCREMENTAL_HYPERVISORS => Ok(self
                .incremental_hypervisors
                .iter()
                .map(|h| h.as_str())
                .collect::<Vec<_>>()
                .join(",")),
            _ => Err(Error::Config(format!("Unknown configuration key '{}'", key))),
        }
    }

    /// Apply a string override by dotted key.
    ///
    /// Numbers that fail to parse fall back to the default for that key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let defaults = Self::default();
        match key {
            KEY_DELTA_MAX => {
                self.delta_max = parse_or(key, value, defaults.delta_max).max(1);
            }
            KEY_BACKUP_TO_SECONDARY => {
                self.backup_to_secondary = parse_or(key, value, defaults.backup_to_secondary);
            }
            KEY_LOCK_WAIT_MS => {
                self.lock_wait_ms = parse_or(key, value, defaults.lock_wait_ms);
            }
            KEY_INCREMENTAL_HYPERVISORS => {
                self.incremental_hypervisors = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| s.parse::<HypervisorType>().map_err(Error::Config))
                    .collect::<Result<Vec<_>>>()?;
            }
            _ => return Err(Error::Config(format!("Unknown configuration key '{}'", key))),
        }
        Ok(())
    }
}

fn parse_or<T: std::str::FromStr + std::fmt::Display>(key: &str, value: &str, default: T) -> T {
    match value.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(key, value, default = %default, "invalid configuration value, using default");
            default
        }
    }
}
