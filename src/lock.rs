//! Per-id advisory lock table
//!
//! Serializes state-mutating operations on one logical snapshot (or one VM,
//! for VM-snapshot trees). The table is owned by the service and passed to
//! whoever needs it; release happens when the [`LockGuard`] drops, on every
//! exit path.

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct LockTable<K> {
    name: &'static str,
    held: Mutex<HashSet<K>>,
    released: Condvar,
    wait: Duration,
}

impl<K> LockTable<K>
where
    K: Copy + Eq + Hash + Display,
{
    /// A table whose `acquire` waits up to `wait` for a held entry.
    /// A zero wait fails fast.
    pub fn new(name: &'static str, wait: Duration) -> Self {
        Self {
            name,
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            wait,
        }
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashSet<K>>> {
        self.held
            .lock()
            .map_err(|_| Error::Other(format!("{} lock table poisoned", self.name)))
    }

    /// Take the exclusive entry for `key`
    pub fn acquire(&self, key: K) -> Result<LockGuard<'_, K>> {
        let deadline = Instant::now() + self.wait;
        let mut held = self.entries()?;

        while held.contains(&key) {
            let now = Instant::now();
            if now >= deadline {
                debug!(table = self.name, key = %key, "lock busy");
                return Err(Error::LockAcquisitionFailed(format!("{} {}", self.name, key)));
            }
            let (guard, _) = self
                .released
                .wait_timeout(held, deadline - now)
                .map_err(|_| Error::Other(format!("{} lock table poisoned", self.name)))?;
            held = guard;
        }

        held.insert(key);
        Ok(LockGuard { table: self, key })
    }

    /// Drop the entry for `key`; releasing a free key is a no-op
    pub fn release(&self, key: K) {
        match self.held.lock() {
            Ok(mut held) => {
                if held.remove(&key) {
                    self.released.notify_all();
                }
            }
            Err(_) => warn!(table = self.name, key = %key, "lock table poisoned on release"),
        }
    }

    pub fn is_held(&self, key: K) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(&key))
            .unwrap_or(false)
    }
}

/// Holds one lock-table entry until dropped
#[derive(Debug)]
pub struct LockGuard<'a, K>
where
    K: Copy + Eq + Hash + Display,
{
    table: &'a LockTable<K>,
    key: K,
}

impl<K> LockGuard<'_, K>
where
    K: Copy + Eq + Hash + Display,
{
    pub fn key(&self) -> K {
        self.key
    }
}

impl<K> Drop for LockGuard<'_, K>
where
    K: Copy + Eq + Hash + Display,
{
    fn drop(&mut self) {
        self.table.release(self.key);
    }
}
