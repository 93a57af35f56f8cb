//! Per-artifact publish locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use fleet_core::ArtifactKey;

/// One mutex per `(project, version, os, arch)`, so concurrent publishes of
/// the same artifact run one at a time while different artifacts proceed.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mutex guarding `key`. Lock the returned handle for the duration
    /// of the critical section.
    ///
    /// Entries no caller holds any more are dropped first, so the registry
    /// only grows with the number of publishes in flight.
    pub fn lock_for(&self, key: &ArtifactKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(key.table_key()).or_default().clone()
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
