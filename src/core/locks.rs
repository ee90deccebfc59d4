//! Per-owner mutual exclusion for structural writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::id::OwnerId;

/// Map size above which idle entries are swept on the next lookup.
const PRUNE_THRESHOLD: usize = 64;

#[derive(Debug, Default)]
pub struct OwnerLocks {
    locks: Mutex<HashMap<OwnerId, Arc<Mutex<()>>>>,
}

impl OwnerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mutex guarding `owner`'s graph. Callers lock it for the duration
    /// of one validate-and-write cycle.
    pub fn lock_for(&self, owner: &OwnerId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.len() > PRUNE_THRESHOLD {
            // Only the map holds a reference: nobody is waiting on it
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks.entry(owner.clone()).or_default().clone()
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
