//! Optional cache of derived per-task state (blocked flag, depth).
//!
//! Entries are grouped per owner and tagged with the graph version they were
//! computed against. Readers call [`DerivedCache::observe`] with the version
//! they just read from storage; if another process moved it, that owner's
//! entries are dropped. Writes through this process report their own bump
//! with [`DerivedCache::committed`] so the surviving entries stay usable.
//!
//! Every invalidation also bumps an epoch. A reader takes the epoch before it
//! starts computing and may only store its result if the epoch is unchanged,
//! so a read racing a write can never put pre-write state back.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::id::{OwnerId, TaskId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Derived {
    pub blocked: Option<bool>,
    pub depth: Option<u32>,
}

#[derive(Debug)]
struct OwnerEntries {
    version: i64,
    entries: HashMap<TaskId, Derived>,
}

#[derive(Debug, Default)]
struct CacheState {
    epoch: u64,
    owners: HashMap<OwnerId, OwnerEntries>,
}

/// Token handed out by [`DerivedCache::epoch`] and [`DerivedCache::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Epoch(u64);

#[derive(Debug, Default)]
pub struct DerivedCache {
    enabled: bool,
    state: Mutex<CacheState>,
}

impl DerivedCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: Mutex::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn epoch(&self) -> Epoch {
        Epoch(self.state().epoch)
    }

    /// Records that storage holds `version` for `owner` and returns the epoch
    /// to compute under. Entries computed against another version are dropped.
    pub fn observe(&self, owner: &OwnerId, version: i64) -> Epoch {
        let mut guard = self.state();
        let state = &mut *guard;
        if !self.enabled {
            return Epoch(state.epoch);
        }
        let known = state
            .owners
            .entry(owner.clone())
            .or_insert_with(|| OwnerEntries {
                version,
                entries: HashMap::new(),
            });
        if known.version != version {
            known.version = version;
            known.entries.clear();
            state.epoch += 1;
        }
        Epoch(state.epoch)
    }

    /// Moves `owner` from `from` to `to` after a write made by this process.
    /// If the cache had not seen `from`, the owner is forgotten instead.
    pub fn committed(&self, owner: &OwnerId, from: i64, to: i64) {
        let mut state = self.state();
        state.epoch += 1;
        let Some(known) = state.owners.get_mut(owner) else {
            return;
        };
        if known.version == from {
            known.version = to;
        } else {
            state.owners.remove(owner);
        }
    }

    pub fn get(&self, owner: &OwnerId, id: &TaskId) -> Derived {
        if !self.enabled {
            return Derived::default();
        }
        self.state()
            .owners
            .get(owner)
            .and_then(|known| known.entries.get(id).copied())
            .unwrap_or_default()
    }

    pub fn store_blocked(&self, owner: &OwnerId, id: &TaskId, blocked: bool, seen: Epoch) {
        self.store(owner, id, seen, |entry| entry.blocked = Some(blocked));
    }

    pub fn store_depth(&self, owner: &OwnerId, id: &TaskId, depth: u32, seen: Epoch) {
        self.store(owner, id, seen, |entry| entry.depth = Some(depth));
    }

    fn store(&self, owner: &OwnerId, id: &TaskId, seen: Epoch, update: impl FnOnce(&mut Derived)) {
        if !self.enabled {
            return;
        }
        let mut state = self.state();
        if state.epoch != seen.0 {
            return;
        }
        // Only owners whose version has been observed can hold entries
        if let Some(known) = state.owners.get_mut(owner) {
            update(known.entries.entry(id.clone()).or_default());
        }
    }

    /// Drops the entries of `ids` and starts a new epoch.
    pub fn invalidate<'i>(&self, owner: &OwnerId, ids: impl IntoIterator<Item = &'i TaskId>) {
        let mut state = self.state();
        state.epoch += 1;
        if let Some(known) = state.owners.get_mut(owner) {
            for id in ids {
                known.entries.remove(id);
            }
        }
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.epoch += 1;
        state.owners.clear();
    }

    pub fn len(&self) -> usize {
        self.state()
            .owners
            .values()
            .map(|known| known.entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
