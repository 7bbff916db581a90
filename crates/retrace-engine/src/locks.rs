//! Per-entity non-blocking locks for rollback.
//!
//! A rollback batch must not stall on an entity someone else is actively
//! restoring: acquisition either succeeds immediately or fails, never
//! queues. Contention is a terminal, reported failure for that record.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Process-wide set of held `(type_tag, id)` locks.
#[derive(Debug, Default)]
pub struct EntityLocks {
    held: Mutex<HashSet<(String, String)>>,
}

impl EntityLocks {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Try to acquire the lock for one entity. Returns `None` immediately if
    /// it is already held.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>, type_tag: &str, id: &str) -> Option<EntityLockGuard> {
        let key = (type_tag.to_string(), id.to_string());
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if held.insert(key.clone()) {
            Some(EntityLockGuard {
                locks: Arc::clone(self),
                key,
            })
        } else {
            None
        }
    }
}

/// Releases the entity lock on drop.
#[derive(Debug)]
pub struct EntityLockGuard {
    locks: Arc<EntityLocks>,
    key: (String, String),
}

impl Drop for EntityLockGuard {
    fn drop(&mut self) {
        let mut held = self
            .locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.key);
    }
}
