//! Operation-scoped state.
//!
//! An [`OperationScope`] models one logical operation (one write request,
//! one transactional boundary): the context captured when the operation
//! began, the prefetch cache, the stashed "before" snapshots, and the
//! ordered queue of audit tasks deferred to commit. Dropping a scope without
//! committing discards the queue — if the primary transaction rolled back,
//! no audit record is ever written.

use std::collections::{HashMap, HashSet};

use retrace_core::context::OperationContext;
use retrace_core::diff::ChangeSet;
use retrace_core::entity::EntityState;
use retrace_core::enums::AuditAction;
use retrace_core::snapshot::Snapshot;
use serde_json::Value;

type EntityKey = (String, String);

/// One audit task waiting for the primary transaction to commit. Every
/// variant carries an owned context snapshot captured at deferral time.
pub(crate) enum PendingAudit {
    /// Re-read, diff and persist after commit.
    DeferredWrite {
        ctx: OperationContext,
        type_tag: String,
        id: String,
        was_create: bool,
        before: Option<Snapshot>,
    },
    /// Changes already computed (deletes, bulk updates); persist after
    /// commit.
    Prepared {
        ctx: OperationContext,
        action: AuditAction,
        entity: EntityState,
        changes: ChangeSet,
    },
    /// Merge a relation's member-set change into the primary record.
    M2mMerge {
        ctx: OperationContext,
        type_tag: String,
        id: String,
        relation: String,
        old_members: Value,
    },
}

/// State for one logical operation.
pub struct OperationScope {
    pub(crate) ctx: OperationContext,
    prefetched: HashMap<EntityKey, Snapshot>,
    stashed: HashMap<EntityKey, Snapshot>,
    m2m_seen: HashSet<(String, String, String)>,
    pub(crate) pending: Vec<PendingAudit>,
}

impl OperationScope {
    pub(crate) fn new(ctx: OperationContext) -> Self {
        Self {
            ctx,
            prefetched: HashMap::new(),
            stashed: HashMap::new(),
            m2m_seen: HashSet::new(),
            pending: Vec::new(),
        }
    }

    #[must_use]
    pub const fn context(&self) -> &OperationContext {
        &self.ctx
    }

    /// Store a snapshot a prior hook already read, so the next consumer
    /// skips the redundant read.
    pub fn capture_prefetched(&mut self, type_tag: &str, id: &str, snapshot: Snapshot) {
        self.prefetched
            .insert((type_tag.to_string(), id.to_string()), snapshot);
    }

    /// Remove and return a prefetched snapshot — at most once per capture.
    pub fn consume_prefetched(&mut self, type_tag: &str, id: &str) -> Option<Snapshot> {
        self.prefetched
            .remove(&(type_tag.to_string(), id.to_string()))
    }

    pub(crate) fn stash_before(&mut self, type_tag: &str, id: &str, snapshot: Snapshot) {
        self.stashed
            .insert((type_tag.to_string(), id.to_string()), snapshot);
    }

    pub(crate) fn take_stashed(&mut self, type_tag: &str, id: &str) -> Option<Snapshot> {
        self.stashed
            .remove(&(type_tag.to_string(), id.to_string()))
    }

    /// Track the first relation change per (type, id, relation); only the
    /// first one queues a merge task carrying the pre-change member set.
    pub(crate) fn first_m2m_change(&mut self, type_tag: &str, id: &str, relation: &str) -> bool {
        self.m2m_seen.insert((
            type_tag.to_string(),
            id.to_string(),
            relation.to_string(),
        ))
    }

    pub(crate) fn push(&mut self, task: PendingAudit) {
        self.pending.push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn prefetched_snapshot_consumed_at_most_once() {
        let mut scope = OperationScope::new(OperationContext::system());
        let snapshot = Snapshot {
            static_fields: BTreeMap::from([("name".to_string(), json!("probe"))]),
            dynamic_fields: BTreeMap::new(),
        };

        scope.capture_prefetched("gadget", "gdt-1", snapshot.clone());

        assert_eq!(scope.consume_prefetched("gadget", "gdt-1"), Some(snapshot));
        assert_eq!(scope.consume_prefetched("gadget", "gdt-1"), None);
    }

    #[test]
    fn m2m_first_change_tracking() {
        let mut scope = OperationScope::new(OperationContext::system());
        assert!(scope.first_m2m_change("gadget", "gdt-1", "tags"));
        assert!(!scope.first_m2m_change("gadget", "gdt-1", "tags"));
        assert!(scope.first_m2m_change("gadget", "gdt-2", "tags"));
    }
}
