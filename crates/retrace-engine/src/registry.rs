//! The per-type audit capability table.
//!
//! Every audited entity type registers a [`TypeAudit`] at process start:
//! which static fields to ignore, whether the type carries dynamic
//! attributes, how far it expands when referenced from another entity's
//! snapshot, value resolvers, its public (API-facing) name, declared
//! many-to-many relations, and the typed callbacks the engine dispatches
//! through (reader, restorer, locker). No runtime reflection: if a type
//! wants a capability, it supplies the callback.
//!
//! Registration is single-writer at startup; the built [`AuditRegistry`] is
//! immutable and shared behind an `Arc`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use retrace_core::diff::ValueResolver;
use retrace_core::entities::FieldAuditDetail;
use retrace_core::entity::EntityState;
use retrace_core::enums::AuditAction;
use retrace_core::errors::CoreError;
use retrace_core::snapshot::Snapshot;
use retrace_db::RetraceDb;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Capability callbacks
// ---------------------------------------------------------------------------

/// Reads the current persisted state of one entity.
#[async_trait]
pub trait EntityReader: Send + Sync {
    /// Returns `None` when the entity does not exist.
    async fn read(&self, db: &RetraceDb, id: &str) -> Result<Option<EntityState>, CoreError>;
}

/// Applies a historical snapshot back onto a live entity during rollback.
#[async_trait]
pub trait EntityRestorer: Send + Sync {
    /// `entity` is the current live state (already under lock), `snapshot`
    /// the prior state to re-apply, `details` the field-level rows of the
    /// record being reverted.
    ///
    /// Return `CoreError::Validation` to reject the historical data and
    /// `CoreError::NotFound` if the target vanished mid-restore.
    async fn restore(
        &self,
        db: &RetraceDb,
        entity: &EntityState,
        snapshot: &Snapshot,
        details: &[FieldAuditDetail],
    ) -> Result<(), CoreError>;
}

/// Acquires a store-level hold on a live entity for the duration of a
/// restore and returns its current state.
#[async_trait]
pub trait EntityLocker: Send + Sync {
    /// Returns `None` when the entity no longer exists.
    async fn lock(&self, db: &RetraceDb, id: &str) -> Result<Option<EntityState>, CoreError>;
}

/// Resolves the current member set of a declared many-to-many relation.
#[async_trait]
pub trait M2mResolver: Send + Sync {
    /// Member identities, sorted, so two resolutions of the same set compare
    /// equal regardless of row order.
    async fn members(&self, db: &RetraceDb, id: &str) -> Result<Vec<String>, CoreError>;
}

/// Builds the auto-generated comment for a record when the caller supplied
/// none, keyed by the entity being audited and the action taken.
pub type CommentFn = dyn Fn(&EntityState, AuditAction) -> String + Send + Sync;

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// A many-to-many relation whose changes merge into the primary audit record
/// instead of producing their own.
#[derive(Clone)]
pub struct M2mRelation {
    pub name: String,
    pub resolver: Arc<dyn M2mResolver>,
}

/// A child type whose records surface in the parent's aggregated history
/// view, linked through the named parent-reference field.
#[derive(Debug, Clone)]
pub struct ChildHistory {
    pub child_type: String,
    pub parent_field: String,
}

// ---------------------------------------------------------------------------
// TypeAudit
// ---------------------------------------------------------------------------

/// The audit configuration and capability record for one entity type.
pub struct TypeAudit {
    pub type_tag: String,
    /// Stable external identifier, decoupled from the internal type tag.
    pub public_name: String,
    /// Static fields excluded from snapshot and diff. Always contains `"id"`.
    pub ignored_fields: BTreeSet<String>,
    /// Whether the type carries dynamic attributes.
    pub field_aware: bool,
    /// Allow-list of fields emitted when this type appears as a referenced
    /// value inside another entity's snapshot.
    pub snapshot_fields: BTreeSet<String>,
    /// Per-field raw-to-comparable transforms.
    pub field_resolvers: HashMap<String, Arc<ValueResolver>>,
    /// Transform applied to dynamic attribute values before recording.
    pub dynamic_resolver: Option<Arc<ValueResolver>>,
    /// Field-name sets that are ignorable when taken alone: an update
    /// touching only one of these sets produces no record.
    pub noise_field_sets: Vec<BTreeSet<String>>,
    pub m2m_relations: Vec<M2mRelation>,
    pub comment_template: Option<Arc<CommentFn>>,
    pub reader: Option<Arc<dyn EntityReader>>,
    pub restorer: Option<Arc<dyn EntityRestorer>>,
    pub locker: Option<Arc<dyn EntityLocker>>,
    pub history_children: Vec<ChildHistory>,
}

impl TypeAudit {
    pub fn new(type_tag: impl Into<String>, public_name: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            public_name: public_name.into(),
            ignored_fields: BTreeSet::from(["id".to_string()]),
            field_aware: false,
            snapshot_fields: BTreeSet::new(),
            field_resolvers: HashMap::new(),
            dynamic_resolver: None,
            noise_field_sets: Vec::new(),
            m2m_relations: Vec::new(),
            comment_template: None,
            reader: None,
            restorer: None,
            locker: None,
            history_children: Vec::new(),
        }
    }

    #[must_use]
    pub fn ignore_field(mut self, field: impl Into<String>) -> Self {
        self.ignored_fields.insert(field.into());
        self
    }

    #[must_use]
    pub const fn field_aware(mut self) -> Self {
        self.field_aware = true;
        self
    }

    #[must_use]
    pub fn snapshot_field(mut self, field: impl Into<String>) -> Self {
        self.snapshot_fields.insert(field.into());
        self
    }

    #[must_use]
    pub fn with_field_resolver(
        mut self,
        field: impl Into<String>,
        resolver: Arc<ValueResolver>,
    ) -> Self {
        self.field_resolvers.insert(field.into(), resolver);
        self
    }

    #[must_use]
    pub fn with_dynamic_resolver(mut self, resolver: Arc<ValueResolver>) -> Self {
        self.dynamic_resolver = Some(resolver);
        self
    }

    /// Declare a set of fields that is ignorable when it is the only thing
    /// that changed (e.g. an internal sort order).
    #[must_use]
    pub fn with_noise_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.noise_field_sets
            .push(fields.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_m2m_relation(
        mut self,
        name: impl Into<String>,
        resolver: Arc<dyn M2mResolver>,
    ) -> Self {
        self.m2m_relations.push(M2mRelation {
            name: name.into(),
            resolver,
        });
        self
    }

    #[must_use]
    pub fn with_comment_template(mut self, template: Arc<CommentFn>) -> Self {
        self.comment_template = Some(template);
        self
    }

    #[must_use]
    pub fn with_reader(mut self, reader: Arc<dyn EntityReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    #[must_use]
    pub fn with_restorer(mut self, restorer: Arc<dyn EntityRestorer>) -> Self {
        self.restorer = Some(restorer);
        self
    }

    #[must_use]
    pub fn with_locker(mut self, locker: Arc<dyn EntityLocker>) -> Self {
        self.locker = Some(locker);
        self
    }

    #[must_use]
    pub fn with_history_child(
        mut self,
        child_type: impl Into<String>,
        parent_field: impl Into<String>,
    ) -> Self {
        self.history_children.push(ChildHistory {
            child_type: child_type.into(),
            parent_field: parent_field.into(),
        });
        self
    }

    pub fn m2m_relation(&self, name: &str) -> Option<&M2mRelation> {
        self.m2m_relations.iter().find(|r| r.name == name)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Builds the registry once at startup. Registering the same type tag twice
/// replaces the earlier configuration; two different tags claiming the same
/// public name fail fast.
#[derive(Default)]
pub struct AuditRegistryBuilder {
    types: HashMap<String, Arc<TypeAudit>>,
}

impl AuditRegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns `EngineError::DuplicatePublicName` when another type already
    /// claims the same public name.
    pub fn register(mut self, audit: TypeAudit) -> Result<Self, EngineError> {
        for (tag, existing) in &self.types {
            if existing.public_name == audit.public_name && *tag != audit.type_tag {
                return Err(EngineError::DuplicatePublicName {
                    public_name: audit.public_name,
                    existing: tag.clone(),
                    incoming: audit.type_tag,
                });
            }
        }
        self.types.insert(audit.type_tag.clone(), Arc::new(audit));
        Ok(self)
    }

    #[must_use]
    pub fn build(self) -> AuditRegistry {
        let by_public = self
            .types
            .values()
            .map(|t| (t.public_name.clone(), t.type_tag.clone()))
            .collect();
        AuditRegistry {
            by_tag: self.types,
            by_public,
        }
    }
}

/// Immutable process-wide table mapping entity type tag to its audit
/// configuration.
pub struct AuditRegistry {
    by_tag: HashMap<String, Arc<TypeAudit>>,
    by_public: HashMap<String, String>,
}

impl AuditRegistry {
    #[must_use]
    pub fn is_registered(&self, type_tag: &str) -> bool {
        self.by_tag.contains_key(type_tag)
    }

    #[must_use]
    pub fn get(&self, type_tag: &str) -> Option<&Arc<TypeAudit>> {
        self.by_tag.get(type_tag)
    }

    /// The type's configuration, or an empty default for unregistered types.
    /// Callers needing audit-specific behavior must check `is_registered`
    /// first.
    #[must_use]
    pub fn config_or_default(&self, type_tag: &str) -> Arc<TypeAudit> {
        self.by_tag.get(type_tag).map_or_else(
            || Arc::new(TypeAudit::new(type_tag, type_tag)),
            Arc::clone,
        )
    }

    #[must_use]
    pub fn resolve_by_public_name(&self, public_name: &str) -> Option<&str> {
        self.by_public.get(public_name).map(String::as_str)
    }

    #[must_use]
    pub fn resolve_to_public_name(&self, type_tag: &str) -> Option<&str> {
        self.by_tag
            .get(type_tag)
            .map(|t| t.public_name.as_str())
    }
}
