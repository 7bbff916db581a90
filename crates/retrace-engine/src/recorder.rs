//! The audit recorder.
//!
//! Hooks called around domain writes queue audit work on an
//! [`OperationScope`]; [`AuditRecorder::commit`] runs the queue strictly
//! after the caller's primary transaction succeeded. Failures inside the
//! queue are logged and swallowed: a missing audit record must never fail
//! the primary write.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use retrace_config::AuditConfig;
use retrace_core::context::OperationContext;
use retrace_core::diff::{ChangeSet, deletion_changes, diff_snapshots};
use retrace_core::entity::EntityState;
use retrace_core::enums::AuditAction;
use retrace_core::snapshot::Snapshot;
use retrace_db::RetraceDb;
use retrace_db::repos::records::{NewAuditRecord, NewFieldDetail};

use crate::context;
use crate::error::EngineError;
use crate::operation::{OperationScope, PendingAudit};
use crate::registry::{AuditRegistry, TypeAudit};
use crate::snapshot;

/// One entry of a bulk update: the entity, its before/after snapshots as the
/// caller observed them, and the dynamic attribute names the bulk operation
/// declared as touched.
pub struct BulkUpdateItem {
    pub entity: EntityState,
    pub before: Snapshot,
    pub after: Snapshot,
    pub changed_attributes: Vec<String>,
}

pub struct AuditRecorder {
    db: Arc<RetraceDb>,
    registry: Arc<AuditRegistry>,
    config: AuditConfig,
}

impl AuditRecorder {
    /// The registry this recorder dispatches through.
    #[must_use]
    pub const fn registry(&self) -> &Arc<AuditRegistry> {
        &self.registry
    }
}

impl AuditRecorder {
    pub fn new(db: Arc<RetraceDb>, registry: Arc<AuditRegistry>, config: AuditConfig) -> Self {
        Self {
            db,
            registry,
            config,
        }
    }

    /// Start an operation scope under the ambient context.
    #[must_use]
    pub fn begin(&self) -> OperationScope {
        OperationScope::new(context::current())
    }

    /// Start an operation scope under an explicit context.
    #[must_use]
    pub fn begin_with(&self, ctx: OperationContext) -> OperationScope {
        OperationScope::new(ctx)
    }

    /// Pre-write hook: when the type is registered and the entity already
    /// exists, stash its "before" snapshot, consuming a prefetched one first.
    ///
    /// # Errors
    ///
    /// Returns `EngineError` if reading the current state fails.
    pub async fn on_pre_write(
        &self,
        scope: &mut OperationScope,
        entity: &EntityState,
    ) -> Result<(), EngineError> {
        if !self.registry.is_registered(&entity.type_tag) {
            return Ok(());
        }

        let before = match scope.consume_prefetched(&entity.type_tag, &entity.id) {
            Some(snapshot) => Some(snapshot),
            None => snapshot::read_current(&self.registry, &self.db, &entity.type_tag, &entity.id)
                .await?
                .map(|(_, snapshot)| snapshot),
        };
        if let Some(before) = before {
            scope.stash_before(&entity.type_tag, &entity.id, before);
        }
        Ok(())
    }

    /// Post-write hook: queue the deferred diff-and-persist task. The
    /// context is captured now; the re-read happens at commit.
    pub fn on_post_write(
        &self,
        scope: &mut OperationScope,
        type_tag: &str,
        id: &str,
        was_create: bool,
    ) {
        if !self.registry.is_registered(type_tag) {
            return;
        }
        let before = scope.take_stashed(type_tag, id);
        let ctx = scope.ctx.clone();
        scope.push(PendingAudit::DeferredWrite {
            ctx,
            type_tag: type_tag.to_string(),
            id: id.to_string(),
            was_create,
            before,
        });
    }

    /// Delete hook: the diff is computed synchronously because the entity is
    /// gone after commit; persistence is still deferred.
    ///
    /// # Errors
    ///
    /// Returns `EngineError` if reading the pre-delete state fails.
    pub async fn on_delete(
        &self,
        scope: &mut OperationScope,
        entity: &EntityState,
    ) -> Result<(), EngineError> {
        let Some(config) = self.registry.get(&entity.type_tag).cloned() else {
            return Ok(());
        };

        let before = match scope.consume_prefetched(&entity.type_tag, &entity.id) {
            Some(snapshot) => snapshot,
            None => match scope.take_stashed(&entity.type_tag, &entity.id) {
                Some(snapshot) => snapshot,
                None => {
                    match snapshot::read_current(
                        &self.registry,
                        &self.db,
                        &entity.type_tag,
                        &entity.id,
                    )
                    .await?
                    {
                        Some((_, snapshot)) => snapshot,
                        None => snapshot::snapshot_entity(&self.registry, &self.db, entity).await?,
                    }
                }
            },
        };

        let changes = deletion_changes(&before, config.dynamic_resolver.as_deref());
        let ctx = scope.ctx.clone();
        scope.push(PendingAudit::Prepared {
            ctx,
            action: AuditAction::Delete,
            entity: entity.clone(),
            changes,
        });
        Ok(())
    }

    /// Many-to-many hook, called before the relation rows are written. The
    /// first call per (entity, relation) in an operation resolves and keeps
    /// the pre-change member set; the merge re-resolves at commit and folds
    /// `[old, new]` into the primary record for the same correlation.
    pub async fn on_m2m_change(&self, scope: &mut OperationScope, entity: &EntityState, relation: &str) {
        let Some(config) = self.registry.get(&entity.type_tag) else {
            return;
        };
        let Some(rel) = config.m2m_relation(relation) else {
            warn!(
                type_tag = %entity.type_tag,
                relation,
                "relation change on an undeclared m2m relation; not audited"
            );
            return;
        };
        if !scope.first_m2m_change(&entity.type_tag, &entity.id, relation) {
            return;
        }

        let old_members = match rel.resolver.members(&self.db, &entity.id).await {
            Ok(members) => members_value(members),
            Err(error) => {
                warn!(%error, relation, "failed to resolve m2m members; relation change not audited");
                return;
            }
        };
        let ctx = scope.ctx.clone();
        scope.push(PendingAudit::M2mMerge {
            ctx,
            type_tag: entity.type_tag.clone(),
            id: entity.id.clone(),
            relation: relation.to_string(),
            old_members,
        });
    }

    /// Bulk variant: the caller supplies before/after snapshots and the
    /// dynamic attribute names it touched; one record is queued per entity
    /// with at least one real diff.
    pub fn on_bulk_update(&self, scope: &mut OperationScope, items: Vec<BulkUpdateItem>) {
        for item in items {
            let Some(config) = self.registry.get(&item.entity.type_tag) else {
                continue;
            };

            let before = restrict_dynamic(item.before, &item.changed_attributes);
            let after = restrict_dynamic(item.after, &item.changed_attributes);
            let changes = diff_snapshots(&before, &after, config.dynamic_resolver.as_deref());

            if changes.is_empty() || changes.is_noise_only(&config.noise_field_sets) {
                debug!(
                    type_tag = %item.entity.type_tag,
                    id = %item.entity.id,
                    "bulk update produced no recordable change"
                );
                continue;
            }
            let ctx = scope.ctx.clone();
            scope.push(PendingAudit::Prepared {
                ctx,
                action: AuditAction::Update,
                entity: item.entity,
                changes,
            });
        }
    }

    /// Run the deferred queue. Call this only after the primary transaction
    /// committed; dropping the scope instead discards the queue.
    ///
    /// Record-producing tasks run first, relation merges after them: a merge
    /// folds into the primary record of the same correlation, which must
    /// exist by then no matter which hook fired first during the operation.
    ///
    /// Every per-task failure is logged and swallowed.
    pub async fn commit(&self, scope: OperationScope) {
        let (merges, writes): (Vec<_>, Vec<_>) = scope
            .pending
            .into_iter()
            .partition(|task| matches!(task, PendingAudit::M2mMerge { .. }));

        for task in writes.into_iter().chain(merges) {
            let outcome = match task {
                PendingAudit::DeferredWrite {
                    ctx,
                    type_tag,
                    id,
                    was_create,
                    before,
                } => {
                    self.run_deferred_write(&ctx, &type_tag, &id, was_create, before)
                        .await
                }
                PendingAudit::Prepared {
                    ctx,
                    action,
                    entity,
                    changes,
                } => {
                    let config = self.registry.config_or_default(&entity.type_tag);
                    self.persist(&ctx, &config, &entity, action, changes).await
                }
                PendingAudit::M2mMerge {
                    ctx,
                    type_tag,
                    id,
                    relation,
                    old_members,
                } => {
                    self.run_m2m_merge(&ctx, &type_tag, &id, &relation, old_members)
                        .await
                }
            };
            if let Err(error) = outcome {
                error!(%error, "audit write failed; the primary write is unaffected");
            }
        }
    }

    async fn run_deferred_write(
        &self,
        ctx: &OperationContext,
        type_tag: &str,
        id: &str,
        was_create: bool,
        before: Option<Snapshot>,
    ) -> Result<(), EngineError> {
        let Some(config) = self.registry.get(type_tag).cloned() else {
            return Ok(());
        };

        let Some((entity, after)) =
            snapshot::read_current(&self.registry, &self.db, type_tag, id).await?
        else {
            // a later delete in the same transaction wins
            debug!(type_tag, id, "entity gone before audit write; skipping");
            return Ok(());
        };

        let resolver = config.dynamic_resolver.as_deref();
        let before = before.unwrap_or_else(Snapshot::empty);
        let changes = diff_snapshots(&before, &after, resolver);

        if !was_create
            && (changes.is_empty() || changes.is_noise_only(&config.noise_field_sets))
        {
            debug!(type_tag, id, "no-op update; no audit record persisted");
            return Ok(());
        }

        let action = if was_create {
            AuditAction::Create
        } else {
            AuditAction::Update
        };
        self.persist(ctx, &config, &entity, action, changes).await
    }

    async fn run_m2m_merge(
        &self,
        ctx: &OperationContext,
        type_tag: &str,
        id: &str,
        relation: &str,
        old_members: Value,
    ) -> Result<(), EngineError> {
        let Some(primary) = self
            .db
            .find_primary_record(&ctx.correlation_id, type_tag, id)
            .await?
        else {
            warn!(
                correlation_id = %ctx.correlation_id,
                type_tag,
                id,
                relation,
                "no primary audit record for m2m merge; relation change dropped"
            );
            return Ok(());
        };

        let Some(config) = self.registry.get(type_tag) else {
            return Ok(());
        };
        let Some(rel) = config.m2m_relation(relation) else {
            return Ok(());
        };

        let new_members = members_value(rel.resolver.members(&self.db, id).await?);
        self.db
            .set_changed_field(
                &primary.id,
                relation,
                &retrace_core::diff::FieldChange::new(old_members, new_members),
            )
            .await?;
        Ok(())
    }

    async fn persist(
        &self,
        ctx: &OperationContext,
        config: &TypeAudit,
        entity: &EntityState,
        action: AuditAction,
        changes: ChangeSet,
    ) -> Result<(), EngineError> {
        let comment = ctx.comment.clone().map_or_else(
            || {
                config.comment_template.as_ref().map_or_else(
                    || self.config.default_comment.clone(),
                    |template| template(entity, action),
                )
            },
            |comment| comment,
        );

        let record = NewAuditRecord {
            correlation_id: ctx.correlation_id.clone(),
            action,
            target_type: entity.type_tag.clone(),
            target_id: entity.id.clone(),
            changed_fields: changes.static_changes,
            operator: ctx.operator.clone(),
            operator_ip: ctx.operator_ip.clone(),
            request_id: ctx.request_id.clone(),
            channel: ctx.channel,
            comment,
            rollback_of: ctx.rollback_of.clone(),
        };
        let details = changes
            .dynamic_changes
            .iter()
            .map(|change| NewFieldDetail {
                field_name: change.name.clone(),
                display_name: change.display_name.clone(),
                old_value: detail_value(&change.old),
                new_value: detail_value(&change.new),
            })
            .collect();

        let inserted = self.db.insert_record(record, details).await?;
        debug!(
            record_id = %inserted.id,
            action = %action,
            target = %format!("{}/{}", entity.type_tag, entity.id),
            "audit record persisted"
        );
        Ok(())
    }
}

/// Detail rows store opaque stringified values: `null` maps to SQL NULL,
/// strings stay raw, everything else becomes its JSON text.
fn detail_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn members_value(members: Vec<String>) -> Value {
    Value::Array(members.into_iter().map(Value::String).collect())
}

fn restrict_dynamic(mut snapshot: Snapshot, changed_attributes: &[String]) -> Snapshot {
    let keep: std::collections::BTreeSet<&str> =
        changed_attributes.iter().map(String::as_str).collect();
    snapshot.dynamic_fields = std::mem::take(&mut snapshot.dynamic_fields)
        .into_iter()
        .filter(|(name, _)| keep.contains(name.as_str()))
        .collect::<BTreeMap<_, _>>();
    snapshot
}
