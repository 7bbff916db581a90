//! Correlation-scoped rollback.
//!
//! `execute` loads every UPDATE record of one correlation id, rejects the
//! whole batch if any touched target has newer changes outside the
//! correlation, then restores records one by one in reverse chronological
//! order under per-entity non-blocking locks. Failures are collected per
//! record; one failure never aborts the rest of the batch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use retrace_core::context::OperationContext;
use retrace_core::diff::FieldChange;
use retrace_core::entities::{AuditRecord, FieldAuditDetail, RollbackFailure, RollbackReport};
use retrace_core::enums::FailureReason;
use retrace_core::errors::CoreError;
use retrace_core::ids::PREFIX_CORRELATION;
use retrace_core::snapshot::{DynamicValue, Snapshot};
use retrace_db::RetraceDb;
use retrace_db::repos::records::{NewAuditRecord, NewFieldDetail};

use crate::context;
use crate::error::EngineError;
use crate::locks::EntityLocks;
use crate::registry::AuditRegistry;

pub struct RollbackManager {
    db: Arc<RetraceDb>,
    registry: Arc<AuditRegistry>,
    locks: Arc<EntityLocks>,
}

impl RollbackManager {
    pub fn new(db: Arc<RetraceDb>, registry: Arc<AuditRegistry>) -> Self {
        Self {
            db,
            registry,
            locks: EntityLocks::new(),
        }
    }

    /// The lock table this manager arbitrates restores through.
    #[must_use]
    pub const fn locks(&self) -> &Arc<EntityLocks> {
        &self.locks
    }

    /// Revert every UPDATE record of one correlation id.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::RollbackConflict` (before any mutation) when a
    /// touched target has newer changes outside the correlation, or
    /// `EngineError::Database` if loading the records fails. Per-record
    /// restore failures are reported, not raised.
    pub async fn execute(&self, correlation_id: &str) -> Result<RollbackReport, EngineError> {
        let records = self
            .db
            .update_records_for_correlation(correlation_id)
            .await?;
        if records.is_empty() {
            return Ok(RollbackReport::default());
        }

        self.check_conflicts(correlation_id, &records).await?;

        // one fresh correlation groups every restore of this batch, so the
        // rollback itself can be audited (and rolled back) as one operation
        let rollback_correlation = self.db.generate_id(PREFIX_CORRELATION).await?;
        let base_ctx = context::current();

        let mut report = RollbackReport::default();
        for (record, details) in records {
            // newest first: later changes are undone before earlier ones
            self.restore_record(&base_ctx, &rollback_correlation, record, details, &mut report)
                .await;
        }

        info!(
            correlation_id,
            rollback_correlation,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "rollback batch finished"
        );
        Ok(report)
    }

    async fn check_conflicts(
        &self,
        correlation_id: &str,
        records: &[(AuditRecord, Vec<FieldAuditDetail>)],
    ) -> Result<(), EngineError> {
        let mut latest: HashMap<(&str, &str), DateTime<Utc>> = HashMap::new();
        for (record, _) in records {
            let entry = latest
                .entry((record.target_type.as_str(), record.target_id.as_str()))
                .or_insert(record.created_at);
            if record.created_at > *entry {
                *entry = record.created_at;
            }
        }

        for ((target_type, target_id), newest) in latest {
            if self
                .db
                .newer_record_exists(target_type, target_id, newest, correlation_id)
                .await?
            {
                return Err(EngineError::RollbackConflict {
                    correlation_id: correlation_id.to_string(),
                    target_type: target_type.to_string(),
                    target_id: target_id.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn restore_record(
        &self,
        base_ctx: &OperationContext,
        rollback_correlation: &str,
        record: AuditRecord,
        details: Vec<FieldAuditDetail>,
        report: &mut RollbackReport,
    ) {
        let Some(config) = self.registry.get(&record.target_type) else {
            warn!(
                record_id = %record.id,
                target_type = %record.target_type,
                "target type not registered; record skipped"
            );
            return;
        };
        let (Some(restorer), Some(locker)) = (&config.restorer, &config.locker) else {
            warn!(
                record_id = %record.id,
                target_type = %record.target_type,
                "no restorer/locker registered; record skipped"
            );
            return;
        };

        let Some(_guard) = self
            .locks
            .try_acquire(&record.target_type, &record.target_id)
        else {
            report.failed.push(RollbackFailure {
                record_id: record.id.clone(),
                reason: FailureReason::LockUnavailable,
                message: "entity is locked by another restore".to_string(),
            });
            return;
        };

        let entity = match locker.lock(&self.db, &record.target_id).await {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                report.failed.push(RollbackFailure {
                    record_id: record.id.clone(),
                    reason: FailureReason::TargetMissing,
                    message: "entity no longer exists".to_string(),
                });
                return;
            }
            Err(err) => {
                error!(record_id = %record.id, error = %err, "locker failed");
                report.failed.push(RollbackFailure {
                    record_id: record.id.clone(),
                    reason: FailureReason::Unknown,
                    message: "failed to lock entity".to_string(),
                });
                return;
            }
        };

        let snapshot = prior_snapshot(&record, &details);
        let rb_ctx = base_ctx.for_rollback(rollback_correlation, record.id.clone());

        let outcome = context::with_context(
            rb_ctx.clone(),
            restorer.restore(&self.db, &entity, &snapshot, &details),
        )
        .await;

        match outcome {
            Ok(()) => {
                self.record_rollback(&rb_ctx, &record, &details).await;
                report.succeeded.push(record.id);
            }
            Err(CoreError::Validation(detail)) => {
                warn!(record_id = %record.id, detail, "restorer rejected historical data");
                report.failed.push(RollbackFailure {
                    record_id: record.id,
                    reason: FailureReason::Validation,
                    message: "restorer rejected the historical data".to_string(),
                });
            }
            Err(CoreError::NotFound { .. }) => {
                report.failed.push(RollbackFailure {
                    record_id: record.id,
                    reason: FailureReason::TargetMissing,
                    message: "entity no longer exists".to_string(),
                });
            }
            Err(CoreError::Other(err)) => {
                error!(record_id = %record.id, error = %err, "restore failed");
                report.failed.push(RollbackFailure {
                    record_id: record.id,
                    reason: FailureReason::Unknown,
                    message: "unexpected restore failure".to_string(),
                });
            }
        }
    }

    /// Persist the audit record marking one successful restore: the original
    /// record's pairs inverted, under the rollback correlation. Best-effort,
    /// like every audit write.
    async fn record_rollback(
        &self,
        ctx: &OperationContext,
        original: &AuditRecord,
        details: &[FieldAuditDetail],
    ) {
        let changed_fields = original
            .changed_fields
            .iter()
            .map(|(name, change)| {
                (
                    name.clone(),
                    FieldChange::new(change.new.clone(), change.old.clone()),
                )
            })
            .collect();
        let inverted_details = details
            .iter()
            .map(|d| NewFieldDetail {
                field_name: d.field_name.clone(),
                display_name: d.display_name.clone(),
                old_value: d.new_value.clone(),
                new_value: d.old_value.clone(),
            })
            .collect();

        let record = NewAuditRecord {
            correlation_id: ctx.correlation_id.clone(),
            action: original.action,
            target_type: original.target_type.clone(),
            target_id: original.target_id.clone(),
            changed_fields,
            operator: ctx.operator.clone(),
            operator_ip: ctx.operator_ip.clone(),
            request_id: ctx.request_id.clone(),
            channel: ctx.channel,
            comment: format!("rollback of {}", original.id),
            rollback_of: Some(original.id.clone()),
        };

        if let Err(err) = self.db.insert_record(record, inverted_details).await {
            error!(
                original_record = %original.id,
                error = %err,
                "failed to persist rollback audit record"
            );
        }
    }
}

/// Re-derive the prior snapshot of a record: static fields from the old
/// sides of `changed_fields`, dynamic attributes from the detail rows' old
/// values.
fn prior_snapshot(record: &AuditRecord, details: &[FieldAuditDetail]) -> Snapshot {
    let static_fields = record
        .changed_fields
        .iter()
        .map(|(name, change)| (name.clone(), change.old.clone()))
        .collect();
    let dynamic_fields = details
        .iter()
        .map(|d| {
            (
                d.field_name.clone(),
                DynamicValue {
                    value: d
                        .old_value
                        .clone()
                        .map_or(Value::Null, Value::String),
                    display_name: d.display_name.clone(),
                    attribute_def: None,
                },
            )
        })
        .collect();
    Snapshot {
        static_fields,
        dynamic_fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        gadget_attr_value, gadget_name, read_gadget, rename_gadget, seed_gadget, set_gadget_attr,
        test_context, test_recorder,
    };
    use pretty_assertions::assert_eq;
    use retrace_core::enums::{AuditAction, Channel};
    use retrace_db::repos::records::HistoryFilter;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn manager(db: &Arc<RetraceDb>, registry: &Arc<AuditRegistry>) -> RollbackManager {
        RollbackManager::new(Arc::clone(db), Arc::clone(registry))
    }

    /// Record one audited name change through the recorder and return its
    /// correlation id.
    async fn audited_rename(
        db: &Arc<RetraceDb>,
        recorder: &crate::recorder::AuditRecorder,
        id: &str,
        new_name: &str,
        correlation: &str,
    ) {
        let mut scope = recorder.begin_with(test_context(correlation));
        let entity = read_gadget(db, id).await.unwrap();
        recorder.on_pre_write(&mut scope, &entity).await.unwrap();
        rename_gadget(db, id, new_name).await;
        recorder.on_post_write(&mut scope, "gadget", id, false);
        recorder.commit(scope).await;
    }

    #[tokio::test]
    async fn rollback_restores_static_field() {
        let (db, recorder) = test_recorder().await;
        seed_gadget(&db, "gdt-1", "probe", "active", 1).await;
        audited_rename(&db, &recorder, "gdt-1", "sensor", "cor-bbbb0001").await;
        assert_eq!(gadget_name(&db, "gdt-1").await.as_deref(), Some("sensor"));

        let mgr = manager(&db, recorder.registry());
        let report = mgr.execute("cor-bbbb0001").await.unwrap();

        assert!(report.is_full_success());
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(gadget_name(&db, "gdt-1").await.as_deref(), Some("probe"));
    }

    #[tokio::test]
    async fn rollback_restores_dynamic_attribute_and_marks_record() {
        let (db, recorder) = test_recorder().await;
        seed_gadget(&db, "gdt-1", "probe", "active", 1).await;
        set_gadget_attr(&db, "gdt-1", "color", "red", "Color").await;

        let mut scope = recorder.begin_with(test_context("cor-bbbb0002"));
        let entity = read_gadget(&db, "gdt-1").await.unwrap();
        recorder.on_pre_write(&mut scope, &entity).await.unwrap();
        set_gadget_attr(&db, "gdt-1", "color", "blue", "Color").await;
        recorder.on_post_write(&mut scope, "gadget", "gdt-1", false);
        recorder.commit(scope).await;

        let original = db
            .query_records(&HistoryFilter {
                correlation_id: Some("cor-bbbb0002".to_string()),
                ..Default::default()
            })
            .await
            .unwrap()
            .remove(0);

        let mgr = manager(&db, recorder.registry());
        let ctx = test_context("cor-caller01");
        let report = crate::context::with_context(ctx, mgr.execute("cor-bbbb0002"))
            .await
            .unwrap();

        assert_eq!(report.succeeded, vec![original.id.clone()]);
        assert_eq!(
            gadget_attr_value(&db, "gdt-1", "color").await.as_deref(),
            Some("red")
        );

        // the restore produced its own distinguishable audit record
        let rollback_records = db
            .query_records(&HistoryFilter {
                target_type: Some("gadget".to_string()),
                target_id: Some("gdt-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.rollback_of.is_some())
            .collect::<Vec<_>>();
        assert_eq!(rollback_records.len(), 1);
        assert_eq!(
            rollback_records[0].rollback_of.as_deref(),
            Some(original.id.as_str())
        );
        assert_ne!(rollback_records[0].correlation_id, "cor-bbbb0002");
        assert_eq!(rollback_records[0].operator, "alice");
    }

    #[tokio::test]
    async fn conflict_rejects_whole_batch_without_mutation() {
        let (db, recorder) = test_recorder().await;
        seed_gadget(&db, "gdt-1", "probe", "active", 1).await;
        audited_rename(&db, &recorder, "gdt-1", "sensor", "cor-bbbb0003").await;
        // a newer, unrelated change to the same target
        audited_rename(&db, &recorder, "gdt-1", "beacon", "cor-other001").await;

        let mgr = manager(&db, recorder.registry());
        let result = mgr.execute("cor-bbbb0003").await;

        assert!(matches!(
            result,
            Err(EngineError::RollbackConflict { target_id, .. }) if target_id == "gdt-1"
        ));
        assert_eq!(gadget_name(&db, "gdt-1").await.as_deref(), Some("beacon"));
    }

    #[tokio::test]
    async fn second_rollback_is_rejected_by_conflict_check() {
        let (db, recorder) = test_recorder().await;
        seed_gadget(&db, "gdt-1", "probe", "active", 1).await;
        audited_rename(&db, &recorder, "gdt-1", "sensor", "cor-bbbb0004").await;

        let mgr = manager(&db, recorder.registry());
        mgr.execute("cor-bbbb0004").await.unwrap();
        assert_eq!(gadget_name(&db, "gdt-1").await.as_deref(), Some("probe"));

        // the first rollback's own record is now the newest for the target
        let second = mgr.execute("cor-bbbb0004").await;
        assert!(matches!(second, Err(EngineError::RollbackConflict { .. })));
        assert_eq!(gadget_name(&db, "gdt-1").await.as_deref(), Some("probe"));
    }

    #[tokio::test]
    async fn lock_contention_is_a_terminal_per_record_failure() {
        let (db, recorder) = test_recorder().await;
        seed_gadget(&db, "gdt-1", "probe", "active", 1).await;
        audited_rename(&db, &recorder, "gdt-1", "sensor", "cor-bbbb0005").await;

        let mgr = manager(&db, recorder.registry());
        let _held = mgr.locks().try_acquire("gadget", "gdt-1").unwrap();

        let report = mgr.execute("cor-bbbb0005").await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].reason, FailureReason::LockUnavailable);
        assert_eq!(gadget_name(&db, "gdt-1").await.as_deref(), Some("sensor"));
    }

    #[tokio::test]
    async fn missing_target_is_reported() {
        let (db, recorder) = test_recorder().await;
        seed_gadget(&db, "gdt-1", "probe", "active", 1).await;
        audited_rename(&db, &recorder, "gdt-1", "sensor", "cor-bbbb0006").await;
        db.conn()
            .execute("DELETE FROM gadgets WHERE id = 'gdt-1'", ())
            .await
            .unwrap();

        let mgr = manager(&db, recorder.registry());
        let report = mgr.execute("cor-bbbb0006").await.unwrap();

        assert!(report.succeeded.is_empty());
        assert_eq!(report.failed[0].reason, FailureReason::TargetMissing);
    }

    #[tokio::test]
    async fn validation_rejection_is_reported() {
        let (db, recorder) = test_recorder().await;
        seed_gadget(&db, "gdt-1", "sensor", "active", 1).await;

        // a record whose prior state the restorer refuses (empty name)
        db.insert_record(
            NewAuditRecord {
                correlation_id: "cor-bbbb0007".to_string(),
                action: AuditAction::Update,
                target_type: "gadget".to_string(),
                target_id: "gdt-1".to_string(),
                changed_fields: BTreeMap::from([(
                    "name".to_string(),
                    FieldChange::new(json!(""), json!("sensor")),
                )]),
                operator: "alice".to_string(),
                operator_ip: None,
                request_id: None,
                channel: Channel::Web,
                comment: String::new(),
                rollback_of: None,
            },
            vec![],
        )
        .await
        .unwrap();

        let mgr = manager(&db, recorder.registry());
        let report = mgr.execute("cor-bbbb0007").await.unwrap();

        assert_eq!(report.failed[0].reason, FailureReason::Validation);
        assert_eq!(gadget_name(&db, "gdt-1").await.as_deref(), Some("sensor"));
    }

    #[tokio::test]
    async fn record_without_restorer_is_warned_and_omitted() {
        let (db, recorder) = test_recorder().await;
        seed_gadget(&db, "gdt-1", "probe", "active", 1).await;
        audited_rename(&db, &recorder, "gdt-1", "sensor", "cor-bbbb0008").await;

        // users are registered with a reader only
        db.insert_record(
            NewAuditRecord {
                correlation_id: "cor-bbbb0008".to_string(),
                action: AuditAction::Update,
                target_type: "user".to_string(),
                target_id: "usr-1".to_string(),
                changed_fields: BTreeMap::from([(
                    "name".to_string(),
                    FieldChange::new(json!("Ana"), json!("Dana")),
                )]),
                operator: "alice".to_string(),
                operator_ip: None,
                request_id: None,
                channel: Channel::Web,
                comment: String::new(),
                rollback_of: None,
            },
            vec![],
        )
        .await
        .unwrap();

        let mgr = manager(&db, recorder.registry());
        let report = mgr.execute("cor-bbbb0008").await.unwrap();

        // the user record appears nowhere in the report; the gadget restores
        assert_eq!(report.succeeded.len(), 1);
        assert!(report.failed.is_empty());
        assert_eq!(gadget_name(&db, "gdt-1").await.as_deref(), Some("probe"));
    }

    #[tokio::test]
    async fn create_and_delete_records_are_not_rolled_back() {
        let (db, recorder) = test_recorder().await;

        let mut scope = recorder.begin_with(test_context("cor-bbbb0009"));
        seed_gadget(&db, "gdt-1", "probe", "active", 1).await;
        recorder.on_post_write(&mut scope, "gadget", "gdt-1", true);
        recorder.commit(scope).await;

        let mgr = manager(&db, recorder.registry());
        let report = mgr.execute("cor-bbbb0009").await.unwrap();

        assert!(report.is_empty());
        assert_eq!(gadget_name(&db, "gdt-1").await.as_deref(), Some("probe"));
    }

    #[tokio::test]
    async fn per_record_failures_do_not_abort_the_batch() {
        let (db, recorder) = test_recorder().await;
        seed_gadget(&db, "gdt-1", "probe", "active", 1).await;
        seed_gadget(&db, "gdt-2", "relay", "active", 2).await;

        let mut scope = recorder.begin_with(test_context("cor-bbbb0010"));
        for id in ["gdt-1", "gdt-2"] {
            let entity = read_gadget(&db, id).await.unwrap();
            recorder.on_pre_write(&mut scope, &entity).await.unwrap();
        }
        rename_gadget(&db, "gdt-1", "sensor").await;
        rename_gadget(&db, "gdt-2", "router").await;
        recorder.on_post_write(&mut scope, "gadget", "gdt-1", false);
        recorder.on_post_write(&mut scope, "gadget", "gdt-2", false);
        recorder.commit(scope).await;

        db.conn()
            .execute("DELETE FROM gadgets WHERE id = 'gdt-2'", ())
            .await
            .unwrap();

        let mgr = manager(&db, recorder.registry());
        let report = mgr.execute("cor-bbbb0010").await.unwrap();

        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].reason, FailureReason::TargetMissing);
        assert_eq!(gadget_name(&db, "gdt-1").await.as_deref(), Some("probe"));
    }

    #[tokio::test]
    async fn unknown_correlation_yields_empty_report() {
        let (db, recorder) = test_recorder().await;
        let mgr = manager(&db, recorder.registry());
        let report = mgr.execute("cor-nothing0").await.unwrap();
        assert!(report.is_empty());
    }
}
