//! Persisted audit entities and the rollback report.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diff::FieldChange;
use crate::enums::{AuditAction, Channel, FailureReason};

/// An immutable audit record capturing one mutation.
///
/// `target_type` holds the internal type tag; the history API resolves it to
/// the registered public name before handing records to external consumers.
/// `created_at` is assigned at persistence time and is strictly monotonic per
/// insertion, so no two records for the same target can tie.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub id: String,
    pub correlation_id: String,
    pub action: AuditAction,
    pub target_type: String,
    pub target_id: String,
    /// Static field changes: `field name → [old, new]`.
    pub changed_fields: BTreeMap<String, FieldChange>,
    pub operator: String,
    pub operator_ip: Option<String>,
    pub request_id: Option<String>,
    pub channel: Channel,
    pub comment: String,
    /// The record this one reverts, set on rollback-produced records.
    pub rollback_of: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One field-level detail row, owned by exactly one [`AuditRecord`].
///
/// Values are opaque stringified forms — dynamic attributes are untyped at
/// the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldAuditDetail {
    pub record_id: String,
    pub field_name: String,
    pub display_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Outcome of one rollback batch: per-record success/failure, never a hard
/// failure for the whole batch (except the up-front conflict check, which is
/// an error, not a report).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<RollbackFailure>,
}

impl RollbackReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }

    #[must_use]
    pub fn is_full_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One failed record in a rollback batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackFailure {
    pub record_id: String,
    pub reason: FailureReason,
    /// Short, generic description; the full detail is in the logs.
    pub message: String,
}
