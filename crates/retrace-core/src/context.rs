//! The per-operation context value type.
//!
//! [`OperationContext`] carries who performed a mutation and under which
//! request/correlation it happened. It is an immutable value: the engine
//! captures an owned snapshot of it whenever work is deferred, so a task that
//! runs after commit still observes the context active at deferral time.
//!
//! Ambient propagation (the task-local scope) lives in `retrace-engine`;
//! this crate only defines the value being propagated.

use serde::{Deserialize, Serialize};

use crate::enums::Channel;
use crate::ids::PREFIX_CORRELATION;

/// Metadata describing one logical operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    /// Acting user or principal.
    pub operator: String,
    pub operator_ip: Option<String>,
    pub request_id: Option<String>,
    /// Groups every audit record produced by this operation.
    pub correlation_id: String,
    pub channel: Channel,
    /// Caller-supplied comment; overrides the per-type template when set.
    pub comment: Option<String>,
    /// Set while a rollback re-applies historical snapshots, so the restore's
    /// own audit trail is distinguishable from an ordinary edit.
    pub is_rollback: bool,
    /// The audit record being reverted, when `is_rollback` is set.
    pub rollback_of: Option<String>,
}

impl OperationContext {
    pub fn new(operator: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            operator_ip: None,
            request_id: None,
            correlation_id: correlation_id.into(),
            channel: Channel::System,
            comment: None,
            is_rollback: false,
            rollback_of: None,
        }
    }

    /// Fallback context for code paths running outside any operation scope.
    #[must_use]
    pub fn system() -> Self {
        Self::new("system", format!("{PREFIX_CORRELATION}-00000000"))
    }

    #[must_use]
    pub fn with_operator_ip(mut self, ip: impl Into<String>) -> Self {
        self.operator_ip = Some(ip.into());
        self
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    #[must_use]
    pub const fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Derive the context a rollback runs under: same operator and channel,
    /// a fresh correlation id, and the rollback marker pointing at the record
    /// being reverted.
    #[must_use]
    pub fn for_rollback(
        &self,
        new_correlation_id: impl Into<String>,
        record_id: impl Into<String>,
    ) -> Self {
        Self {
            operator: self.operator.clone(),
            operator_ip: self.operator_ip.clone(),
            request_id: self.request_id.clone(),
            correlation_id: new_correlation_id.into(),
            channel: self.channel,
            comment: None,
            is_rollback: true,
            rollback_of: Some(record_id.into()),
        }
    }
}
