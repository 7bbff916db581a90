//! Audit recording and history query configuration.

use serde::{Deserialize, Serialize};

/// Default page size for history queries.
const fn default_history_limit() -> u32 {
    100
}

/// Hard cap on history page size.
const fn default_history_max_limit() -> u32 {
    500
}

/// Default cap on child records folded into an aggregated history view.
const fn default_child_history_limit() -> u32 {
    50
}

/// Fallback comment when neither the context nor a per-type template
/// provides one.
fn default_comment() -> String {
    "recorded by retrace".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    /// Default page size for history queries when the caller passes no limit.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,

    /// Hard cap on history page size regardless of what the caller asks for.
    #[serde(default = "default_history_max_limit")]
    pub history_max_limit: u32,

    /// Per-child-type cap when aggregating child records into a parent's history.
    #[serde(default = "default_child_history_limit")]
    pub child_history_limit: u32,

    /// Comment used when a record would otherwise have none.
    #[serde(default = "default_comment")]
    pub default_comment: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            history_max_limit: default_history_max_limit(),
            child_history_limit: default_child_history_limit(),
            default_comment: default_comment(),
        }
    }
}

impl AuditConfig {
    /// Clamp a caller-provided page size to the configured bounds.
    #[must_use]
    pub fn effective_limit(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.history_limit)
            .min(self.history_max_limit)
    }
}
