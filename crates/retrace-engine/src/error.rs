//! Engine error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Two registered types claim the same public name. Raised at
    /// registration time (startup), never at runtime.
    #[error("duplicate public name '{public_name}': claimed by '{existing}' and '{incoming}'")]
    DuplicatePublicName {
        public_name: String,
        existing: String,
        incoming: String,
    },

    /// A history query named a public type no registered type claims.
    #[error("unknown public type name '{0}'")]
    UnknownPublicName(String),

    /// A target touched by the correlation has newer changes outside it.
    /// The whole rollback is rejected before any mutation occurs.
    #[error(
        "rollback conflict: '{target_type}/{target_id}' has changes newer than \
         correlation '{correlation_id}'"
    )]
    RollbackConflict {
        correlation_id: String,
        target_type: String,
        target_id: String,
    },

    #[error(transparent)]
    Database(#[from] retrace_db::error::DatabaseError),

    #[error(transparent)]
    Core(#[from] retrace_core::errors::CoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
