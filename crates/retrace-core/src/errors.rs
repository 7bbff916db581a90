//! Cross-cutting error types for Retrace.
//!
//! This module defines errors that can originate from any crate in the
//! system. Domain-specific errors (`DatabaseError`, `EngineError`,
//! `ConfigError`) are defined in their respective crates.
//!
//! `CoreError` doubles as the restorer contract error: a rollback restorer
//! returns `Validation` when the historical data is rejected, `NotFound`
//! when the live entity is gone, and anything else through `Other`. The
//! rollback manager maps these onto per-record `FailureReason`s.

use thiserror::Error;

/// Errors that can be raised by any Retrace crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Entity lookup returned no result.
    #[error("Entity not found: {type_tag} {id}")]
    NotFound { type_tag: String, id: String },

    /// Data failed validation (schema, format, constraints).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Catch-all for unexpected errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
