//! # retrace-engine
//!
//! The audit engine: registry-driven snapshot capture, commit-deferred
//! recording, correlation-scoped rollback and the public history API.
//!
//! The flow around one domain write:
//! 1. [`recorder::AuditRecorder::begin`] opens an [`operation::OperationScope`]
//!    under the ambient [`context`].
//! 2. Hooks (`on_pre_write`, `on_post_write`, `on_delete`, `on_m2m_change`,
//!    `on_bulk_update`) queue audit work on the scope.
//! 3. After the primary transaction commits, [`recorder::AuditRecorder::commit`]
//!    runs the queue; audit failures are logged, never raised. Dropping the
//!    scope instead discards the queue.
//!
//! Per-type behavior comes from the [`registry::AuditRegistry`]: which fields
//! to ignore, value resolvers, reference expansion allow-lists, declared
//! many-to-many relations, and the reader/restorer/locker callbacks.

pub mod context;
pub mod error;
pub mod history;
pub mod locks;
pub mod operation;
pub mod recorder;
pub mod registry;
pub mod rollback;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::EngineError;
pub use history::{HistoryQuery, HistoryService};
pub use operation::OperationScope;
pub use recorder::{AuditRecorder, BulkUpdateItem};
pub use registry::{AuditRegistry, AuditRegistryBuilder, TypeAudit};
pub use rollback::RollbackManager;
