//! ID prefix constants.
//!
//! All Retrace IDs are `"<prefix>-<8 hex chars>"`, generated by the database
//! handle (`RetraceDb::generate_id`). The prefixes live here so every crate
//! agrees on them.

/// Audit record IDs: `aud-a3f8b2c1`.
pub const PREFIX_AUDIT: &str = "aud";

/// Correlation IDs grouping the records of one logical operation: `cor-…`.
pub const PREFIX_CORRELATION: &str = "cor";

/// Request IDs: `req-…`.
pub const PREFIX_REQUEST: &str = "req";

/// All known prefixes, for tests and validation.
pub const ALL_PREFIXES: &[&str] = &[PREFIX_AUDIT, PREFIX_CORRELATION, PREFIX_REQUEST];
