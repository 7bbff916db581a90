//! # retrace-db
//!
//! libSQL persistence for Retrace audit records.
//!
//! Owns the audit record and field-detail tables, the FTS5 index over record
//! comments, and the repository methods the engine calls: batched inserts,
//! correlation-scoped loads for rollback, conflict probes, in-place
//! changed-field merges, and the filterable history query.
//!
//! Uses the `libsql` crate (C `SQLite` fork, v0.9.29) — native FTS5 and a
//! stable API.

pub mod error;
pub mod helpers;
mod migrations;
pub mod repos;

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use error::DatabaseError;
use libsql::Builder;

/// Central database handle for Retrace audit storage.
///
/// Wraps a libSQL database and connection, provides prefixed ID generation,
/// and assigns record timestamps that are strictly monotonic per insertion
/// (conflict detection and restore ordering are both defined on them, so no
/// two records for the same target may tie).
pub struct RetraceDb {
    #[allow(dead_code)]
    db: libsql::Database,
    conn: libsql::Connection,
    last_timestamp: Mutex<DateTime<Utc>>,
}

impl RetraceDb {
    /// Open a local database at the given path (`":memory:"` for tests).
    ///
    /// Runs migrations automatically on first open.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the database cannot be opened or
    /// migrations fail.
    pub async fn open_local(path: &str) -> Result<Self, DatabaseError> {
        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;

        // Enable foreign keys (must be per-connection in SQLite) so detail
        // rows cascade with their record.
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Migration(format!("PRAGMA foreign_keys: {e}")))?;

        let retrace_db = Self {
            db,
            conn,
            last_timestamp: Mutex::new(DateTime::<Utc>::MIN_UTC),
        };
        retrace_db.run_migrations().await?;
        Ok(retrace_db)
    }

    /// Access the underlying libSQL connection for direct queries.
    ///
    /// Registered domain readers/restorers use this to reach their own tables.
    #[must_use]
    pub const fn conn(&self) -> &libsql::Connection {
        &self.conn
    }

    /// Generate a prefixed ID via libSQL. Returns e.g., `"aud-a3f8b2c1"`.
    ///
    /// Uses `randomblob(4)` in SQL to produce 8-char hex, then prepends the prefix.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails or returns no rows.
    pub async fn generate_id(&self, prefix: &str) -> Result<String, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT '{prefix}-' || lower(hex(randomblob(4)))"),
                (),
            )
            .await?;
        let row = rows.next().await?.ok_or(DatabaseError::NoResult)?;
        Ok(row.get::<String>(0)?)
    }

    /// Next record timestamp: wall clock, bumped by 1ms whenever the clock
    /// has not advanced past the previously issued timestamp.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned, which cannot happen because
    /// no code path panics while holding it.
    pub fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self
            .last_timestamp
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // truncated to microseconds so the value survives the TEXT column
        // roundtrip unchanged
        let now = Utc::now();
        let mut candidate = DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);
        if candidate <= *last {
            candidate = *last + Duration::milliseconds(1);
        }
        *last = candidate;
        candidate
    }
}
