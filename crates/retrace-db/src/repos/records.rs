//! Audit record repository — batched inserts, correlation loads for
//! rollback, conflict probes, in-place changed-field merges, and the
//! filterable history query.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use retrace_core::diff::FieldChange;
use retrace_core::entities::{AuditRecord, FieldAuditDetail};
use retrace_core::enums::{AuditAction, Channel};
use retrace_core::ids::PREFIX_AUDIT;

use crate::RetraceDb;
use crate::error::DatabaseError;
use crate::helpers::{fmt_timestamp, get_opt_string, parse_changed_fields, parse_datetime, parse_enum};

const RECORD_COLUMNS: &str = "id, correlation_id, action, target_type, target_id, changed_fields, \
     operator, operator_ip, request_id, channel, comment, rollback_of, created_at";

/// Insert payload for one audit record; `id` and `created_at` are assigned
/// by the database handle at persistence time.
#[derive(Debug, Clone)]
pub struct NewAuditRecord {
    pub correlation_id: String,
    pub action: AuditAction,
    pub target_type: String,
    pub target_id: String,
    pub changed_fields: BTreeMap<String, FieldChange>,
    pub operator: String,
    pub operator_ip: Option<String>,
    pub request_id: Option<String>,
    pub channel: Channel,
    pub comment: String,
    pub rollback_of: Option<String>,
}

/// Insert payload for one field-level detail row.
#[derive(Debug, Clone)]
pub struct NewFieldDetail {
    pub field_name: String,
    pub display_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Filter criteria for history queries. All fields combine with AND.
#[derive(Debug, Default, Clone)]
pub struct HistoryFilter {
    /// Internal type tag (the engine resolves the public name first).
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub action: Option<AuditAction>,
    pub operator: Option<String>,
    pub correlation_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// FTS5 match over record comments.
    pub comment_match: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

fn row_to_record(row: &libsql::Row) -> Result<AuditRecord, DatabaseError> {
    Ok(AuditRecord {
        id: row.get::<String>(0)?,
        correlation_id: row.get::<String>(1)?,
        action: parse_enum(&row.get::<String>(2)?)?,
        target_type: row.get::<String>(3)?,
        target_id: row.get::<String>(4)?,
        changed_fields: parse_changed_fields(&row.get::<String>(5)?)?,
        operator: row.get::<String>(6)?,
        operator_ip: get_opt_string(row, 7)?,
        request_id: get_opt_string(row, 8)?,
        channel: parse_enum(&row.get::<String>(9)?)?,
        comment: row.get::<String>(10)?,
        rollback_of: get_opt_string(row, 11)?,
        created_at: parse_datetime(&row.get::<String>(12)?)?,
    })
}

impl RetraceDb {
    /// Persist one audit record plus its field-detail rows in a single
    /// transaction. Assigns the record ID and a monotonic timestamp.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if any INSERT fails; nothing is persisted then.
    pub async fn insert_record(
        &self,
        record: NewAuditRecord,
        details: Vec<NewFieldDetail>,
    ) -> Result<AuditRecord, DatabaseError> {
        let mut inserted = self.insert_records(vec![(record, details)]).await?;
        inserted.pop().ok_or(DatabaseError::NoResult)
    }

    /// Batched variant of [`insert_record`](Self::insert_record): all records
    /// and details go in one transaction, in call order, each with its own
    /// monotonic timestamp.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if any INSERT fails; the transaction is rolled back.
    pub async fn insert_records(
        &self,
        batch: Vec<(NewAuditRecord, Vec<NewFieldDetail>)>,
    ) -> Result<Vec<AuditRecord>, DatabaseError> {
        // IDs come from the connection, so generate them before the
        // transaction starts.
        let mut ids = Vec::with_capacity(batch.len());
        for _ in &batch {
            ids.push(self.generate_id(PREFIX_AUDIT).await?);
        }

        let tx = self.conn().transaction().await?;
        let mut inserted = Vec::with_capacity(batch.len());

        for ((new_record, details), id) in batch.into_iter().zip(ids) {
            let created_at = self.next_timestamp();
            let changed_json = serde_json::to_string(&new_record.changed_fields)
                .map_err(|e| DatabaseError::Other(e.into()))?;

            tx.execute(
                &format!(
                    "INSERT INTO audit_records ({RECORD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                libsql::params![
                    id.as_str(),
                    new_record.correlation_id.as_str(),
                    new_record.action.as_str(),
                    new_record.target_type.as_str(),
                    new_record.target_id.as_str(),
                    changed_json.as_str(),
                    new_record.operator.as_str(),
                    new_record.operator_ip.as_deref(),
                    new_record.request_id.as_deref(),
                    new_record.channel.as_str(),
                    new_record.comment.as_str(),
                    new_record.rollback_of.as_deref(),
                    fmt_timestamp(created_at)
                ],
            )
            .await?;

            for detail in &details {
                tx.execute(
                    "INSERT INTO audit_field_details
                         (record_id, field_name, display_name, old_value, new_value)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    libsql::params![
                        id.as_str(),
                        detail.field_name.as_str(),
                        detail.display_name.as_str(),
                        detail.old_value.as_deref(),
                        detail.new_value.as_deref()
                    ],
                )
                .await?;
            }

            inserted.push(AuditRecord {
                id,
                correlation_id: new_record.correlation_id,
                action: new_record.action,
                target_type: new_record.target_type,
                target_id: new_record.target_id,
                changed_fields: new_record.changed_fields,
                operator: new_record.operator,
                operator_ip: new_record.operator_ip,
                request_id: new_record.request_id,
                channel: new_record.channel,
                comment: new_record.comment,
                rollback_of: new_record.rollback_of,
                created_at,
            });
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Fetch one record by ID.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::NoResult` if the record does not exist.
    pub async fn get_record(&self, id: &str) -> Result<AuditRecord, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM audit_records WHERE id = ?1"),
                [id],
            )
            .await?;
        let row = rows.next().await?.ok_or(DatabaseError::NoResult)?;
        row_to_record(&row)
    }

    /// Detail rows for one record, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    pub async fn details_for_record(
        &self,
        record_id: &str,
    ) -> Result<Vec<FieldAuditDetail>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT record_id, field_name, display_name, old_value, new_value
                 FROM audit_field_details WHERE record_id = ?1 ORDER BY id",
                [record_id],
            )
            .await?;

        let mut details = Vec::new();
        while let Some(row) = rows.next().await? {
            details.push(FieldAuditDetail {
                record_id: row.get::<String>(0)?,
                field_name: row.get::<String>(1)?,
                display_name: row.get::<String>(2)?,
                old_value: get_opt_string(&row, 3)?,
                new_value: get_opt_string(&row, 4)?,
            });
        }
        Ok(details)
    }

    /// All UPDATE records for a correlation id, newest first, each joined
    /// with its detail rows. This is the rollback working set.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    pub async fn update_records_for_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<(AuditRecord, Vec<FieldAuditDetail>)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM audit_records
                     WHERE correlation_id = ?1 AND action = 'update'
                     ORDER BY created_at DESC"
                ),
                [correlation_id],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(&row)?);
        }

        let mut joined = Vec::with_capacity(records.len());
        for record in records {
            let details = self.details_for_record(&record.id).await?;
            joined.push((record, details));
        }
        Ok(joined)
    }

    /// Conflict probe: does any record for `(target_type, target_id)` exist
    /// with a timestamp strictly later than `than`, outside the given
    /// correlation id?
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    pub async fn newer_record_exists(
        &self,
        target_type: &str,
        target_id: &str,
        than: DateTime<Utc>,
        excluding_correlation: &str,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM audit_records
                 WHERE target_type = ?1 AND target_id = ?2
                   AND created_at > ?3 AND correlation_id != ?4
                 LIMIT 1",
                libsql::params![
                    target_type,
                    target_id,
                    fmt_timestamp(than),
                    excluding_correlation
                ],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// The primary record a relation change merges into: the most recent
    /// record for `(correlation_id, target_type, target_id)`.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    pub async fn find_primary_record(
        &self,
        correlation_id: &str,
        target_type: &str,
        target_id: &str,
    ) -> Result<Option<AuditRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM audit_records
                     WHERE correlation_id = ?1 AND target_type = ?2 AND target_id = ?3
                     ORDER BY created_at DESC LIMIT 1"
                ),
                libsql::params![correlation_id, target_type, target_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    /// Overwrite one key of a record's `changed_fields` map in place.
    ///
    /// Used by the many-to-many merge: relation changes fold into the
    /// already-created primary record instead of producing a second one.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::NoResult` if the record does not exist.
    pub async fn set_changed_field(
        &self,
        record_id: &str,
        field_name: &str,
        change: &FieldChange,
    ) -> Result<(), DatabaseError> {
        let tx = self.conn().transaction().await?;

        let mut rows = tx
            .query(
                "SELECT changed_fields FROM audit_records WHERE id = ?1",
                [record_id],
            )
            .await?;
        let row = rows.next().await?.ok_or(DatabaseError::NoResult)?;
        let mut changed = parse_changed_fields(&row.get::<String>(0)?)?;
        changed.insert(field_name.to_string(), change.clone());

        let json =
            serde_json::to_string(&changed).map_err(|e| DatabaseError::Other(e.into()))?;
        tx.execute(
            "UPDATE audit_records SET changed_fields = ?1 WHERE id = ?2",
            libsql::params![json.as_str(), record_id],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// History query: reverse-chronological, filterable, paginated.
    ///
    /// With `comment_match` set, rows are matched through the FTS5 index
    /// first and the remaining filters apply on top.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    pub async fn query_records(
        &self,
        filter: &HistoryFilter,
    ) -> Result<Vec<AuditRecord>, DatabaseError> {
        let mut conditions = Vec::new();
        let mut params: Vec<libsql::Value> = Vec::new();

        if let Some(ref tt) = filter.target_type {
            params.push(libsql::Value::Text(tt.clone()));
            conditions.push(format!("a.target_type = ?{}", params.len()));
        }
        if let Some(ref tid) = filter.target_id {
            params.push(libsql::Value::Text(tid.clone()));
            conditions.push(format!("a.target_id = ?{}", params.len()));
        }
        if let Some(action) = filter.action {
            params.push(libsql::Value::Text(action.as_str().to_string()));
            conditions.push(format!("a.action = ?{}", params.len()));
        }
        if let Some(ref operator) = filter.operator {
            params.push(libsql::Value::Text(operator.clone()));
            conditions.push(format!("a.operator = ?{}", params.len()));
        }
        if let Some(ref cid) = filter.correlation_id {
            params.push(libsql::Value::Text(cid.clone()));
            conditions.push(format!("a.correlation_id = ?{}", params.len()));
        }
        if let Some(from) = filter.from {
            params.push(libsql::Value::Text(fmt_timestamp(from)));
            conditions.push(format!("a.created_at >= ?{}", params.len()));
        }
        if let Some(to) = filter.to {
            params.push(libsql::Value::Text(fmt_timestamp(to)));
            conditions.push(format!("a.created_at <= ?{}", params.len()));
        }

        let from_clause = if let Some(ref needle) = filter.comment_match {
            params.push(libsql::Value::Text(needle.clone()));
            conditions.push(format!("audit_records_fts MATCH ?{}", params.len()));
            "audit_records_fts JOIN audit_records a ON a.rowid = audit_records_fts.rowid"
        } else {
            "audit_records a"
        };

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let limit = filter.limit.unwrap_or(100);
        let offset = filter.offset.unwrap_or(0);
        let columns = RECORD_COLUMNS
            .split(", ")
            .map(|c| format!("a.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {columns} FROM {from_clause} {where_clause}
             ORDER BY a.created_at DESC LIMIT {limit} OFFSET {offset}"
        );

        let mut rows = self
            .conn()
            .query(&sql, libsql::params_from_iter(params))
            .await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    /// Records of a child type whose changed fields reference a parent
    /// entity: either side of `changed_fields[parent_field]` equals the
    /// parent id. Feeds the aggregated history view.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    pub async fn child_records_referencing(
        &self,
        child_type: &str,
        parent_field: &str,
        parent_id: &str,
        limit: u32,
    ) -> Result<Vec<AuditRecord>, DatabaseError> {
        // parent_field is declared at registration time, not user input;
        // it still goes through a JSON path literal, so quote it.
        let old_path = format!("$.\"{parent_field}\"[0]");
        let new_path = format!("$.\"{parent_field}\"[1]");
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM audit_records
                     WHERE target_type = ?1
                       AND (json_extract(changed_fields, ?2) = ?4
                            OR json_extract(changed_fields, ?3) = ?4)
                     ORDER BY created_at DESC LIMIT {limit}"
                ),
                libsql::params![child_type, old_path.as_str(), new_path.as_str(), parent_id],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }
}
