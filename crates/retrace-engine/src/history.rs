//! The external history read API.
//!
//! Callers query by the registry's public type names, never internal tags;
//! returned records carry the public name too. Page sizes come from the
//! audit configuration, with a hard cap regardless of what was requested.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use retrace_config::AuditConfig;
use retrace_core::entities::AuditRecord;
use retrace_core::enums::AuditAction;
use retrace_db::RetraceDb;
use retrace_db::repos::records::HistoryFilter;

use crate::error::EngineError;
use crate::registry::AuditRegistry;

/// Filter criteria for a history query, expressed in public type names.
#[derive(Debug, Default, Clone)]
pub struct HistoryQuery {
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub action: Option<AuditAction>,
    pub operator: Option<String>,
    pub correlation_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Free-text match over record comments.
    pub comment_match: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub struct HistoryService {
    db: Arc<RetraceDb>,
    registry: Arc<AuditRegistry>,
    config: AuditConfig,
}

impl HistoryService {
    pub fn new(db: Arc<RetraceDb>, registry: Arc<AuditRegistry>, config: AuditConfig) -> Self {
        Self {
            db,
            registry,
            config,
        }
    }

    /// Paginated, reverse-chronological history query.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::UnknownPublicName` when `target_type` names no
    /// registered type, or `EngineError::Database` on query failure.
    pub async fn query(&self, query: &HistoryQuery) -> Result<Vec<AuditRecord>, EngineError> {
        let target_type = match &query.target_type {
            Some(public_name) => Some(self.resolve_tag(public_name)?.to_string()),
            None => None,
        };

        let filter = HistoryFilter {
            target_type,
            target_id: query.target_id.clone(),
            action: query.action,
            operator: query.operator.clone(),
            correlation_id: query.correlation_id.clone(),
            from: query.from,
            to: query.to,
            comment_match: query.comment_match.clone(),
            limit: Some(self.config.effective_limit(query.limit)),
            offset: query.offset,
        };

        let mut records = self.db.query_records(&filter).await?;
        for record in &mut records {
            self.publicize(record);
        }
        Ok(records)
    }

    /// One entity's own history, optionally aggregated with records of its
    /// declared child types that reference it.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::UnknownPublicName` when `public_name` names no
    /// registered type, or `EngineError::Database` on query failure.
    pub async fn entity_history(
        &self,
        public_name: &str,
        target_id: &str,
        include_children: bool,
    ) -> Result<Vec<AuditRecord>, EngineError> {
        let tag = self.resolve_tag(public_name)?.to_string();

        let mut records = self
            .db
            .query_records(&HistoryFilter {
                target_type: Some(tag.clone()),
                target_id: Some(target_id.to_string()),
                limit: Some(self.config.history_limit),
                ..Default::default()
            })
            .await?;

        if include_children {
            if let Some(config) = self.registry.get(&tag) {
                for child in &config.history_children {
                    let child_records = self
                        .db
                        .child_records_referencing(
                            &child.child_type,
                            &child.parent_field,
                            target_id,
                            self.config.child_history_limit,
                        )
                        .await?;
                    records.extend(child_records);
                }
            }
            records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }

        for record in &mut records {
            self.publicize(record);
        }
        Ok(records)
    }

    fn resolve_tag(&self, public_name: &str) -> Result<&str, EngineError> {
        self.registry
            .resolve_by_public_name(public_name)
            .ok_or_else(|| EngineError::UnknownPublicName(public_name.to_string()))
    }

    fn publicize(&self, record: &mut AuditRecord) {
        if let Some(public) = self.registry.resolve_to_public_name(&record.target_type) {
            record.target_type = public.to_string();
        }
    }
}
