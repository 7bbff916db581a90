//! Shared test fixtures: a small "gadget" domain with static columns,
//! dynamic attribute rows, a tags association table and a referenced user
//! type, plus a registry wiring all engine capabilities for it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use retrace_config::AuditConfig;
use retrace_core::context::OperationContext;
use retrace_core::entities::FieldAuditDetail;
use retrace_core::entity::{DynamicAttribute, EntityRef, EntityState, FieldValue};
use retrace_core::enums::Channel;
use retrace_core::errors::CoreError;
use retrace_core::snapshot::Snapshot;
use retrace_db::RetraceDb;

use crate::recorder::AuditRecorder;
use crate::registry::{
    AuditRegistry, AuditRegistryBuilder, EntityLocker, EntityReader, EntityRestorer, M2mResolver,
    TypeAudit,
};

const GADGET_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS gadgets (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    status      TEXT NOT NULL,
    owner_id    TEXT,
    sort_order  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS gadget_attrs (
    gadget_id     TEXT NOT NULL,
    name          TEXT NOT NULL,
    value         TEXT NOT NULL,
    display_name  TEXT NOT NULL,
    PRIMARY KEY (gadget_id, name)
);

CREATE TABLE IF NOT EXISTS gadget_tags (
    gadget_id  TEXT NOT NULL,
    tag        TEXT NOT NULL,
    PRIMARY KEY (gadget_id, tag)
);

CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    email       TEXT NOT NULL,
    manager_id  TEXT
);
";

pub async fn test_db() -> Arc<RetraceDb> {
    let db = RetraceDb::open_local(":memory:").await.unwrap();
    db.conn().execute_batch(GADGET_SCHEMA).await.unwrap();
    Arc::new(db)
}

pub fn test_context(correlation_id: &str) -> OperationContext {
    OperationContext::new("alice", correlation_id)
        .with_operator_ip("10.0.0.7")
        .with_request_id("req-11112222")
        .with_channel(Channel::Web)
}

pub async fn test_recorder() -> (Arc<RetraceDb>, AuditRecorder) {
    let db = test_db().await;
    let recorder = AuditRecorder::new(Arc::clone(&db), gadget_registry(), AuditConfig::default());
    (db, recorder)
}

/// Registry with the full gadget capability set and a reader-only user type.
pub fn gadget_registry() -> Arc<AuditRegistry> {
    let gadget = TypeAudit::new("gadget", "Gadget")
        .field_aware()
        .snapshot_field("name")
        .with_noise_fields(["sort_order"])
        .with_field_resolver("secret", Arc::new(|_: &Value| json!("***")))
        .with_comment_template(Arc::new(|entity: &EntityState, action| {
            let name = entity
                .fields
                .get("name")
                .and_then(|f| match f {
                    FieldValue::Scalar(Value::String(s)) => Some(s.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| entity.id.clone());
            format!("{action} gadget {name}")
        }))
        .with_m2m_relation("tags", Arc::new(GadgetTagResolver))
        .with_reader(Arc::new(GadgetReader))
        .with_restorer(Arc::new(GadgetRestorer))
        .with_locker(Arc::new(GadgetLocker))
        .with_history_child("gadget_attr_def", "gadget_id");

    let user = TypeAudit::new("user", "User")
        .snapshot_field("name")
        .snapshot_field("manager")
        .with_reader(Arc::new(UserReader));

    Arc::new(
        AuditRegistryBuilder::new()
            .register(gadget)
            .unwrap()
            .register(user)
            .unwrap()
            .build(),
    )
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

pub async fn seed_gadget(db: &RetraceDb, id: &str, name: &str, status: &str, sort_order: i64) {
    db.conn()
        .execute(
            "INSERT INTO gadgets (id, name, status, sort_order) VALUES (?1, ?2, ?3, ?4)",
            libsql::params![id, name, status, sort_order],
        )
        .await
        .unwrap();
}

pub async fn seed_user(db: &RetraceDb, id: &str, name: &str, email: &str) {
    db.conn()
        .execute(
            "INSERT INTO users (id, name, email) VALUES (?1, ?2, ?3)",
            libsql::params![id, name, email],
        )
        .await
        .unwrap();
}

pub async fn rename_gadget(db: &RetraceDb, id: &str, name: &str) {
    db.conn()
        .execute(
            "UPDATE gadgets SET name = ?1 WHERE id = ?2",
            libsql::params![name, id],
        )
        .await
        .unwrap();
}

pub async fn set_gadget_attr(db: &RetraceDb, id: &str, name: &str, value: &str, display: &str) {
    db.conn()
        .execute(
            "INSERT OR REPLACE INTO gadget_attrs (gadget_id, name, value, display_name)
             VALUES (?1, ?2, ?3, ?4)",
            libsql::params![id, name, value, display],
        )
        .await
        .unwrap();
}

pub async fn set_tag(db: &RetraceDb, id: &str, tag: &str, present: bool) {
    let sql = if present {
        "INSERT OR IGNORE INTO gadget_tags (gadget_id, tag) VALUES (?1, ?2)"
    } else {
        "DELETE FROM gadget_tags WHERE gadget_id = ?1 AND tag = ?2"
    };
    db.conn()
        .execute(sql, libsql::params![id, tag])
        .await
        .unwrap();
}

pub async fn gadget_name(db: &RetraceDb, id: &str) -> Option<String> {
    let mut rows = db
        .conn()
        .query("SELECT name FROM gadgets WHERE id = ?1", [id])
        .await
        .unwrap();
    rows.next().await.unwrap().map(|row| row.get(0).unwrap())
}

pub async fn gadget_attr_value(db: &RetraceDb, id: &str, name: &str) -> Option<String> {
    let mut rows = db
        .conn()
        .query(
            "SELECT value FROM gadget_attrs WHERE gadget_id = ?1 AND name = ?2",
            libsql::params![id, name],
        )
        .await
        .unwrap();
    rows.next().await.unwrap().map(|row| row.get(0).unwrap())
}

/// An in-memory gadget state without touching the database.
pub fn gadget_state(id: &str, name: &str, status: &str, sort_order: i64) -> EntityState {
    EntityState::new("gadget", id)
        .with_field("name", json!(name))
        .with_field("status", json!(status))
        .with_field("sort_order", json!(sort_order))
}

pub async fn read_gadget(db: &RetraceDb, id: &str) -> Option<EntityState> {
    let mut rows = db
        .conn()
        .query(
            "SELECT id, name, status, owner_id, sort_order FROM gadgets WHERE id = ?1",
            [id],
        )
        .await
        .unwrap();
    let row = rows.next().await.unwrap()?;

    let mut state = EntityState::new("gadget", row.get::<String>(0).unwrap())
        .with_field("name", json!(row.get::<String>(1).unwrap()))
        .with_field("status", json!(row.get::<String>(2).unwrap()))
        .with_field("sort_order", json!(row.get::<i64>(4).unwrap()));
    if let Some(owner) = row.get::<Option<String>>(3).unwrap() {
        state = state.with_field("owner", FieldValue::Ref(EntityRef::new("user", owner)));
    }

    let mut attr_rows = db
        .conn()
        .query(
            "SELECT name, value, display_name FROM gadget_attrs
             WHERE gadget_id = ?1 ORDER BY name",
            [id],
        )
        .await
        .unwrap();
    while let Some(attr) = attr_rows.next().await.unwrap() {
        state = state.with_dynamic(
            DynamicAttribute::new(
                attr.get::<String>(0).unwrap(),
                json!(attr.get::<String>(1).unwrap()),
            )
            .with_display_name(attr.get::<String>(2).unwrap()),
        );
    }
    Some(state)
}

// ---------------------------------------------------------------------------
// Capability implementations
// ---------------------------------------------------------------------------

pub struct GadgetReader;

#[async_trait]
impl EntityReader for GadgetReader {
    async fn read(&self, db: &RetraceDb, id: &str) -> Result<Option<EntityState>, CoreError> {
        Ok(read_gadget(db, id).await)
    }
}

pub struct GadgetLocker;

#[async_trait]
impl EntityLocker for GadgetLocker {
    async fn lock(&self, db: &RetraceDb, id: &str) -> Result<Option<EntityState>, CoreError> {
        Ok(read_gadget(db, id).await)
    }
}

pub struct GadgetRestorer;

#[async_trait]
impl EntityRestorer for GadgetRestorer {
    async fn restore(
        &self,
        db: &RetraceDb,
        entity: &EntityState,
        snapshot: &Snapshot,
        _details: &[FieldAuditDetail],
    ) -> Result<(), CoreError> {
        if let Some(name) = snapshot.static_fields.get("name") {
            let Some(name) = name.as_str() else {
                return Err(CoreError::Validation("gadget name must be a string".into()));
            };
            if name.is_empty() {
                return Err(CoreError::Validation("gadget name must not be empty".into()));
            }
            db.conn()
                .execute(
                    "UPDATE gadgets SET name = ?1 WHERE id = ?2",
                    libsql::params![name, entity.id.as_str()],
                )
                .await
                .map_err(|e| CoreError::Other(e.into()))?;
        }
        if let Some(status) = snapshot.static_fields.get("status").and_then(Value::as_str) {
            db.conn()
                .execute(
                    "UPDATE gadgets SET status = ?1 WHERE id = ?2",
                    libsql::params![status, entity.id.as_str()],
                )
                .await
                .map_err(|e| CoreError::Other(e.into()))?;
        }
        if let Some(sort) = snapshot.static_fields.get("sort_order").and_then(Value::as_i64) {
            db.conn()
                .execute(
                    "UPDATE gadgets SET sort_order = ?1 WHERE id = ?2",
                    libsql::params![sort, entity.id.as_str()],
                )
                .await
                .map_err(|e| CoreError::Other(e.into()))?;
        }

        for (name, dynamic) in &snapshot.dynamic_fields {
            match &dynamic.value {
                Value::Null => {
                    db.conn()
                        .execute(
                            "DELETE FROM gadget_attrs WHERE gadget_id = ?1 AND name = ?2",
                            libsql::params![entity.id.as_str(), name.as_str()],
                        )
                        .await
                        .map_err(|e| CoreError::Other(e.into()))?;
                }
                value => {
                    let text = value
                        .as_str()
                        .map_or_else(|| value.to_string(), ToString::to_string);
                    db.conn()
                        .execute(
                            "INSERT OR REPLACE INTO gadget_attrs
                                 (gadget_id, name, value, display_name)
                             VALUES (?1, ?2, ?3, ?4)",
                            libsql::params![
                                entity.id.as_str(),
                                name.as_str(),
                                text,
                                dynamic.display_name.as_str()
                            ],
                        )
                        .await
                        .map_err(|e| CoreError::Other(e.into()))?;
                }
            }
        }
        Ok(())
    }
}

pub struct GadgetTagResolver;

#[async_trait]
impl M2mResolver for GadgetTagResolver {
    async fn members(&self, db: &RetraceDb, id: &str) -> Result<Vec<String>, CoreError> {
        let mut rows = db
            .conn()
            .query(
                "SELECT tag FROM gadget_tags WHERE gadget_id = ?1 ORDER BY tag",
                [id],
            )
            .await
            .map_err(|e| CoreError::Other(e.into()))?;
        let mut tags = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| CoreError::Other(e.into()))? {
            tags.push(row.get::<String>(0).map_err(|e| CoreError::Other(e.into()))?);
        }
        Ok(tags)
    }
}

pub struct UserReader;

#[async_trait]
impl EntityReader for UserReader {
    async fn read(&self, db: &RetraceDb, id: &str) -> Result<Option<EntityState>, CoreError> {
        let mut rows = db
            .conn()
            .query(
                "SELECT id, name, email, manager_id FROM users WHERE id = ?1",
                [id],
            )
            .await
            .map_err(|e| CoreError::Other(e.into()))?;
        let Some(row) = rows.next().await.map_err(|e| CoreError::Other(e.into()))? else {
            return Ok(None);
        };

        let mut state = EntityState::new("user", row.get::<String>(0).unwrap())
            .with_field("name", json!(row.get::<String>(1).unwrap()))
            .with_field("email", json!(row.get::<String>(2).unwrap()));
        if let Some(manager) = row.get::<Option<String>>(3).unwrap() {
            state = state.with_field("manager", FieldValue::Ref(EntityRef::new("user", manager)));
        }
        Ok(Some(state))
    }
}
