//! Snapshot capture.
//!
//! Turns an [`EntityState`] into a normalized, comparable [`Snapshot`]:
//! ignored fields skipped, per-field resolvers applied, references to other
//! registered entities expanded exactly one level (restricted to the
//! referenced type's `snapshot_fields` plus identity). Past that depth, and
//! for unregistered types, a reference serializes to its `"tag:id"` identity
//! string, which guarantees termination on cyclic reference graphs.

use std::collections::BTreeMap;

use serde_json::Value;

use retrace_core::entity::{EntityRef, EntityState, FieldValue};
use retrace_core::snapshot::{DynamicValue, Snapshot};
use retrace_db::RetraceDb;

use crate::error::EngineError;
use crate::registry::AuditRegistry;

/// Capture both halves of an entity's snapshot.
///
/// # Errors
///
/// Returns `EngineError` if a referenced entity's reader fails.
pub async fn snapshot_entity(
    registry: &AuditRegistry,
    db: &RetraceDb,
    entity: &EntityState,
) -> Result<Snapshot, EngineError> {
    Ok(Snapshot {
        static_fields: static_snapshot(registry, db, entity).await?,
        dynamic_fields: dynamic_snapshot(registry, entity),
    })
}

/// Capture the static half: every field not in `ignored_fields`, resolver
/// applied when configured, references expanded one level.
///
/// # Errors
///
/// Returns `EngineError` if a referenced entity's reader fails.
pub async fn static_snapshot(
    registry: &AuditRegistry,
    db: &RetraceDb,
    entity: &EntityState,
) -> Result<BTreeMap<String, Value>, EngineError> {
    let config = registry.config_or_default(&entity.type_tag);

    let mut fields = BTreeMap::new();
    for (name, value) in &entity.fields {
        if config.ignored_fields.contains(name) {
            continue;
        }
        let snapped = if let Some(resolver) = config.field_resolvers.get(name) {
            resolver(&raw_value(value))
        } else {
            value_snapshot(registry, db, value).await?
        };
        fields.insert(name.clone(), snapped);
    }
    Ok(fields)
}

/// Capture the dynamic half: only when the type is field aware.
#[must_use]
pub fn dynamic_snapshot(
    registry: &AuditRegistry,
    entity: &EntityState,
) -> BTreeMap<String, DynamicValue> {
    let config = registry.config_or_default(&entity.type_tag);
    if !config.field_aware {
        return BTreeMap::new();
    }
    entity
        .dynamic
        .iter()
        .map(|attr| {
            (
                attr.name.clone(),
                DynamicValue {
                    value: attr.value.clone(),
                    display_name: attr.display_name.clone(),
                    attribute_def: attr.attribute_def.clone(),
                },
            )
        })
        .collect()
}

/// Read the current persisted state of an entity through its registered
/// reader and snapshot it. `None` when the type has no reader or the entity
/// does not exist.
///
/// # Errors
///
/// Returns `EngineError` if the reader or a nested expansion fails.
pub async fn read_current(
    registry: &AuditRegistry,
    db: &RetraceDb,
    type_tag: &str,
    id: &str,
) -> Result<Option<(EntityState, Snapshot)>, EngineError> {
    let Some(config) = registry.get(type_tag) else {
        return Ok(None);
    };
    let Some(reader) = &config.reader else {
        return Ok(None);
    };
    match reader.read(db, id).await? {
        Some(state) => {
            let snapshot = snapshot_entity(registry, db, &state).await?;
            Ok(Some((state, snapshot)))
        }
        None => Ok(None),
    }
}

/// The unexpanded form of a field value: scalars as-is, references as their
/// identity string. This is what field resolvers receive and what nested
/// references collapse to.
fn raw_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Scalar(v) => v.clone(),
        FieldValue::Ref(r) => Value::String(r.identity()),
        FieldValue::RefList(list) => {
            Value::Array(list.iter().map(|r| Value::String(r.identity())).collect())
        }
    }
}

async fn value_snapshot(
    registry: &AuditRegistry,
    db: &RetraceDb,
    value: &FieldValue,
) -> Result<Value, EngineError> {
    match value {
        FieldValue::Scalar(v) => Ok(v.clone()),
        FieldValue::Ref(r) => expand_ref(registry, db, r).await,
        FieldValue::RefList(list) => {
            let mut expanded = Vec::with_capacity(list.len());
            for r in list {
                expanded.push(expand_ref(registry, db, r).await?);
            }
            Ok(Value::Array(expanded))
        }
    }
}

/// One level of reference expansion. Emits the referenced type's
/// `snapshot_fields` plus identity; anything nested one level deeper
/// collapses to an identity string.
async fn expand_ref(
    registry: &AuditRegistry,
    db: &RetraceDb,
    entity_ref: &EntityRef,
) -> Result<Value, EngineError> {
    let identity = Value::String(entity_ref.identity());

    let Some(config) = registry.get(&entity_ref.type_tag) else {
        return Ok(identity);
    };
    let Some(reader) = &config.reader else {
        return Ok(identity);
    };
    let Some(state) = reader.read(db, &entity_ref.id).await? else {
        return Ok(identity);
    };

    let mut expanded = serde_json::Map::new();
    expanded.insert("id".to_string(), Value::String(state.id.clone()));
    for (name, value) in &state.fields {
        if config.snapshot_fields.contains(name) {
            expanded.insert(name.clone(), raw_value(value));
        }
    }
    Ok(Value::Object(expanded))
}
