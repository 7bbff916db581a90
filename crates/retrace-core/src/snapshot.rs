//! Point-in-time entity snapshots.
//!
//! A [`Snapshot`] is the normalized, comparable representation of an entity:
//! static fields already passed through their value resolvers and reference
//! expansion, dynamic attributes captured as `{value, display_name,
//! attribute_def}`. Snapshots are transient — they exist to be diffed and
//! are discarded afterwards, never persisted as their own entity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A captured dynamic attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicValue {
    pub value: Value,
    pub display_name: String,
    pub attribute_def: Option<String>,
}

impl DynamicValue {
    pub fn new(value: impl Into<Value>, display_name: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            display_name: display_name.into(),
            attribute_def: None,
        }
    }
}

/// Normalized point-in-time capture of an entity's comparable state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub static_fields: BTreeMap<String, Value>,
    pub dynamic_fields: BTreeMap<String, DynamicValue>,
}

impl Snapshot {
    /// The empty snapshot — the "before" of a create, the "after" of a delete.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.static_fields.is_empty() && self.dynamic_fields.is_empty()
    }
}
