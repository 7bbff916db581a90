//! The type-erased entity model the engine operates on.
//!
//! Domain code hands the engine an [`EntityState`]: a `(type_tag, id)` pair
//! plus the entity's static fields and dynamic attribute rows. Foreign
//! references to other audited entities are explicit [`EntityRef`] values,
//! never inheritance — the registry mediates how far a reference is expanded
//! when it appears inside another entity's snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// EntityRef
// ---------------------------------------------------------------------------

/// A typed reference to another entity: `(type_tag, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub type_tag: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(type_tag: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            id: id.into(),
        }
    }

    /// The string identity a reference collapses to past the expansion depth:
    /// `"tag:id"`.
    #[must_use]
    pub fn identity(&self) -> String {
        format!("{}:{}", self.type_tag, self.id)
    }
}

// ---------------------------------------------------------------------------
// FieldValue
// ---------------------------------------------------------------------------

/// A static field value: a plain JSON scalar/structure, a reference to
/// another entity, or a collection of references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Scalar(Value),
    Ref(EntityRef),
    RefList(Vec<EntityRef>),
}

impl FieldValue {
    pub fn scalar(value: impl Into<Value>) -> Self {
        Self::Scalar(value.into())
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        Self::Scalar(value)
    }
}

// ---------------------------------------------------------------------------
// DynamicAttribute
// ---------------------------------------------------------------------------

/// One user-defined attribute-value row attached to an entity.
///
/// Dynamic attributes are untyped at this layer; typed interpretation is the
/// responsibility of the registered dynamic value resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicAttribute {
    pub name: String,
    pub value: Value,
    pub display_name: String,
    /// Identifier of the attribute definition this value belongs to, if any.
    pub attribute_def: Option<String>,
}

impl DynamicAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            value: value.into(),
            attribute_def: None,
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    #[must_use]
    pub fn with_attribute_def(mut self, def: impl Into<String>) -> Self {
        self.attribute_def = Some(def.into());
        self
    }
}

// ---------------------------------------------------------------------------
// EntityState
// ---------------------------------------------------------------------------

/// The full in-memory state of one entity at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub type_tag: String,
    pub id: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub dynamic: Vec<DynamicAttribute>,
}

impl EntityState {
    pub fn new(type_tag: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            id: id.into(),
            fields: BTreeMap::new(),
            dynamic: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_dynamic(mut self, attr: DynamicAttribute) -> Self {
        self.dynamic.push(attr);
        self
    }

    /// The `(type_tag, id)` key used by operation-scoped caches and locks.
    #[must_use]
    pub fn key(&self) -> (String, String) {
        (self.type_tag.clone(), self.id.clone())
    }
}
