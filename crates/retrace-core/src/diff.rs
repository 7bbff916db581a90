//! The pure before/after diff engine.
//!
//! Operates on two [`Snapshot`]s and produces a [`ChangeSet`]: per-field
//! `[old, new]` pairs for static fields and named change entries for dynamic
//! attributes. Creation and deletion are special-cased (`[null, v]` /
//! `[v, null]`). The engine itself is persistence-free; the recorder decides
//! what to do with an empty or noise-only change set.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snapshot::{DynamicValue, Snapshot};

/// Transforms a raw value into its comparable/recordable form (e.g. resolve
/// a foreign key id to a label, decrypt a secret before comparison).
pub type ValueResolver = dyn Fn(&Value) -> Value + Send + Sync;

// ---------------------------------------------------------------------------
// FieldChange
// ---------------------------------------------------------------------------

/// An `[old, new]` value pair for one static field.
///
/// Serializes as a two-element JSON array, which is the wire/storage format
/// of the `changed_fields` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(Value, Value)", into = "(Value, Value)")]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

impl FieldChange {
    #[must_use]
    pub const fn new(old: Value, new: Value) -> Self {
        Self { old, new }
    }
}

impl From<(Value, Value)> for FieldChange {
    fn from((old, new): (Value, Value)) -> Self {
        Self { old, new }
    }
}

impl From<FieldChange> for (Value, Value) {
    fn from(change: FieldChange) -> Self {
        (change.old, change.new)
    }
}

// ---------------------------------------------------------------------------
// DynamicChange
// ---------------------------------------------------------------------------

/// A change to one named dynamic attribute.
///
/// Values are already resolver-applied. `old`/`new` are `Value::Null` on the
/// creation/deletion side respectively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicChange {
    pub name: String,
    pub display_name: String,
    pub old: Value,
    pub new: Value,
}

// ---------------------------------------------------------------------------
// ChangeSet
// ---------------------------------------------------------------------------

/// The computed difference between two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub static_changes: BTreeMap<String, FieldChange>,
    pub dynamic_changes: Vec<DynamicChange>,
}

impl ChangeSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.static_changes.is_empty() && self.dynamic_changes.is_empty()
    }

    /// Whether the change set touches *only* fields that a type declared
    /// ignorable when taken alone (e.g. an internal sort order).
    ///
    /// Returns `false` for an empty change set — emptiness is handled
    /// separately — and `false` whenever any dynamic attribute changed.
    #[must_use]
    pub fn is_noise_only(&self, noise_field_sets: &[BTreeSet<String>]) -> bool {
        if self.is_empty() || !self.dynamic_changes.is_empty() {
            return false;
        }
        let changed: BTreeSet<&str> = self.static_changes.keys().map(String::as_str).collect();
        noise_field_sets
            .iter()
            .any(|set| changed.iter().all(|f| set.contains(*f)))
    }
}

// ---------------------------------------------------------------------------
// Diff operations
// ---------------------------------------------------------------------------

/// Diff two snapshots into a change set.
///
/// Static fields: union of keys from both sides; a key missing on one side
/// compares as `Value::Null`. Dynamic attributes: union of names; the
/// resolver (when given) is applied to both sides before comparison, and the
/// display name prefers the new side, falling back to the old.
#[must_use]
pub fn diff_snapshots(
    old: &Snapshot,
    new: &Snapshot,
    resolver: Option<&ValueResolver>,
) -> ChangeSet {
    ChangeSet {
        static_changes: diff_static(&old.static_fields, &new.static_fields),
        dynamic_changes: diff_dynamic(&old.dynamic_fields, &new.dynamic_fields, resolver),
    }
}

/// The creation special case: every present field becomes `[null, v]`.
#[must_use]
pub fn creation_changes(after: &Snapshot, resolver: Option<&ValueResolver>) -> ChangeSet {
    diff_snapshots(&Snapshot::empty(), after, resolver)
}

/// The deletion special case: every present field becomes `[v, null]`.
#[must_use]
pub fn deletion_changes(before: &Snapshot, resolver: Option<&ValueResolver>) -> ChangeSet {
    diff_snapshots(before, &Snapshot::empty(), resolver)
}

fn diff_static(
    old: &BTreeMap<String, Value>,
    new: &BTreeMap<String, Value>,
) -> BTreeMap<String, FieldChange> {
    let mut keys: BTreeSet<&String> = old.keys().collect();
    keys.extend(new.keys());

    let mut changes = BTreeMap::new();
    for key in keys {
        let old_value = old.get(key).cloned().unwrap_or(Value::Null);
        let new_value = new.get(key).cloned().unwrap_or(Value::Null);
        if old_value != new_value {
            changes.insert(key.clone(), FieldChange::new(old_value, new_value));
        }
    }
    changes
}

fn diff_dynamic(
    old: &BTreeMap<String, DynamicValue>,
    new: &BTreeMap<String, DynamicValue>,
    resolver: Option<&ValueResolver>,
) -> Vec<DynamicChange> {
    let resolve = |value: &Value| -> Value {
        match resolver {
            Some(f) if !value.is_null() => f(value),
            _ => value.clone(),
        }
    };

    let mut names: BTreeSet<&String> = old.keys().collect();
    names.extend(new.keys());

    let mut changes = Vec::new();
    for name in names {
        let old_raw = old.get(name).map(|d| d.value.clone()).unwrap_or(Value::Null);
        let new_raw = new.get(name).map(|d| d.value.clone()).unwrap_or(Value::Null);
        if old_raw == new_raw {
            continue;
        }
        let display_name = new
            .get(name)
            .or_else(|| old.get(name))
            .map_or_else(|| name.clone(), |d| d.display_name.clone());
        changes.push(DynamicChange {
            name: name.clone(),
            display_name,
            old: resolve(&old_raw),
            new: resolve(&new_raw),
        });
    }
    changes
}
