//! Metric mutation engine.
//!
//! Resources describe metric changes as small mutation objects attached to
//! their log records. The store folds them, in emission order, into a
//! materialized collection per metric name. [`apply`] is the pure fold step.
//!
//! A single mutation may carry several operation kinds. They always run in
//! the fixed order remove, insert, upsert, patch, so removal and addition
//! never observe a half-updated collection from the same mutation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A JSON-like record with insertion-ordered fields.
pub type Record = Map<String, Value>;

/// Default identity field.
pub const DEFAULT_INDEX: &str = "id";

fn default_index() -> String {
    DEFAULT_INDEX.to_string()
}

/// One operation kind carried by a [`MetricMutation`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MutationOp<'a> {
    /// Delete every record whose key is in the list.
    Remove(&'a [Value]),
    /// Append records verbatim, no key check.
    Insert(&'a [Record]),
    /// Merge into the first record with the same key, else append.
    Upsert(&'a [Record]),
    /// Merge into the first record with the same key, else discard.
    Patch(&'a [Record]),
}

/// A set of operations against one metric collection.
///
/// Serialized as `{"index": "id", "remove": [...], "insert": [...], ...}`;
/// `metricKey` is accepted as an alias for `index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricMutation {
    /// Name of the identity field.
    #[serde(default = "default_index", alias = "metricKey")]
    pub index: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insert: Vec<Record>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upsert: Vec<Record>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patch: Vec<Record>,
}

impl Default for MetricMutation {
    fn default() -> Self {
        Self {
            index: default_index(),
            remove: Vec::new(),
            insert: Vec::new(),
            upsert: Vec::new(),
            patch: Vec::new(),
        }
    }
}

impl MetricMutation {

    /// Mutation that removes records by key.
    #[must_use]
    pub fn remove(keys: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        Self::default().with_remove(keys)
    }

    /// Mutation that appends records.
    #[must_use]
    pub fn insert(records: impl IntoIterator<Item = Record>) -> Self {
        Self::default().with_insert(records)
    }

    /// Mutation that inserts or merges records by key.
    #[must_use]
    pub fn upsert(records: impl IntoIterator<Item = Record>) -> Self {
        Self::default().with_upsert(records)
    }

    /// Mutation that merges into existing records only.
    #[must_use]
    pub fn patch(records: impl IntoIterator<Item = Record>) -> Self {
        Self::default().with_patch(records)
    }

    /// Use a different identity field.
    #[must_use]
    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = index.into();
        self
    }

    #[must_use]
    pub fn with_remove(mut self, keys: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        self.remove.extend(keys.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_insert(mut self, records: impl IntoIterator<Item = Record>) -> Self {
        self.insert.extend(records);
        self
    }

    #[must_use]
    pub fn with_upsert(mut self, records: impl IntoIterator<Item = Record>) -> Self {
        self.upsert.extend(records);
        self
    }

    #[must_use]
    pub fn with_patch(mut self, records: impl IntoIterator<Item = Record>) -> Self {
        self.patch.extend(records);
        self
    }

    /// The present operations, in application order.
    pub fn ops(&self) -> impl Iterator<Item = MutationOp<'_>> {
        [
            (!self.remove.is_empty()).then_some(MutationOp::Remove(&self.remove)),
            (!self.insert.is_empty()).then_some(MutationOp::Insert(&self.insert)),
            (!self.upsert.is_empty()).then_some(MutationOp::Upsert(&self.upsert)),
            (!self.patch.is_empty()).then_some(MutationOp::Patch(&self.patch)),
        ]
        .into_iter()
        .flatten()
    }

    /// Whether the mutation carries no operation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops().next().is_none()
    }
}

/// Fold `mutation` into a copy of `current`.
#[must_use]
pub fn apply(current: &[Record], mutation: &MetricMutation) -> Vec<Record> {
    let mut records = current.to_vec();
    apply_in_place(&mut records, mutation);
    records
}

/// Fold `mutation` into `records`.
///
/// Never fails: a record without the key field, or with a key of another
/// JSON type, is simply a miss.
pub fn apply_in_place(records: &mut Vec<Record>, mutation: &MetricMutation) {
    let index = mutation.index.as_str();

    for op in mutation.ops() {
        match op {
            MutationOp::Remove(keys) => {
                records.retain(|record| !record.get(index).is_some_and(|key| keys.contains(key)));
            }
            MutationOp::Insert(new) => records.extend(new.iter().cloned()),
            MutationOp::Upsert(changes) => {
                for change in changes {
                    match position(records, index, change) {
                        Some(at) => merge(&mut records[at], change),
                        None => records.push(change.clone()),
                    }
                }
            }
            MutationOp::Patch(changes) => {
                for change in changes {
                    if let Some(at) = position(records, index, change) {
                        merge(&mut records[at], change);
                    }
                }
            }
        }
    }
}

/// First record whose key equals the key of `change`.
fn position(records: &[Record], index: &str, change: &Record) -> Option<usize> {
    let key = change.get(index)?;
    records.iter().position(|record| record.get(index) == Some(key))
}

/// Shallow merge; existing fields keep their position.
fn merge(target: &mut Record, change: &Record) {
    for (field, value) in change {
        target.insert(field.clone(), value.clone());
    }
}
