use super::DecodedTx;
use cojson_crdt::{LwwMap, LwwOp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// A single map change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum MapOp {
    Set { key: String, value: Value },
    Del { key: String },
}

impl MapOp {
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        Self::Set {
            key: key.into(),
            value,
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self::Del { key: key.into() }
    }

    pub fn to_change(&self) -> Value {
        // a tagged enum of strings and values always serializes
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Key-value content with last-writer-wins per key.
#[derive(Debug, Clone, Default)]
pub struct CoMap {
    ops: LwwMap<Value>,
}

impl CoMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn apply(&mut self, tx: &DecodedTx) {
        for (idx, change) in tx.changes.iter().enumerate() {
            match serde_json::from_value::<MapOp>(change.clone()) {
                Ok(MapOp::Set { key, value }) => {
                    self.ops.set(key, tx.order.clone(), idx as u32, value);
                }
                Ok(MapOp::Del { key }) => self.ops.delete(key, tx.order.clone(), idx as u32),
                Err(e) => debug!(error = %e, "skipping malformed map change"),
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.ops.get(key)
    }

    /// Value of `key` as of `time` (milliseconds, inclusive).
    pub fn get_at(&self, key: &str, time: u64) -> Option<&Value> {
        self.ops.get_at(key, time)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.ops.keys()
    }

    pub fn history(&self, key: &str) -> &[LwwOp<Value>] {
        self.ops.history(key)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn as_object(&self) -> Map<String, Value> {
        self.ops
            .entries()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    /// Snapshot of the map as it was at `time`.
    pub fn as_object_at(&self, time: u64) -> Map<String, Value> {
        self.ops
            .all_keys()
            .filter_map(|key| Some((key.to_string(), self.ops.get_at(key, time)?.clone())))
            .collect()
    }
}
