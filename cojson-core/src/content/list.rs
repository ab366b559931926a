use super::DecodedTx;
use crate::error::{CoreError, CoreResult};
use cojson_crdt::{Anchor, CompactionStats, ListCrdt};
use cojson_types::OpId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const START: &str = "start";
const END: &str = "end";

/// Anchor of a list change: an insertion op, or the `"start"` / `"end"` marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListRef {
    Op(OpId),
    Marker(String),
}

impl ListRef {
    pub fn start() -> Self {
        Self::Marker(START.to_string())
    }

    pub fn end() -> Self {
        Self::Marker(END.to_string())
    }

    fn after_anchor(&self) -> Option<Anchor> {
        match self {
            Self::Op(op) => Some(Anchor::After(op.clone())),
            Self::Marker(m) if m == START => Some(Anchor::Start),
            Self::Marker(_) => None,
        }
    }

    fn before_anchor(&self) -> Option<Anchor> {
        match self {
            Self::Op(op) => Some(Anchor::Before(op.clone())),
            Self::Marker(m) if m == END => Some(Anchor::End),
            Self::Marker(_) => None,
        }
    }
}

/// A single list change: append after, prepend before, or delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum ListOp {
    #[serde(rename = "app")]
    App { value: Value, after: ListRef },
    #[serde(rename = "pre")]
    Pre { value: Value, before: ListRef },
    #[serde(rename = "del")]
    Del { insertion: OpId },
}

impl ListOp {
    pub fn to_change(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Applies one parsed list change to `crdt`. Shared with plain text.
pub(crate) fn apply_list_change<T>(
    crdt: &mut ListCrdt<T>,
    tx: &DecodedTx,
    idx: usize,
    change: &Value,
    convert: impl Fn(Value) -> Option<T>,
) {
    let op = match serde_json::from_value::<ListOp>(change.clone()) {
        Ok(op) => op,
        Err(e) => {
            debug!(error = %e, "skipping malformed list change");
            return;
        }
    };
    let (anchor, value) = match op {
        ListOp::Del { insertion } => {
            crdt.delete(&insertion);
            return;
        }
        ListOp::App { value, after } => (after.after_anchor(), value),
        ListOp::Pre { value, before } => (before.before_anchor(), value),
    };
    let (Some(anchor), Some(value)) = (anchor, convert(value)) else {
        debug!("skipping list change with invalid anchor or value");
        return;
    };
    crdt.insert(tx.op_id(idx), tx.made_at(), anchor, value);
}

/// Builds `app` changes that insert `values` in order after `anchor`.
///
/// Siblings after an existing entry are visited latest first, so the changes
/// are emitted in reverse; siblings after `start` are visited in order.
pub(crate) fn append_changes(values: Vec<Value>, anchor: ListRef) -> Vec<Value> {
    let reverse = matches!(anchor, ListRef::Op(_));
    let mut changes: Vec<Value> = values
        .into_iter()
        .map(|value| {
            ListOp::App {
                value,
                after: anchor.clone(),
            }
            .to_change()
        })
        .collect();
    if reverse {
        changes.reverse();
    }
    changes
}

/// Ordered sequence content over the list CRDT.
#[derive(Debug, Clone, Default)]
pub struct CoList {
    crdt: ListCrdt<Value>,
    /// Graph size at the last compaction.
    compacted_at: usize,
}

impl CoList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn apply(&mut self, tx: &DecodedTx) {
        for (idx, change) in tx.changes.iter().enumerate() {
            apply_list_change(&mut self.crdt, tx, idx, change, Some);
        }
    }

    pub fn len(&self) -> usize {
        self.crdt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crdt.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.crdt.get(index)
    }

    pub fn as_array(&self) -> Vec<Value> {
        self.crdt.as_vec()
    }

    /// `(insertion op, value)` pairs in list order.
    pub fn entries(&self) -> Vec<(&OpId, &Value)> {
        self.crdt.entries()
    }

    pub fn compaction_stats(&self) -> CompactionStats {
        self.crdt.compaction_stats()
    }

    pub fn compact(&mut self) {
        self.crdt.compact();
        self.compacted_at = self.crdt.node_count();
    }

    /// Compacts once `interval` nodes were added since the last compaction.
    pub(crate) fn compact_if_grown(&mut self, interval: usize) -> bool {
        if self.crdt.node_count() < self.compacted_at + interval {
            return false;
        }
        self.compact();
        true
    }

    /// Spans recorded by the last compaction.
    pub fn span_count(&self) -> usize {
        self.crdt.span_count()
    }

    fn op_at(&self, index: usize) -> CoreResult<OpId> {
        self.crdt.op_at(index).cloned().ok_or(CoreError::InvalidIndex {
            index,
            len: self.len(),
        })
    }

    /// Changes appending `values` after `after` (default: the last item).
    pub fn append_changes(&self, values: Vec<Value>, after: Option<usize>) -> CoreResult<Vec<Value>> {
        let anchor = match after {
            Some(index) => ListRef::Op(self.op_at(index)?),
            None if self.is_empty() => ListRef::start(),
            None => ListRef::Op(self.op_at(self.len() - 1)?),
        };
        Ok(append_changes(values, anchor))
    }

    /// Change prepending `value` before `before` (default: the first item).
    pub fn prepend_change(&self, value: Value, before: Option<usize>) -> CoreResult<Value> {
        let anchor = match before {
            Some(index) => ListRef::Op(self.op_at(index)?),
            None if self.is_empty() => ListRef::end(),
            None => ListRef::Op(self.op_at(0)?),
        };
        Ok(ListOp::Pre {
            value,
            before: anchor,
        }
        .to_change())
    }

    pub fn delete_change(&self, index: usize) -> CoreResult<Value> {
        Ok(ListOp::Del {
            insertion: self.op_at(index)?,
        }
        .to_change())
    }

    /// Insert-after plus delete of the item at `index`.
    pub fn replace_changes(&self, index: usize, value: Value) -> CoreResult<Vec<Value>> {
        let op = self.op_at(index)?;
        Ok(vec![
            ListOp::App {
                value,
                after: ListRef::Op(op.clone()),
            }
            .to_change(),
            ListOp::Del { insertion: op }.to_change(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cojson_types::{SessionId, TxOrder};
    use serde_json::json;

    fn sid() -> SessionId {
        SessionId::parse("co_zabc_session_z1").unwrap()
    }

    fn apply(list: &mut CoList, tx_index: u32, changes: Vec<Value>) {
        list.apply(&DecodedTx {
            order: TxOrder::new(tx_index as u64, sid(), tx_index),
            changes,
            meta: None,
        });
    }

    #[test]
    fn ref_wire_forms() {
        assert_eq!(serde_json::to_value(ListRef::start()).unwrap(), json!("start"));
        let op = OpId::new(sid(), 1, 2);
        let parsed: ListRef = serde_json::from_value(serde_json::to_value(&op).unwrap()).unwrap();
        assert_eq!(parsed, ListRef::Op(op));
    }

    #[test]
    fn append_items_keeps_order_at_start_and_after_entry() {
        let mut list = CoList::new();
        let changes = list.append_changes(vec![json!(1), json!(2)], None).unwrap();
        apply(&mut list, 0, changes);
        let changes = list.append_changes(vec![json!(3), json!(4)], None).unwrap();
        apply(&mut list, 1, changes);
        assert_eq!(list.as_array(), vec![json!(1), json!(2), json!(3), json!(4)]);

        let changes = list.append_changes(vec![json!("a"), json!("b")], Some(0)).unwrap();
        apply(&mut list, 2, changes);
        assert_eq!(
            list.as_array(),
            vec![json!(1), json!("a"), json!("b"), json!(2), json!(3), json!(4)]
        );
    }

    #[test]
    fn prepend_delete_replace() {
        let mut list = CoList::new();
        let change = list.prepend_change(json!("x"), None).unwrap();
        apply(&mut list, 0, vec![change]);
        let change = list.prepend_change(json!("w"), None).unwrap();
        apply(&mut list, 1, vec![change]);
        assert_eq!(list.as_array(), vec![json!("w"), json!("x")]);

        let changes = list.replace_changes(1, json!("y")).unwrap();
        apply(&mut list, 2, changes);
        assert_eq!(list.as_array(), vec![json!("w"), json!("y")]);

        let change = list.delete_change(0).unwrap();
        apply(&mut list, 3, vec![change]);
        assert_eq!(list.as_array(), vec![json!("y")]);
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let list = CoList::new();
        assert!(matches!(
            list.delete_change(0),
            Err(CoreError::InvalidIndex { index: 0, len: 0 })
        ));
        assert!(list.append_changes(vec![json!(1)], Some(3)).is_err());
    }
}
