use super::DecodedTx;
use super::list::{ListOp, ListRef, append_changes, apply_list_change};
use crate::error::{CoreError, CoreResult};
use cojson_crdt::{CompactionStats, ListCrdt};
use cojson_types::OpId;
use serde_json::Value;
use std::fmt;

/// Collaborative text: a list CRDT with one node per character.
#[derive(Debug, Clone, Default)]
pub struct CoPlainText {
    chars: ListCrdt<String>,
    compacted_at: usize,
}

impl CoPlainText {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn apply(&mut self, tx: &DecodedTx) {
        for (idx, change) in tx.changes.iter().enumerate() {
            apply_list_change(&mut self.chars, tx, idx, change, |value| match value {
                Value::String(s) => Some(s),
                _ => None,
            });
        }
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn compaction_stats(&self) -> CompactionStats {
        self.chars.compaction_stats()
    }

    pub fn compact(&mut self) {
        self.chars.compact();
        self.compacted_at = self.chars.node_count();
    }

    pub(crate) fn compact_if_grown(&mut self, interval: usize) -> bool {
        if self.chars.node_count() < self.compacted_at + interval {
            return false;
        }
        self.compact();
        true
    }

    pub fn span_count(&self) -> usize {
        self.chars.span_count()
    }

    fn op_at(&self, index: usize) -> CoreResult<OpId> {
        self.chars.op_at(index).cloned().ok_or(CoreError::InvalidIndex {
            index,
            len: self.len(),
        })
    }

    /// Changes inserting `text` after the character at `after`, or at the
    /// very beginning when `after` is `None`.
    pub fn insert_after_changes(&self, after: Option<usize>, text: &str) -> CoreResult<Vec<Value>> {
        let chars: Vec<Value> = text.chars().map(|c| Value::String(c.to_string())).collect();
        match after {
            Some(index) => Ok(append_changes(chars, ListRef::Op(self.op_at(index)?))),
            None if self.is_empty() => Ok(append_changes(chars, ListRef::start())),
            None => {
                let first = self.op_at(0)?;
                let mut changes: Vec<Value> = chars
                    .into_iter()
                    .map(|value| {
                        ListOp::Pre {
                            value,
                            before: ListRef::Op(first.clone()),
                        }
                        .to_change()
                    })
                    .collect();
                // predecessors are visited latest first
                changes.reverse();
                Ok(changes)
            }
        }
    }

    /// Changes deleting characters in `[from, to)`.
    pub fn delete_range_changes(&self, from: usize, to: usize) -> CoreResult<Vec<Value>> {
        if from > to || to > self.len() {
            return Err(CoreError::InvalidIndex {
                index: to,
                len: self.len(),
            });
        }
        (from..to)
            .map(|index| {
                Ok(ListOp::Del {
                    insertion: self.op_at(index)?,
                }
                .to_change())
            })
            .collect()
    }
}

impl fmt::Display for CoPlainText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.chars.iter() {
            f.write_str(c)?;
        }
        Ok(())
    }
}
