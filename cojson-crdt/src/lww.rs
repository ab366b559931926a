//! Last-writer-wins map over a sorted op log.
//!
//! Each key keeps every op ever applied to it, sorted by [`TxOrder`] and
//! change index. The current value is the last op; older ops stay around for
//! time travel (`get_at`) and history. Applying the same set of ops in any
//! order yields the same log.

use cojson_types::TxOrder;
use std::collections::BTreeMap;

/// One write to a key. `value == None` is a deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct LwwOp<V> {
    pub order: TxOrder,
    pub change_idx: u32,
    pub value: Option<V>,
}

impl<V> LwwOp<V> {
    fn sort_key(&self) -> (&TxOrder, u32) {
        (&self.order, self.change_idx)
    }

    pub fn made_at(&self) -> u64 {
        self.order.made_at
    }
}

#[derive(Debug, Clone)]
pub struct LwwMap<V> {
    ops: BTreeMap<String, Vec<LwwOp<V>>>,
}

impl<V> Default for LwwMap<V> {
    fn default() -> Self {
        Self {
            ops: BTreeMap::new(),
        }
    }
}

impl<V> LwwMap<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, order: TxOrder, change_idx: u32, value: V) {
        self.apply(key.into(), order, change_idx, Some(value));
    }

    pub fn delete(&mut self, key: impl Into<String>, order: TxOrder, change_idx: u32) {
        self.apply(key.into(), order, change_idx, None);
    }

    fn apply(&mut self, key: String, order: TxOrder, change_idx: u32, value: Option<V>) {
        let log = self.ops.entry(key).or_default();
        let op = LwwOp {
            order,
            change_idx,
            value,
        };
        if let Err(pos) = log.binary_search_by(|probe| probe.sort_key().cmp(&op.sort_key())) {
            log.insert(pos, op);
        }
    }

    /// Latest op for `key`, deletions included.
    pub fn latest(&self, key: &str) -> Option<&LwwOp<V>> {
        self.ops.get(key)?.last()
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.latest(key)?.value.as_ref()
    }

    /// Value of `key` as of `time` (inclusive).
    pub fn get_at(&self, key: &str, time: u64) -> Option<&V> {
        self.ops
            .get(key)?
            .iter()
            .rev()
            .find(|op| op.order.made_at <= time)?
            .value
            .as_ref()
    }

    /// Every op applied to `key`, oldest first.
    pub fn history(&self, key: &str) -> &[LwwOp<V>] {
        self.ops.get(key).map_or(&[], Vec::as_slice)
    }

    /// Keys whose latest op is a set.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.ops
            .iter()
            .filter(|(_, log)| log.last().is_some_and(|op| op.value.is_some()))
            .map(|(key, _)| key.as_str())
    }

    /// Every key ever written, deleted or not.
    pub fn all_keys(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }

    /// `(key, value)` for every live key, in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &V)> {
        self.ops.iter().filter_map(|(key, log)| {
            log.last()
                .and_then(|op| op.value.as_ref())
                .map(|value| (key.as_str(), value))
        })
    }

    pub fn len(&self) -> usize {
        self.keys().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cojson_types::SessionId;

    fn order(made_at: u64, s: u8) -> TxOrder {
        let session = SessionId::parse(&format!("co_zabc_session_z{s}")).unwrap();
        TxOrder::new(made_at, session, 0)
    }

    #[test]
    fn later_write_wins() {
        let mut map = LwwMap::new();
        map.set("k", order(2, 1), 0, "new");
        map.set("k", order(1, 2), 0, "old");
        assert_eq!(map.get("k"), Some(&"new"));
    }

    #[test]
    fn same_time_breaks_tie_by_session() {
        let mut map = LwwMap::new();
        map.set("k", order(1, 2), 0, "two");
        map.set("k", order(1, 1), 0, "one");
        assert_eq!(map.get("k"), Some(&"two"));
    }

    #[test]
    fn delete_hides_key_but_keeps_history() {
        let mut map = LwwMap::new();
        map.set("k", order(1, 1), 0, 1);
        map.delete("k", order(2, 1), 0);
        assert_eq!(map.get("k"), None);
        assert_eq!(map.keys().count(), 0);
        assert_eq!(map.history("k").len(), 2);
        assert_eq!(map.get_at("k", 1), Some(&1));
    }

    #[test]
    fn duplicate_op_is_ignored() {
        let mut map = LwwMap::new();
        map.set("k", order(1, 1), 0, 1);
        map.set("k", order(1, 1), 0, 1);
        assert_eq!(map.history("k").len(), 1);
    }

    #[test]
    fn get_at_before_first_write_is_none() {
        let mut map = LwwMap::new();
        map.set("k", order(5, 1), 0, 1);
        assert_eq!(map.get_at("k", 4), None);
    }
}
