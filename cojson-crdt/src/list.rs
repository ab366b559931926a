//! Ordered-list CRDT over an insertion graph.
//!
//! Every insertion is a node keyed by the [`OpId`] that created it and is
//! anchored either *after* another node (or the list start) or *before*
//! another node (or the list end). Deletion only sets a tombstone flag.
//!
//! The successors and predecessors of each node are kept sorted by the total
//! order `(madeAt, sessionId, txIndex, changeIdx)`. Because sorting happens on
//! insert, the graph (and therefore the materialized order) depends only on
//! the set of ops, not on the order they arrived in.
//!
//! Materialization walks the graph depth-first:
//! - roots anchored after `start` in ascending order, then roots anchored
//!   before `end` in ascending order;
//! - at a node, its predecessors first (latest first), then the node itself,
//!   then its successors (latest first).
//!
//! Compaction records maximal linear chains as spans so that the walk can
//! emit a whole chain in one step. It never changes the materialized order.

use cojson_types::OpId;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

/// Where an insertion is anchored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Anchor {
    Start,
    End,
    After(OpId),
    Before(OpId),
}

/// Sort key of a node among its siblings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderKey {
    pub made_at: u64,
    pub op: OpId,
}

impl OrderKey {
    #[must_use]
    pub fn new(made_at: u64, op: OpId) -> Self {
        Self { made_at, op }
    }
}

#[derive(Debug, Clone)]
struct Node<T> {
    value: T,
    made_at: u64,
    deleted: bool,
    predecessors: Vec<OrderKey>,
    successors: Vec<OrderKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    After,
    Before,
}

/// Diagnostics about linear chains in the insertion graph.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompactionStats {
    /// Non-deleted insert ops.
    pub total_nodes: usize,
    /// Maximal chains of two or more nodes.
    pub linear_chains: usize,
    /// Nodes that belong to some chain.
    pub compactable_nodes: usize,
    pub max_chain_length: usize,
    pub avg_chain_length: f64,
    /// `compactable_nodes` over every node in the graph, tombstones included.
    pub compaction_ratio: f64,
}

fn insert_sorted(keys: &mut Vec<OrderKey>, key: OrderKey) {
    if let Err(pos) = keys.binary_search(&key) {
        keys.insert(pos, key);
    }
}

/// An ordered list of `T` built from insert and delete ops.
#[derive(Debug)]
pub struct ListCrdt<T> {
    nodes: HashMap<OpId, Node<T>>,
    after_start: Vec<OrderKey>,
    before_end: Vec<OrderKey>,
    /// Insertions whose anchor node has not arrived yet, keyed by anchor.
    orphans: HashMap<OpId, Vec<(Side, OrderKey)>>,
    /// Deletions whose target has not arrived yet.
    pending_deletes: HashSet<OpId>,
    /// Chain head → remaining chain members, in order.
    spans: HashMap<OpId, Vec<OpId>>,
    /// Chain member → chain head.
    span_of: HashMap<OpId, OpId>,
    cache: OnceLock<Vec<OpId>>,
}

impl<T> Default for ListCrdt<T> {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            after_start: Vec::new(),
            before_end: Vec::new(),
            orphans: HashMap::new(),
            pending_deletes: HashSet::new(),
            spans: HashMap::new(),
            span_of: HashMap::new(),
            cache: OnceLock::new(),
        }
    }
}

impl<T: Clone> Clone for ListCrdt<T> {
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            after_start: self.after_start.clone(),
            before_end: self.before_end.clone(),
            orphans: self.orphans.clone(),
            pending_deletes: self.pending_deletes.clone(),
            spans: self.spans.clone(),
            span_of: self.span_of.clone(),
            cache: OnceLock::new(),
        }
    }
}

impl<T> ListCrdt<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an insertion. Re-inserting a known op is a no-op.
    pub fn insert(&mut self, op: OpId, made_at: u64, anchor: Anchor, value: T) {
        if self.nodes.contains_key(&op) {
            return;
        }
        let key = OrderKey::new(made_at, op.clone());
        let deleted = self.pending_deletes.remove(&op);
        self.nodes.insert(
            op.clone(),
            Node {
                value,
                made_at,
                deleted,
                predecessors: Vec::new(),
                successors: Vec::new(),
            },
        );

        match anchor {
            Anchor::Start => insert_sorted(&mut self.after_start, key),
            Anchor::End => insert_sorted(&mut self.before_end, key),
            Anchor::After(target) => self.link(target, Side::After, key),
            Anchor::Before(target) => self.link(target, Side::Before, key),
        }

        if let Some(waiting) = self.orphans.remove(&op) {
            for (side, child) in waiting {
                self.link(op.clone(), side, child);
            }
        }
        self.invalidate();
    }

    pub fn insert_after(&mut self, op: OpId, made_at: u64, after: Option<OpId>, value: T) {
        let anchor = after.map_or(Anchor::Start, Anchor::After);
        self.insert(op, made_at, anchor, value);
    }

    pub fn insert_before(&mut self, op: OpId, made_at: u64, before: Option<OpId>, value: T) {
        let anchor = before.map_or(Anchor::End, Anchor::Before);
        self.insert(op, made_at, anchor, value);
    }

    /// Tombstones `target`. A deletion may arrive before its insertion.
    pub fn delete(&mut self, target: &OpId) {
        match self.nodes.get_mut(target) {
            Some(node) => {
                if !node.deleted {
                    node.deleted = true;
                    self.invalidate();
                }
            }
            None => {
                self.pending_deletes.insert(target.clone());
            }
        }
    }

    fn link(&mut self, target: OpId, side: Side, child: OrderKey) {
        self.break_span_for(&target, side);
        match self.nodes.get_mut(&target) {
            Some(node) => match side {
                Side::After => insert_sorted(&mut node.successors, child),
                Side::Before => insert_sorted(&mut node.predecessors, child),
            },
            None => self.orphans.entry(target).or_default().push((side, child)),
        }
    }

    /// Drops the span containing `target` if a new link would make it non-linear.
    fn break_span_for(&mut self, target: &OpId, side: Side) {
        let Some(head) = self.span_of.get(target).cloned() else {
            return;
        };
        let Some(rest) = self.spans.get(&head) else {
            return;
        };
        let is_head = *target == head;
        let is_tail = rest.last() == Some(target);
        let harmless = (side == Side::Before && is_head) || (side == Side::After && is_tail);
        if harmless {
            return;
        }
        if let Some(rest) = self.spans.remove(&head) {
            for member in rest {
                self.span_of.remove(&member);
            }
            self.span_of.remove(&head);
        }
    }

    fn invalidate(&mut self) {
        self.cache = OnceLock::new();
    }

    pub fn contains(&self, op: &OpId) -> bool {
        self.nodes.contains_key(op)
    }

    pub fn is_deleted(&self, op: &OpId) -> bool {
        self.nodes.get(op).is_some_and(|n| n.deleted)
    }

    /// Total number of nodes, tombstones included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Visible op ids in materialized order. Cached until the next mutation.
    pub fn order(&self) -> &[OpId] {
        self.cache.get_or_init(|| self.materialize())
    }

    pub fn len(&self) -> usize {
        self.order().len()
    }

    pub fn is_empty(&self) -> bool {
        self.order().is_empty()
    }

    /// Op id of the visible item at `index`.
    pub fn op_at(&self, index: usize) -> Option<&OpId> {
        self.order().get(index)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        let op = self.op_at(index)?;
        self.nodes.get(op).map(|n| &n.value)
    }

    /// `(op, value)` pairs in materialized order.
    pub fn entries(&self) -> Vec<(&OpId, &T)> {
        self.order()
            .iter()
            .filter_map(|op| self.nodes.get(op).map(|n| (op, &n.value)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.order()
            .iter()
            .filter_map(|op| self.nodes.get(op).map(|n| &n.value))
    }

    fn materialize(&self) -> Vec<OpId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut expanded: HashSet<OpId> = HashSet::new();
        for root in self.after_start.iter().chain(self.before_end.iter()) {
            self.fill_from(&root.op, &mut out, &mut expanded);
        }
        out
    }

    fn fill_from(&self, root: &OpId, out: &mut Vec<OpId>, expanded: &mut HashSet<OpId>) {
        let mut todo: Vec<&OpId> = vec![root];
        while let Some(&current) = todo.last() {
            let Some(node) = self.nodes.get(current) else {
                todo.pop();
                continue;
            };
            if !node.predecessors.is_empty() && !expanded.contains(current) {
                expanded.insert(current.clone());
                todo.extend(node.predecessors.iter().map(|k| &k.op));
                continue;
            }
            todo.pop();
            if !node.deleted {
                out.push(current.clone());
            }
            let last = match self.spans.get(current) {
                Some(rest) => {
                    for member in rest {
                        if self.nodes.get(member).is_some_and(|n| !n.deleted) {
                            out.push(member.clone());
                        }
                    }
                    rest.last().and_then(|op| self.nodes.get(op)).unwrap_or(node)
                }
                None => node,
            };
            todo.extend(last.successors.iter().map(|k| &k.op));
        }
    }

    /// Finds maximal linear chains: each link's only successor is a later op
    /// of the same session which has no predecessors of its own.
    fn linear_chains(&self) -> Vec<Vec<OpId>> {
        let next_in_chain = |op: &OpId| -> Option<&OpId> {
            let node = self.nodes.get(op)?;
            let [only] = node.successors.as_slice() else {
                return None;
            };
            let next = self.nodes.get(&only.op)?;
            let same_writer = only.op.session_id == op.session_id
                && (only.op.tx_index, only.op.change_idx) > (op.tx_index, op.change_idx);
            (same_writer && next.predecessors.is_empty()).then_some(&only.op)
        };

        let mut has_chain_parent: HashSet<&OpId> = HashSet::new();
        for op in self.nodes.keys() {
            if let Some(next) = next_in_chain(op) {
                has_chain_parent.insert(next);
            }
        }

        let mut chains = Vec::new();
        for op in self.nodes.keys() {
            if has_chain_parent.contains(op) {
                continue;
            }
            let mut chain = vec![op.clone()];
            let mut cursor = op;
            while let Some(next) = next_in_chain(cursor) {
                chain.push(next.clone());
                cursor = next;
            }
            if chain.len() > 1 {
                chains.push(chain);
            }
        }
        chains
    }

    /// Records every linear chain as a span. Does not change [`order`](Self::order).
    pub fn compact(&mut self) {
        self.spans.clear();
        self.span_of.clear();
        for chain in self.linear_chains() {
            let mut members = chain.into_iter();
            let Some(head) = members.next() else {
                continue;
            };
            let rest: Vec<OpId> = members.collect();
            for member in &rest {
                self.span_of.insert(member.clone(), head.clone());
            }
            self.span_of.insert(head.clone(), head.clone());
            self.spans.insert(head, rest);
        }
        self.invalidate();
    }

    /// Number of spans currently recorded by [`compact`](Self::compact).
    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    pub fn compaction_stats(&self) -> CompactionStats {
        let chains = self.linear_chains();
        let total_nodes = self.nodes.values().filter(|n| !n.deleted).count();
        let compactable_nodes: usize = chains.iter().map(Vec::len).sum();
        let max_chain_length = chains.iter().map(Vec::len).max().unwrap_or(0);
        let avg_chain_length = if chains.is_empty() {
            0.0
        } else {
            compactable_nodes as f64 / chains.len() as f64
        };
        let compaction_ratio = if self.nodes.is_empty() {
            0.0
        } else {
            compactable_nodes as f64 / self.nodes.len() as f64
        };
        CompactionStats {
            total_nodes,
            linear_chains: chains.len(),
            compactable_nodes,
            max_chain_length,
            avg_chain_length,
            compaction_ratio,
        }
    }

    /// Creation time of `op`, if known.
    pub fn made_at(&self, op: &OpId) -> Option<u64> {
        self.nodes.get(op).map(|n| n.made_at)
    }
}

impl<T: Clone> ListCrdt<T> {
    /// Visible values in materialized order.
    pub fn as_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}
