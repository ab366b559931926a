//! Property-based tests for list and map convergence.
//!
//! - Replaying the same ops in any order yields the same list
//! - Compaction never changes the materialized order
//! - `total_nodes` counts exactly the non-deleted insertions
//! - LWW maps converge under any application order

use cojson_crdt::{Anchor, ListCrdt, LwwMap};
use cojson_types::{OpId, SessionId, TxOrder};
use proptest::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Clone)]
enum ListOp {
    Insert(OpId, u64, Anchor, u32),
    Delete(OpId),
}

fn session(n: u8) -> SessionId {
    SessionId::parse(&format!("co_zabc_session_z{n}")).unwrap()
}

/// Turns random editing steps into the op set a set of writers would produce.
fn build_ops(steps: &[(u8, u8, usize, u64)]) -> Vec<ListOp> {
    let mut local: ListCrdt<u32> = ListCrdt::new();
    let mut counters = [0u32; 3];
    let mut ops = Vec::new();
    for (step, &(writer, kind, idx, made_at)) in steps.iter().enumerate() {
        let writer = writer % 3;
        let len = local.len();
        let op = OpId::new(session(writer), counters[writer as usize], 0);
        let list_op = match kind % 3 {
            0 => {
                let anchor = local
                    .op_at(idx % len.max(1))
                    .cloned()
                    .map_or(Anchor::Start, Anchor::After);
                ListOp::Insert(op, made_at, anchor, step as u32)
            }
            1 => {
                let anchor = local
                    .op_at(idx % len.max(1))
                    .cloned()
                    .map_or(Anchor::End, Anchor::Before);
                ListOp::Insert(op, made_at, anchor, step as u32)
            }
            _ => match local.op_at(idx % len.max(1)).cloned() {
                Some(target) => ListOp::Delete(target),
                None => continue,
            },
        };
        counters[writer as usize] += 1;
        apply(&mut local, &list_op);
        ops.push(list_op);
    }
    ops
}

fn apply(list: &mut ListCrdt<u32>, op: &ListOp) {
    match op {
        ListOp::Insert(id, made_at, anchor, value) => {
            list.insert(id.clone(), *made_at, anchor.clone(), *value);
        }
        ListOp::Delete(target) => list.delete(target),
    }
}

fn replay(ops: &[ListOp]) -> ListCrdt<u32> {
    let mut list = ListCrdt::new();
    for op in ops {
        apply(&mut list, op);
    }
    list
}

fn ops_strategy() -> impl Strategy<Value = (Vec<ListOp>, Vec<ListOp>)> {
    prop::collection::vec((0u8..3, 0u8..3, 0usize..64, 0u64..8), 1..60).prop_flat_map(|steps| {
        let ops = build_ops(&steps);
        (Just(ops.clone()), Just(ops).prop_shuffle())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn list_converges_for_any_arrival_order((ops, shuffled) in ops_strategy()) {
        prop_assert_eq!(replay(&ops).as_vec(), replay(&shuffled).as_vec());
    }

    #[test]
    fn compaction_preserves_order((ops, _) in ops_strategy()) {
        let mut list = replay(&ops);
        let before = list.as_vec();
        list.compact();
        prop_assert_eq!(list.as_vec(), before);
    }

    #[test]
    fn total_nodes_counts_live_inserts((ops, _) in ops_strategy()) {
        let list = replay(&ops);
        let deleted: HashSet<&OpId> = ops
            .iter()
            .filter_map(|op| match op {
                ListOp::Delete(target) => Some(target),
                ListOp::Insert(..) => None,
            })
            .collect();
        let live = ops
            .iter()
            .filter(|op| matches!(op, ListOp::Insert(id, ..) if !deleted.contains(id)))
            .count();
        prop_assert_eq!(list.compaction_stats().total_nodes, live);
    }

    #[test]
    fn lww_map_converges(
        writes in prop::collection::vec((0u8..3, 0u64..10, 0u8..4, any::<i32>()), 1..40),
    ) {
        let ops: Vec<(String, TxOrder, i32)> = writes
            .iter()
            .enumerate()
            .map(|(i, &(s, t, k, v))| (format!("k{k}"), TxOrder::new(t, session(s), i as u32), v))
            .collect();
        let mut forward = LwwMap::new();
        for (key, order, value) in &ops {
            forward.set(key.clone(), order.clone(), 0, *value);
        }
        let mut backward = LwwMap::new();
        for (key, order, value) in ops.iter().rev() {
            backward.set(key.clone(), order.clone(), 0, *value);
        }
        let a: Vec<(String, i32)> = forward.entries().map(|(k, v)| (k.to_string(), *v)).collect();
        let b: Vec<(String, i32)> = backward.entries().map(|(k, v)| (k.to_string(), *v)).collect();
        prop_assert_eq!(a, b);
    }
}
