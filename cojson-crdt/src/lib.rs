//! CRDTs used by cojson content reducers.
//!
//! - [`ListCrdt<T>`]: ordered list over an insertion graph, with graph
//!   compaction of linear chains
//! - [`LwwMap<V>`]: last-writer-wins map keeping the full per-key op log
//!
//! Both structures depend only on the *set* of ops applied, never on the
//! order in which they were applied, so replicas that received the same
//! transactions in a different order converge.

mod list;
mod lww;

pub use list::{Anchor, CompactionStats, ListCrdt, OrderKey};
pub use lww::{LwwMap, LwwOp};
