//! Compact "what I already have" summaries exchanged between peers.

use crate::ids::{CoId, SessionId};
use crate::json::stable_json;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per value: whether the header is known, and how many transactions of
/// each session are known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub id: CoId,
    pub header: bool,
    pub sessions: BTreeMap<SessionId, u32>,
}

impl KnownState {
    /// Nothing known about `id`.
    #[must_use]
    pub fn empty(id: CoId) -> Self {
        Self {
            id,
            header: false,
            sessions: BTreeMap::new(),
        }
    }

    /// Merges `other` in place: header is OR-ed, session counts take the max.
    pub fn combine_with(&mut self, other: &KnownState) {
        self.header |= other.header;
        for (session, &count) in &other.sessions {
            let entry = self.sessions.entry(session.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    #[must_use]
    pub fn combined(mut self, other: &KnownState) -> Self {
        self.combine_with(other);
        self
    }

    /// True when `other` has at least everything `self` has.
    pub fn is_subset_of(&self, other: &KnownState) -> bool {
        (!self.header || other.header)
            && self
                .sessions
                .iter()
                .all(|(session, &count)| other.count(session) >= count)
    }

    /// Known transaction count for `session` (0 when unknown).
    pub fn count(&self, session: &SessionId) -> u32 {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    /// Per-session ranges `[from, to)` that `peer` is missing relative to us.
    pub fn delta_for(&self, peer: &KnownState) -> BTreeMap<SessionId, (u32, u32)> {
        self.sessions
            .iter()
            .filter_map(|(session, &ours)| {
                let theirs = peer.count(session);
                (ours > theirs).then(|| (session.clone(), (theirs, ours)))
            })
            .collect()
    }

    /// Canonical JSON of the session map, the input of reconciliation hashes.
    pub fn sessions_json(&self) -> Result<String> {
        stable_json(&self.sessions)
    }

    pub fn is_empty(&self) -> bool {
        !self.header && self.sessions.values().all(|&c| c == 0)
    }
}
