use super::DecodedTx;
use cojson_types::SessionId;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    pub value: Value,
    pub made_at: u64,
    pub tx_index: u32,
    pub change_idx: u32,
}

/// Append-only per-session feeds.
#[derive(Debug, Clone, Default)]
pub struct CoStream {
    items: BTreeMap<SessionId, Vec<StreamItem>>,
}

impl CoStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn apply(&mut self, tx: &DecodedTx) {
        let feed = self.items.entry(tx.order.session_id.clone()).or_default();
        for (idx, value) in tx.changes.iter().enumerate() {
            let item = StreamItem {
                value: value.clone(),
                made_at: tx.made_at(),
                tx_index: tx.order.tx_index,
                change_idx: idx as u32,
            };
            let key = (item.tx_index, item.change_idx);
            if let Err(pos) = feed.binary_search_by(|probe| (probe.tx_index, probe.change_idx).cmp(&key)) {
                feed.insert(pos, item);
            }
        }
    }

    pub fn items_by_session(&self) -> &BTreeMap<SessionId, Vec<StreamItem>> {
        &self.items
    }

    pub fn items_in(&self, session: &SessionId) -> &[StreamItem] {
        self.items.get(session).map_or(&[], Vec::as_slice)
    }

    /// Last item of each session.
    pub fn latest_by_session(&self) -> BTreeMap<&SessionId, &StreamItem> {
        self.items
            .iter()
            .filter_map(|(session, feed)| Some((session, feed.last()?)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> Value {
        let feeds: Map<String, Value> = self
            .items
            .iter()
            .map(|(session, feed)| {
                (
                    session.to_string(),
                    Value::Array(feed.iter().map(|item| item.value.clone()).collect()),
                )
            })
            .collect();
        Value::Object(feeds)
    }
}
