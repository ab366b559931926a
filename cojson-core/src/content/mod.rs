//! Content reducers.
//!
//! A value's content is a pure fold of its valid transactions in
//! [`TxOrder`]. Every reducer here is order-insensitive at the op level, so
//! applying new transactions on top of existing content gives the same
//! result as a rebuild from scratch.

mod account;
pub(crate) mod group;
mod list;
mod map;
mod plaintext;
mod stream;

pub use account::AccountContent;
pub use group::GroupContent;
pub use list::{CoList, ListOp, ListRef};
pub use map::{CoMap, MapOp};
pub use plaintext::CoPlainText;
pub use stream::{CoStream, StreamItem};

use cojson_types::{CoId, CoValueHeader, ContentKind, OpId, TxOrder};
use serde_json::Value;

/// New list nodes that trigger another compaction pass.
pub const LIST_COMPACTION_INTERVAL: usize = 256;

/// A transaction whose changes have been parsed (and decrypted, if private).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTx {
    pub order: TxOrder,
    pub changes: Vec<Value>,
    pub meta: Option<Value>,
}

impl DecodedTx {
    pub fn made_at(&self) -> u64 {
        self.order.made_at
    }

    pub fn op_id(&self, change_idx: usize) -> OpId {
        OpId::new(
            self.order.session_id.clone(),
            self.order.tx_index,
            change_idx as u32,
        )
    }
}

/// Materialized state of a value, one variant per [`ContentKind`].
#[derive(Debug, Clone)]
pub enum Content {
    Map(CoMap),
    List(CoList),
    Stream(CoStream),
    PlainText(CoPlainText),
    Group(GroupContent),
    Account(AccountContent),
}

impl Content {
    /// Empty content for a value with `header`.
    pub fn empty(id: &CoId, header: &CoValueHeader) -> Self {
        match header.content_kind() {
            ContentKind::Map => Self::Map(CoMap::new()),
            ContentKind::List => Self::List(CoList::new()),
            ContentKind::Stream => Self::Stream(CoStream::new()),
            ContentKind::PlainText => Self::PlainText(CoPlainText::new()),
            ContentKind::Group => Self::Group(GroupContent::new(id.clone(), header)),
            ContentKind::Account => Self::Account(AccountContent::new(id.clone(), header)),
        }
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Map(_) => ContentKind::Map,
            Self::List(_) => ContentKind::List,
            Self::Stream(_) => ContentKind::Stream,
            Self::PlainText(_) => ContentKind::PlainText,
            Self::Group(_) => ContentKind::Group,
            Self::Account(_) => ContentKind::Account,
        }
    }

    /// Folds one valid transaction into non-group content.
    ///
    /// Group and account content is built by the permission state machine,
    /// which needs to see every transaction in order; it ignores this call.
    pub fn apply(&mut self, tx: &DecodedTx) {
        match self {
            Self::Map(map) => map.apply(tx),
            Self::List(list) => list.apply(tx),
            Self::Stream(stream) => stream.apply(tx),
            Self::PlainText(text) => text.apply(tx),
            Self::Group(_) | Self::Account(_) => {}
        }
    }

    /// Compacts list and text content that grew by `interval` nodes since
    /// its last compaction. Returns whether a pass ran.
    pub fn compact_if_grown(&mut self, interval: usize) -> bool {
        match self {
            Self::List(list) => list.compact_if_grown(interval),
            Self::PlainText(text) => text.compact_if_grown(interval),
            _ => false,
        }
    }

    pub fn as_map(&self) -> Option<&CoMap> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&CoList> {
        match self {
            Self::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&CoStream> {
        match self {
            Self::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn as_plaintext(&self) -> Option<&CoPlainText> {
        match self {
            Self::PlainText(text) => Some(text),
            _ => None,
        }
    }

    /// Group view of group and account content.
    pub fn as_group(&self) -> Option<&GroupContent> {
        match self {
            Self::Group(group) => Some(group),
            Self::Account(account) => Some(account.group()),
            _ => None,
        }
    }

    pub fn as_account(&self) -> Option<&AccountContent> {
        match self {
            Self::Account(account) => Some(account),
            _ => None,
        }
    }

    /// Plain JSON snapshot of the current state.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Map(map) => Value::Object(map.as_object()),
            Self::List(list) => Value::Array(list.as_array()),
            Self::Stream(stream) => stream.to_json(),
            Self::PlainText(text) => Value::String(text.to_string()),
            Self::Group(group) => Value::Object(group.as_object()),
            Self::Account(account) => Value::Object(account.group().as_object()),
        }
    }
}
