//! Sync protocol messages.
//!
//! Every message is a JSON object tagged by `action`. A transport frame holds
//! one message or several joined by newlines.

use crate::header::CoValueHeader;
use crate::ids::{CoId, SessionId};
use crate::known_state::KnownState;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sending priority class. Lower numbers go first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CoValuePriority {
    High,
    Medium,
    Low,
}

impl CoValuePriority {
    pub const ALL: [CoValuePriority; 3] = [Self::High, Self::Medium, Self::Low];

    pub fn as_u8(self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 3,
            Self::Low => 6,
        }
    }

    /// Slot of this class in a fixed-size array of queues.
    pub fn index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }

    /// Groups and accounts are needed to verify everything else.
    pub fn for_header(header: &CoValueHeader) -> Self {
        if header.is_group_or_account() {
            Self::High
        } else {
            Self::Medium
        }
    }
}

impl From<CoValuePriority> for u8 {
    fn from(priority: CoValuePriority) -> Self {
        priority.as_u8()
    }
}

impl TryFrom<u8> for CoValuePriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::High),
            3 => Ok(Self::Medium),
            6 => Ok(Self::Low),
            other => Err(format!("unknown priority {other}")),
        }
    }
}

/// New transactions of one session, continuing from `after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNewContent {
    pub after: u32,
    #[serde(rename = "newTransactions")]
    pub new_transactions: Vec<Transaction>,
    #[serde(rename = "lastSignature")]
    pub last_signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMessage {
    pub id: CoId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<CoValueHeader>,
    pub priority: CoValuePriority,
    pub new: BTreeMap<SessionId, SessionNewContent>,
    /// Set on the first of several pieces: the counts the sender will reach
    /// once every piece has arrived.
    #[serde(
        rename = "expectContentUntil",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub expect_content_until: Option<BTreeMap<SessionId, u32>>,
}

impl ContentMessage {
    #[must_use]
    pub fn new(id: CoId, priority: CoValuePriority) -> Self {
        Self {
            id,
            header: None,
            priority,
            new: BTreeMap::new(),
            expect_content_until: None,
        }
    }

    /// Known state of a receiver that applied this message on top of nothing.
    pub fn known_state(&self) -> KnownState {
        let mut state = KnownState::empty(self.id.clone());
        state.header = self.header.is_some();
        for (session, content) in &self.new {
            state.sessions.insert(
                session.clone(),
                content.after + content.new_transactions.len() as u32,
            );
        }
        state
    }

    pub fn transaction_count(&self) -> usize {
        self.new.values().map(|s| s.new_transactions.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownMessage {
    pub id: CoId,
    pub header: bool,
    pub sessions: BTreeMap<SessionId, u32>,
    #[serde(rename = "isCorrection", default, skip_serializing_if = "is_false")]
    pub is_correction: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl KnownMessage {
    #[must_use]
    pub fn from_state(state: KnownState, is_correction: bool) -> Self {
        Self {
            id: state.id,
            header: state.header,
            sessions: state.sessions,
            is_correction,
        }
    }

    pub fn to_state(&self) -> KnownState {
        KnownState {
            id: self.id.clone(),
            header: self.header,
            sessions: self.sessions.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneMessage {
    pub id: CoId,
}

/// Bulk check of many values at once: `[id, sessionsHash]` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileMessage {
    pub id: String,
    pub values: Vec<(CoId, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileAckMessage {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum SyncMessage {
    Load(KnownState),
    Known(KnownMessage),
    Content(ContentMessage),
    Done(DoneMessage),
    Reconcile(ReconcileMessage),
    ReconcileAck(ReconcileAckMessage),
}

impl SyncMessage {
    /// The value this message is about, when there is exactly one.
    pub fn covalue_id(&self) -> Option<&CoId> {
        match self {
            Self::Load(m) => Some(&m.id),
            Self::Known(m) => Some(&m.id),
            Self::Content(m) => Some(&m.id),
            Self::Done(m) => Some(&m.id),
            Self::Reconcile(_) | Self::ReconcileAck(_) => None,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Load(_) => "load",
            Self::Known(_) => "known",
            Self::Content(_) => "content",
            Self::Done(_) => "done",
            Self::Reconcile(_) => "reconcile",
            Self::ReconcileAck(_) => "reconcile-ack",
        }
    }

    /// Queue class used when sending.
    pub fn priority(&self) -> CoValuePriority {
        match self {
            Self::Content(m) => m.priority,
            Self::Reconcile(_) => CoValuePriority::Low,
            _ => CoValuePriority::High,
        }
    }
}
