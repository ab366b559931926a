//! Transactions as they appear in session logs and on the wire.

use crate::ids::{KeyId, SessionId, TransactionId};
use serde::{Deserialize, Serialize};

/// A single entry of a session log.
///
/// `changes` is the canonical JSON text of the op array. Keeping the text
/// (rather than parsed ops) means the hash chain is computed over exactly
/// the bytes the author signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "privacy", rename_all = "lowercase")]
pub enum Transaction {
    Trusting {
        #[serde(rename = "madeAt")]
        made_at: u64,
        changes: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<String>,
    },
    Private {
        #[serde(rename = "madeAt")]
        made_at: u64,
        #[serde(rename = "keyUsed")]
        key_used: KeyId,
        #[serde(rename = "encryptedChanges")]
        encrypted_changes: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<String>,
    },
}

impl Transaction {
    pub fn made_at(&self) -> u64 {
        match self {
            Self::Trusting { made_at, .. } | Self::Private { made_at, .. } => *made_at,
        }
    }

    pub fn meta(&self) -> Option<&str> {
        match self {
            Self::Trusting { meta, .. } | Self::Private { meta, .. } => meta.as_deref(),
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Self::Private { .. })
    }

    /// Payload size used for signature checkpoints and piece splitting.
    pub fn size(&self) -> usize {
        match self {
            Self::Trusting { changes, .. } => changes.len(),
            Self::Private {
                encrypted_changes, ..
            } => encrypted_changes.len(),
        }
    }
}

/// Total order over transactions of one value.
///
/// Every reducer folds transactions in this order, which makes the result
/// independent of arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxOrder {
    pub made_at: u64,
    pub session_id: SessionId,
    pub tx_index: u32,
}

impl TxOrder {
    #[must_use]
    pub fn new(made_at: u64, session_id: SessionId, tx_index: u32) -> Self {
        Self {
            made_at,
            session_id,
            tx_index,
        }
    }

    pub fn tx_id(&self) -> TransactionId {
        TransactionId::new(self.session_id.clone(), self.tx_index)
    }
}
