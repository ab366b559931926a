//! Error types for the replication core.

use cojson_crypto::CryptoError;
use cojson_types::{CoId, SessionId};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while verifying, applying or authoring transactions.
///
/// Every variant is scoped to a single value: none of them should stop
/// processing of other values or other peers.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A session's signature does not verify against its hash chain.
    #[error("invalid signature in {session_id} of {id}: {source}")]
    InvalidSignature {
        id: CoId,
        session_id: SessionId,
        #[source]
        source: CryptoError,
    },

    /// The value has been deleted; only delete sessions are accepted.
    #[error("covalue {0} is deleted")]
    DeletedCoValue(CoId),

    /// A delete session was malformed or not allowed for this value.
    #[error("delete transaction rejected for {id}: {reason}")]
    DeleteTransactionRejected { id: CoId, reason: String },

    /// Another value must be loaded first (owner group or author account).
    #[error("{id} depends on {dependency}, which is not loaded")]
    MissingDependency { id: CoId, dependency: CoId },

    /// The value is not known to this node.
    #[error("covalue {0} is unavailable")]
    Unavailable(CoId),

    /// The local identity lacks the role needed for this operation.
    #[error("not authorized on {id}: {reason}")]
    Unauthorized { id: CoId, reason: String },

    /// An index does not address an item of a list.
    #[error("invalid index {index} for list of length {len}")]
    InvalidIndex { index: usize, len: usize },

    /// Operation used on the wrong kind of content.
    #[error("{id} is not a {expected}")]
    WrongContentType { id: CoId, expected: &'static str },

    /// A transaction is structurally invalid.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Crypto error outside signature verification.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed identifier or canonical encoding failure.
    #[error("type error: {0}")]
    Types(#[from] cojson_types::Error),
}
