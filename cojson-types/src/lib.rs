//! Core type definitions for cojson.
//!
//! This crate defines the wire-level vocabulary shared by every other crate:
//! - Value, agent, session, key and peer identifiers
//! - Immutable value headers and rulesets
//! - Transactions and their total order
//! - Known-state summaries and sync protocol messages
//! - Canonical JSON used for hashing and signing

mod header;
mod ids;
pub mod json;
mod known_state;
mod message;
mod transaction;

pub use header::{CoValueHeader, CoValueType, ContentKind, Ruleset};
pub use ids::{
    AccountOrAgentId, AgentId, CoId, KeyId, Member, OpId, PeerId, SessionId, TransactionId,
};
pub use json::stable_json;
pub use known_state::KnownState;
pub use message::{
    CoValuePriority, ContentMessage, DoneMessage, KnownMessage, ReconcileAckMessage,
    ReconcileMessage, SessionNewContent, SyncMessage,
};
pub use transaction::{Transaction, TxOrder};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid {kind}: {value}")]
    InvalidId { kind: &'static str, value: String },
}
