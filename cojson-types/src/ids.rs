//! Identifier types used throughout the cojson core.
//!
//! All identifiers are string newtypes whose textual form is what travels on
//! the wire and lands in storage. Parsing validates the prefix scheme so that
//! an id read from an untrusted peer is at least well-formed.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const CO_ID_PREFIX: &str = "co_z";
const SEALER_PREFIX: &str = "sealer_z";
const SIGNER_PREFIX: &str = "signer_z";
const KEY_ID_PREFIX: &str = "key_z";
const SESSION_MARKER: &str = "_session_";
const DELETE_SESSION_MARKER: &str = "_session_d";

fn invalid(kind: &'static str, value: &str) -> Error {
    Error::InvalidId {
        kind,
        value: value.to_string(),
    }
}

/// Identifier of a collaborative value, derived from the hash of its header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CoId(String);

impl CoId {
    /// Builds an id from a short hash (the part after `co_z`).
    #[must_use]
    pub fn from_short_hash(hash: &str) -> Self {
        Self(format!("{CO_ID_PREFIX}{hash}"))
    }

    /// Parses and validates a value id.
    pub fn parse(s: &str) -> Result<Self> {
        match s.strip_prefix(CO_ID_PREFIX) {
            Some(rest) if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric()) => {
                Ok(Self(s.to_string()))
            }
            _ => Err(invalid("CoId", s)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CoId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CoId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<CoId> for String {
    fn from(id: CoId) -> Self {
        id.0
    }
}

/// Public identity of an agent: `sealer_z<hex>/signer_z<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    /// Joins a sealer id and a signer id into an agent id.
    #[must_use]
    pub fn from_parts(sealer_id: &str, signer_id: &str) -> Self {
        Self(format!("{sealer_id}/{signer_id}"))
    }

    /// Parses and validates an agent id.
    pub fn parse(s: &str) -> Result<Self> {
        let (sealer, signer) = s.split_once('/').ok_or_else(|| invalid("AgentId", s))?;
        if sealer.len() > SEALER_PREFIX.len()
            && sealer.starts_with(SEALER_PREFIX)
            && signer.len() > SIGNER_PREFIX.len()
            && signer.starts_with(SIGNER_PREFIX)
        {
            Ok(Self(s.to_string()))
        } else {
            Err(invalid("AgentId", s))
        }
    }

    /// The `sealer_z...` half.
    pub fn sealer_id(&self) -> &str {
        self.0.split_once('/').map_or("", |(sealer, _)| sealer)
    }

    /// The `signer_z...` half.
    pub fn signer_id(&self) -> &str {
        self.0.split_once('/').map_or("", |(_, signer)| signer)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AgentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AgentId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

/// Either an account (itself a value) or a bare agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AccountOrAgentId {
    Account(CoId),
    Agent(AgentId),
}

impl AccountOrAgentId {
    pub fn parse(s: &str) -> Result<Self> {
        if s.starts_with(CO_ID_PREFIX) {
            CoId::parse(s).map(Self::Account)
        } else {
            AgentId::parse(s).map(Self::Agent)
        }
    }

    pub fn as_account(&self) -> Option<&CoId> {
        match self {
            Self::Account(id) => Some(id),
            Self::Agent(_) => None,
        }
    }

    pub fn as_agent(&self) -> Option<&AgentId> {
        match self {
            Self::Agent(id) => Some(id),
            Self::Account(_) => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Account(id) => id.as_str(),
            Self::Agent(id) => id.as_str(),
        }
    }
}

impl fmt::Display for AccountOrAgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountOrAgentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AccountOrAgentId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<AccountOrAgentId> for String {
    fn from(id: AccountOrAgentId) -> Self {
        match id {
            AccountOrAgentId::Account(id) => id.into(),
            AccountOrAgentId::Agent(id) => id.into(),
        }
    }
}

impl From<CoId> for AccountOrAgentId {
    fn from(id: CoId) -> Self {
        Self::Account(id)
    }
}

impl From<AgentId> for AccountOrAgentId {
    fn from(id: AgentId) -> Self {
        Self::Agent(id)
    }
}

/// A key in a group's role table: a concrete member or the public `everyone`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Member {
    Everyone,
    Id(AccountOrAgentId),
}

impl Member {
    pub const EVERYONE: &'static str = "everyone";

    pub fn parse(s: &str) -> Result<Self> {
        if s == Self::EVERYONE {
            Ok(Self::Everyone)
        } else {
            AccountOrAgentId::parse(s).map(Self::Id)
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Everyone => f.write_str(Self::EVERYONE),
            Self::Id(id) => write!(f, "{id}"),
        }
    }
}

/// Identifies one writer-device of one value.
///
/// Regular sessions look like `<author>_session_z<hex>`. Delete sessions,
/// which may only carry the single tombstone transaction, look like
/// `<author>_session_d<hex>$`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Builds a regular session id from its author and a random suffix.
    #[must_use]
    pub fn new(author: &AccountOrAgentId, random_hex: &str) -> Self {
        Self(format!("{author}{SESSION_MARKER}z{random_hex}"))
    }

    /// Builds a delete session id.
    #[must_use]
    pub fn new_delete(author: &AccountOrAgentId, random_hex: &str) -> Self {
        Self(format!("{author}{DELETE_SESSION_MARKER}{random_hex}$"))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (author, _) = s.split_once(SESSION_MARKER).ok_or_else(|| invalid("SessionId", s))?;
        AccountOrAgentId::parse(author).map_err(|_| invalid("SessionId", s))?;
        Ok(Self(s.to_string()))
    }

    pub fn is_delete(&self) -> bool {
        self.0.contains(DELETE_SESSION_MARKER) && self.0.ends_with('$')
    }

    /// The account or agent that writes this session.
    pub fn author(&self) -> Result<AccountOrAgentId> {
        let (author, _) = self
            .0
            .split_once(SESSION_MARKER)
            .ok_or_else(|| invalid("SessionId", &self.0))?;
        AccountOrAgentId::parse(author)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// Identifier of a symmetric read/write key: `key_z<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyId(String);

impl KeyId {
    #[must_use]
    pub fn from_hex(hex: &str) -> Self {
        Self(format!("{KEY_ID_PREFIX}{hex}"))
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.strip_prefix(KEY_ID_PREFIX) {
            Some(rest) if !rest.is_empty() => Ok(Self(s.to_string())),
            _ => Err(invalid("KeyId", s)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for KeyId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for KeyId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<KeyId> for String {
    fn from(id: KeyId) -> Self {
        id.0
    }
}

/// Position of a transaction inside a value: session plus index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    #[serde(rename = "txIndex")]
    pub tx_index: u32,
}

impl TransactionId {
    #[must_use]
    pub fn new(session_id: SessionId, tx_index: u32) -> Self {
        Self {
            session_id,
            tx_index,
        }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.tx_index)
    }
}

/// Address of a single change inside a transaction.
///
/// List nodes are keyed by the op that inserted them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    #[serde(rename = "txIndex")]
    pub tx_index: u32,
    #[serde(rename = "changeIdx")]
    pub change_idx: u32,
}

impl OpId {
    #[must_use]
    pub fn new(session_id: SessionId, tx_index: u32, change_idx: u32) -> Self {
        Self {
            session_id,
            tx_index,
            change_idx,
        }
    }

    pub fn tx_id(&self) -> TransactionId {
        TransactionId::new(self.session_id.clone(), self.tx_index)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.session_id, self.tx_index, self.change_idx)
    }
}

/// Identifier of a connected peer.
///
/// Free-form: storage uses `"storage"`, websocket peers use their remote
/// address plus a connection timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
