//! Group roles, transaction validity and key lookup.
//!
//! Group content is built by replaying every transaction of the group in
//! [`TxOrder`] through a small state machine that tracks each member's
//! direct role. Values owned by a group accept a transaction iff its author
//! could write in the group at the transaction's `madeAt`.
//!
//! Roles are resolved across three paths: the member's direct role, the
//! `everyone` role, and roles inherited from parent groups. The highest
//! applicable role wins.

use crate::content::{DecodedTx, GroupContent};
use crate::content::group::{CHILD_PREFIX, PARENT_PREFIX, PROFILE, READ_KEY, ROOT, WRITE_KEY_PREFIX};
use cojson_crypto::{AgentSecret, KeySecret, SealerId, decrypt_key_secret, unseal};
use cojson_types::{AccountOrAgentId, AgentId, CoId, CoValueHeader, KeyId, Member, TxOrder};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Maximum depth of key-for-key and parent-group indirection.
const MAX_KEY_DEPTH: usize = 8;

/// A member's role, ordered by rank.
///
/// `WriteOnly` ranks above `Reader`, so a member granted `writeOnly`
/// directly cannot read even when `everyone` is a reader. It still ranks
/// below `Writer`, which grants both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Revoked,
    Reader,
    WriteOnly,
    Writer,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "revoked" => Some(Self::Revoked),
            "reader" => Some(Self::Reader),
            "writeOnly" => Some(Self::WriteOnly),
            "writer" => Some(Self::Writer),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Revoked => "revoked",
            Self::Reader => "reader",
            Self::WriteOnly => "writeOnly",
            Self::Writer => "writer",
            Self::Admin => "admin",
        }
    }

    pub fn can_read(self) -> bool {
        matches!(self, Self::Reader | Self::Writer | Self::Admin)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Self::WriteOnly | Self::Writer | Self::Admin)
    }

    pub fn can_admin(self) -> bool {
        self == Self::Admin
    }

    /// Roles that flow from a parent group into its children.
    pub fn is_inheritable(self) -> bool {
        matches!(self, Self::Reader | Self::Writer | Self::Admin)
    }

    fn allowed_for_everyone(self) -> bool {
        matches!(
            self,
            Self::Reader | Self::Writer | Self::WriteOnly | Self::Revoked
        )
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of a `parent_<id>` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentMapping {
    /// Members keep their parent role.
    Extend,
    /// Members get at most this role.
    Role(Role),
}

impl ParentMapping {
    pub const EXTEND: &'static str = "extend";

    pub fn parse(s: &str) -> Option<Self> {
        if s == Self::EXTEND {
            Some(Self::Extend)
        } else {
            Role::parse(s).map(Self::Role)
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extend => Self::EXTEND,
            Self::Role(role) => role.as_str(),
        }
    }

    fn inherit(self, parent_role: Role) -> Role {
        match self {
            Self::Extend => parent_role,
            Self::Role(mapping) => mapping.min(parent_role),
        }
    }
}

/// Read access to the other values a permission check depends on.
pub trait GroupLookup {
    /// Current content of a loaded group or account.
    fn group(&self, id: &CoId) -> Option<&GroupContent>;

    /// Founding agent of a loaded account.
    fn account_agent(&self, id: &CoId) -> Option<AgentId>;
}

/// The local identity used to open sealed key revelations.
#[derive(Debug, Clone, Copy)]
pub struct Identity<'a> {
    pub agent: &'a AgentSecret,
    pub account: Option<&'a CoId>,
}

impl Identity<'_> {
    /// The id this identity appears under in role tables.
    pub fn member_id(&self) -> AccountOrAgentId {
        match self.account {
            Some(account) => AccountOrAgentId::Account(account.clone()),
            None => AccountOrAgentId::Agent(self.agent.agent_id()),
        }
    }
}

// ── Role resolution ──────────────────────────────────────────────

/// Effective role of `member` in `group` at `time`, across direct,
/// `everyone` and parent-group paths. Revoked counts as no role.
pub fn role_of(
    group: &GroupContent,
    member: &AccountOrAgentId,
    time: u64,
    lookup: &dyn GroupLookup,
) -> Option<Role> {
    let mut visited = HashSet::new();
    resolve_role(group, member, time, lookup, &mut visited)
}

fn resolve_role(
    group: &GroupContent,
    member: &AccountOrAgentId,
    time: u64,
    lookup: &dyn GroupLookup,
    visited: &mut HashSet<CoId>,
) -> Option<Role> {
    if !visited.insert(group.id().clone()) {
        return None;
    }
    // an account acts in its own role table through its founding agent
    let member_key = match (group.is_account(), member.as_account()) {
        (true, Some(account)) if account == group.id() => group
            .initial_admin()
            .map_or(member.as_str(), AccountOrAgentId::as_str),
        _ => member.as_str(),
    };

    let live = |role: Option<Role>| role.filter(|r| *r != Role::Revoked);
    let mut best = live(group.direct_role_at(member_key, time));
    best = best.max(live(group.direct_role_at(Member::EVERYONE, time)));

    for (parent_id, mapping) in group.parents_at(time) {
        let Some(parent) = lookup.group(&parent_id) else {
            continue;
        };
        let Some(parent_role) = resolve_role(parent, member, time, lookup, visited) else {
            continue;
        };
        if parent_role.is_inheritable() {
            best = best.max(live(Some(mapping.inherit(parent_role))));
        }
    }
    best
}

/// Validity of a transaction in a value owned by `group`.
pub fn can_write_at(
    group: &GroupContent,
    author: &AccountOrAgentId,
    made_at: u64,
    lookup: &dyn GroupLookup,
) -> bool {
    role_of(group, author, made_at, lookup).is_some_and(Role::can_write)
}

// ── Group state machine ──────────────────────────────────────────

/// A group transaction ready for validation.
#[derive(Debug, Clone)]
pub struct GroupTx {
    pub author: AccountOrAgentId,
    pub order: TxOrder,
    pub body: GroupTxBody,
}

#[derive(Debug, Clone)]
pub enum GroupTxBody {
    /// Encrypted group transactions are accepted from admins but not interpreted.
    Private,
    Changes(Vec<Value>),
    /// Changes that could not be parsed.
    Malformed,
}

#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum GroupChange {
    Set { key: String, value: Value },
    #[serde(other)]
    Other,
}

fn is_key_revelation(key: &str) -> bool {
    key.starts_with("key_") && key.contains("_for_")
}

/// Replays `txs` (sorted by [`TxOrder`]) and returns the resulting content.
///
/// Only direct roles are considered while replaying. Extensions that would
/// make the parent chain circular are dropped.
pub fn build_group_content(
    id: &CoId,
    header: &CoValueHeader,
    txs: &[GroupTx],
    lookup: &dyn GroupLookup,
) -> GroupContent {
    let mut content = GroupContent::new(id.clone(), header);
    let initial_admin = content.initial_admin().cloned();
    let mut roles: HashMap<String, Role> = HashMap::new();
    let mut write_only_keys: HashMap<String, String> = HashMap::new();
    let mut write_keys: HashSet<String> = HashSet::new();

    for tx in txs {
        let author = tx.author.as_str();
        let author_role = roles.get(author).copied();
        let is_admin = author_role == Some(Role::Admin);

        let changes = match &tx.body {
            GroupTxBody::Private => {
                if !is_admin {
                    debug!(group = %id, "only admins can make private transactions in groups");
                }
                continue;
            }
            GroupTxBody::Malformed => {
                debug!(group = %id, "invalid JSON in group transaction");
                continue;
            }
            GroupTxBody::Changes(changes) => changes,
        };
        let [change] = changes.as_slice() else {
            debug!(group = %id, "group transaction must have exactly one change");
            continue;
        };
        let Ok(GroupChange::Set { key, value }) = serde_json::from_value(change.clone()) else {
            debug!(group = %id, "group transaction must set a role or key");
            continue;
        };

        let valid = if key == READ_KEY || key == PROFILE || key == ROOT {
            is_admin
        } else if is_key_revelation(&key) {
            is_admin
                || write_only_keys
                    .get(author)
                    .is_some_and(|own| key.starts_with(&format!("{own}_for_")))
        } else if let Some(parent) = key.strip_prefix(PARENT_PREFIX) {
            is_admin
                && match CoId::parse(parent) {
                    Ok(parent) => {
                        let circular = extends(&parent, id, lookup);
                        if circular {
                            debug!(group = %id, parent = %parent, "circular extend detected, dropping the transaction");
                        }
                        !circular
                    }
                    Err(_) => false,
                }
        } else if key.starts_with(CHILD_PREFIX) {
            true
        } else if let Some(member) = key.strip_prefix(WRITE_KEY_PREFIX) {
            let allowed = is_admin || member == author;
            let overrides = write_keys.contains(&key) && !is_admin;
            if allowed && !overrides {
                if let Some(key_id) = value.as_str() {
                    write_only_keys.insert(member.to_string(), key_id.to_string());
                }
                write_keys.insert(key.clone());
                true
            } else {
                false
            }
        } else {
            match set_role_is_valid(&key, &value, author, author_role, initial_admin.as_ref(), &roles) {
                Some(role) => {
                    roles.insert(key.clone(), role);
                    true
                }
                None => false,
            }
        };

        if valid {
            content.record(key, value, tx.order.clone());
        } else {
            debug!(group = %id, key = %key, author = %author, "permission error: group change rejected");
        }
    }
    content
}

fn set_role_is_valid(
    member: &str,
    value: &Value,
    author: &str,
    author_role: Option<Role>,
    initial_admin: Option<&AccountOrAgentId>,
    roles: &HashMap<String, Role>,
) -> Option<Role> {
    let target = Member::parse(member).ok()?;
    let assigned = value.as_str().and_then(Role::parse)?;
    if target == Member::Everyone && !assigned.allowed_for_everyone() {
        return None;
    }

    // first self promotion of the founder
    if author_role.is_none()
        && initial_admin.is_some_and(|admin| admin.as_str() == author)
        && member == author
        && assigned == Role::Admin
    {
        return Some(assigned);
    }

    if member == author && assigned == Role::Revoked && author_role.is_some() {
        return Some(assigned);
    }

    if author_role == Some(Role::Admin) {
        let demotes_admin =
            roles.get(member) == Some(&Role::Admin) && assigned != Role::Admin && member != author;
        return (!demotes_admin).then_some(assigned);
    }
    None
}

/// True when `group` is reachable from `start` by following parent links.
fn extends(start: &CoId, group: &CoId, lookup: &dyn GroupLookup) -> bool {
    let mut todo = vec![start.clone()];
    let mut seen = HashSet::new();
    while let Some(next) = todo.pop() {
        if &next == group {
            return true;
        }
        if !seen.insert(next.clone()) {
            continue;
        }
        if let Some(content) = lookup.group(&next) {
            todo.extend(content.parents().into_iter().map(|(parent, _)| parent));
        }
    }
    false
}

// ── Keys ─────────────────────────────────────────────────────────

/// Sealer of a member: an agent's own, or an account's founding agent's.
pub fn sealer_for(member: &AccountOrAgentId, lookup: &dyn GroupLookup) -> Option<SealerId> {
    let agent = match member {
        AccountOrAgentId::Agent(agent) => agent.clone(),
        AccountOrAgentId::Account(account) => lookup.account_agent(account)?,
    };
    SealerId::parse(agent.sealer_id()).ok()
}

/// Secret of `key_id`, if `identity` can reach it from `group`.
///
/// Looks for a sealed revelation to the identity, a public revelation, or a
/// revelation encrypted under another reachable key (in this group or a
/// parent).
pub fn key_secret(
    group: &GroupContent,
    key_id: &KeyId,
    identity: Identity<'_>,
    lookup: &dyn GroupLookup,
) -> Option<KeySecret> {
    key_secret_anywhere(group, key_id, identity, lookup, 0)
}

fn key_secret_anywhere(
    group: &GroupContent,
    key_id: &KeyId,
    identity: Identity<'_>,
    lookup: &dyn GroupLookup,
    depth: usize,
) -> Option<KeySecret> {
    if depth > MAX_KEY_DEPTH {
        return None;
    }
    if let Some(secret) = key_secret_in(group, key_id, identity, lookup, depth) {
        return Some(secret);
    }
    group.parents().into_iter().find_map(|(parent, _)| {
        let parent = lookup.group(&parent)?;
        key_secret_anywhere(parent, key_id, identity, lookup, depth + 1)
    })
}

fn key_secret_in(
    group: &GroupContent,
    key_id: &KeyId,
    identity: Identity<'_>,
    lookup: &dyn GroupLookup,
    depth: usize,
) -> Option<KeySecret> {
    let agent_id = identity.agent.agent_id();
    let mut sealed_targets = vec![agent_id.to_string()];
    if let Some(account) = identity.account {
        sealed_targets.insert(0, account.to_string());
    }
    for target in sealed_targets {
        let Some(sealed) = group.get(&format!("{key_id}_for_{target}")).and_then(Value::as_str) else {
            continue;
        };
        let opened = unseal(sealed, &identity.agent.sealer)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|s| KeySecret::parse(&s).ok());
        if opened.is_some() {
            return opened;
        }
    }

    let public = format!("{key_id}_for_{}", Member::EVERYONE);
    if let Some(secret) = group.get(&public).and_then(Value::as_str) {
        if let Ok(secret) = KeySecret::parse(secret) {
            return Some(secret);
        }
    }

    let prefix = format!("{key_id}_for_");
    let under_other_keys: Vec<(KeyId, String)> = group
        .entries()
        .filter_map(|(key, value)| {
            let other = KeyId::parse(key.strip_prefix(&prefix)?).ok()?;
            Some((other, value.as_str()?.to_string()))
        })
        .collect();
    for (other, encrypted) in under_other_keys {
        let Some(other_secret) = key_secret_anywhere(group, &other, identity, lookup, depth + 1) else {
            continue;
        };
        if let Ok(secret) = decrypt_key_secret(&encrypted, &other_secret) {
            return Some(secret);
        }
    }
    None
}

/// Key `identity` must encrypt new private transactions with: its dedicated
/// write key when write-only, the group's read key otherwise.
pub fn encryption_key(
    group: &GroupContent,
    identity: Identity<'_>,
    lookup: &dyn GroupLookup,
) -> Option<(KeyId, KeySecret)> {
    let me = identity.member_id();
    let role = role_of(group, &me, u64::MAX, lookup);
    let key_id = if role == Some(Role::WriteOnly) {
        group
            .write_key_for(me.as_str())
            .or_else(|| group.write_key_for(Member::EVERYONE))?
    } else {
        group.read_key_id()?
    };
    let secret = key_secret(group, &key_id, identity, lookup)?;
    Some((key_id, secret))
}

/// Parses the changes of a trusting transaction for the group state machine.
pub(crate) fn group_tx_body(tx: Option<&DecodedTx>, private: bool) -> GroupTxBody {
    if private {
        return GroupTxBody::Private;
    }
    match tx {
        Some(tx) => GroupTxBody::Changes(tx.changes.clone()),
        None => GroupTxBody::Malformed,
    }
}
