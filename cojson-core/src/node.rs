//! The local node: registry of loaded values, identity, and the value API.
//!
//! A [`LocalNode`] is a cheap handle; clones share the same registry. All
//! registry work happens under one mutex and never awaits. Loading from
//! elsewhere goes through a [`CoValueLoader`] installed by the sync layer,
//! and listeners are always invoked after the lock is released.

use crate::content::{AccountContent, Content, DecodedTx, GroupContent, LIST_COMPACTION_INTERVAL, MapOp};
use crate::covalue::{CoValueCore, delete_marker, id_for_header};
use crate::error::{CoreError, CoreResult};
use crate::permissions::{
    GroupLookup, GroupTx, Identity, ParentMapping, Role, build_group_content, can_write_at,
    encryption_key, group_tx_body, key_secret, role_of, sealer_for,
};
use crate::session_log::SessionLogConfig;
use async_trait::async_trait;
use cojson_crypto::{
    AgentSecret, KeySecret, Signature, SignerId, decrypt_changes, encrypt_changes,
    encrypt_key_secret, new_delete_session_id, new_random_key, new_random_session_id, random_hex,
    seal,
};
use cojson_types::{
    AccountOrAgentId, AgentId, CoId, CoValueHeader, CoValueType, ContentKind, ContentMessage,
    KeyId, KnownState, Member, Ruleset, SessionId, Transaction, TransactionId, TxOrder,
    stable_json,
};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// How long a single load attempt may take.
    pub load_timeout: Duration,
    /// Extra attempts after the first failed load.
    pub load_retries: u32,
    pub session_log: SessionLogConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(30),
            load_retries: 1,
            session_log: SessionLogConfig::default(),
        }
    }
}

/// Brings values into a node from storage or peers.
#[async_trait]
pub trait CoValueLoader: Send + Sync {
    /// Returns once `id` is available locally, or it is known that no
    /// source has it. The return value is whether it became available.
    async fn load(&self, id: &CoId) -> bool;
}

/// Why [`LocalNode::load`] could not produce content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("covalue is unavailable")]
    Unavailable,
    #[error("not authorized to read covalue")]
    Unauthorized,
    #[error("covalue is deleted")]
    Deleted,
}

/// What subscribers observe. Never carries raw errors.
#[derive(Debug, Clone)]
pub enum CoValueState {
    Loading,
    Available(Content),
    Unavailable,
    Unauthorized,
    Deleted,
}

/// Encryption of new transactions in owned values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Privacy {
    Trusting,
    #[default]
    Private,
}

type Listener = Arc<dyn Fn(&CoValueState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Loading,
    Unavailable,
    Available,
}

struct Entry {
    core: Option<CoValueCore>,
    status: EntryStatus,
    content: Option<Content>,
    applied: HashSet<TransactionId>,
    built_generation: u64,
    built_tx_count: usize,
}

impl Entry {
    fn placeholder(status: EntryStatus) -> Self {
        Self {
            core: None,
            status,
            content: None,
            applied: HashSet::new(),
            built_generation: 0,
            built_tx_count: 0,
        }
    }

    fn available(core: CoValueCore) -> Self {
        Self {
            core: Some(core),
            ..Self::placeholder(EntryStatus::Available)
        }
    }
}

struct NodeState {
    agent: AgentSecret,
    account: Option<CoId>,
    /// Session for writes to the own account value, authored by the agent.
    agent_session: SessionId,
    /// Session for every other write, authored by the account (or agent).
    main_session: SessionId,
    entries: HashMap<CoId, Entry>,
    /// Bumped whenever any group or account changes.
    groups_generation: u64,
    listeners: HashMap<CoId, Vec<(u64, Listener)>>,
    next_listener: u64,
    loader: Option<Arc<dyn CoValueLoader>>,
    config: NodeConfig,
    local_changes: mpsc::UnboundedSender<CoId>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn total_tx_count(core: &CoValueCore) -> usize {
    core.sessions().values().map(|log| log.len() as usize).sum()
}

/// Parent groups a group declares anywhere in its trusting transactions.
fn declared_parents(core: &CoValueCore) -> Vec<CoId> {
    core.ordered_transactions()
        .into_iter()
        .filter_map(|(_, tx)| match tx {
            Transaction::Trusting { changes, .. } => serde_json::from_str::<Vec<Value>>(changes).ok(),
            Transaction::Private { .. } => None,
        })
        .flatten()
        .filter_map(|change| {
            let key = change.get("key")?.as_str()?;
            CoId::parse(key.strip_prefix("parent_")?).ok()
        })
        .collect()
}

impl GroupLookup for NodeState {
    fn group(&self, id: &CoId) -> Option<&GroupContent> {
        self.entries.get(id)?.content.as_ref()?.as_group()
    }

    fn account_agent(&self, id: &CoId) -> Option<AgentId> {
        let header = self.entries.get(id)?.core.as_ref()?.header();
        if header.content_kind() != ContentKind::Account {
            return None;
        }
        match &header.ruleset {
            Ruleset::Group { initial_admin } => initial_admin.as_agent().cloned(),
            _ => None,
        }
    }
}

impl NodeState {
    fn identity(&self) -> Identity<'_> {
        Identity {
            agent: &self.agent,
            account: self.account.as_ref(),
        }
    }

    fn me(&self) -> AccountOrAgentId {
        self.identity().member_id()
    }

    fn session_for(&self, id: &CoId) -> SessionId {
        if self.account.as_ref() == Some(id) {
            self.agent_session.clone()
        } else {
            self.main_session.clone()
        }
    }

    fn core(&self, id: &CoId) -> CoreResult<&CoValueCore> {
        self.entries
            .get(id)
            .and_then(|e| e.core.as_ref())
            .ok_or_else(|| CoreError::Unavailable(id.clone()))
    }

    fn core_mut(&mut self, id: &CoId) -> CoreResult<&mut CoValueCore> {
        self.entries
            .get_mut(id)
            .and_then(|e| e.core.as_mut())
            .ok_or_else(|| CoreError::Unavailable(id.clone()))
    }

    fn insert_core(&mut self, core: CoValueCore) {
        let id = core.id().clone();
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.core = Some(core);
                entry.status = EntryStatus::Available;
            }
            None => {
                self.entries.insert(id, Entry::available(core));
            }
        }
    }

    /// Resolves the key that signs `session_id`.
    fn signer_for(&self, id: &CoId, session_id: &SessionId) -> CoreResult<SignerId> {
        let agent = match session_id.author()? {
            AccountOrAgentId::Agent(agent) => agent,
            AccountOrAgentId::Account(account) => {
                self.account_agent(&account)
                    .ok_or_else(|| CoreError::MissingDependency {
                        id: id.clone(),
                        dependency: account,
                    })?
            }
        };
        Ok(SignerId::parse(agent.signer_id())?)
    }

    // ── Content ──────────────────────────────────────────────────

    fn ensure_content(&mut self, id: &CoId, visiting: &mut HashSet<CoId>) -> CoreResult<()> {
        if !visiting.insert(id.clone()) {
            return Ok(());
        }
        let core = self.core(id)?;
        if core.is_deleted() {
            return Err(CoreError::DeletedCoValue(id.clone()));
        }
        match core.header().ruleset.clone() {
            Ruleset::OwnedByGroup { group } => {
                self.ensure_content(&group, visiting).map_err(|e| match e {
                    CoreError::Unavailable(_) => CoreError::MissingDependency {
                        id: id.clone(),
                        dependency: group.clone(),
                    },
                    other => other,
                })?;
            }
            Ruleset::Group { .. } => {
                for parent in declared_parents(core) {
                    if let Err(e) = self.ensure_content(&parent, visiting) {
                        debug!(group = %id, parent = %parent, error = %e, "parent group not available");
                    }
                }
            }
            Ruleset::UnsafeAllowAll => {}
        }

        let generation = self.groups_generation;
        let Some(entry) = self.entries.get_mut(id) else {
            return Err(CoreError::Unavailable(id.clone()));
        };
        let tx_count = entry.core.as_ref().map_or(0, total_tx_count);
        let fresh = entry.built_generation == generation && entry.built_tx_count == tx_count;
        if entry.content.is_some() && fresh {
            return Ok(());
        }
        let incremental = entry.built_generation == generation
            && entry
                .core
                .as_ref()
                .is_some_and(|c| !c.header().is_group_or_account());
        let previous = match entry.content.take() {
            Some(content) if incremental => Some((content, std::mem::take(&mut entry.applied))),
            _ => None,
        };

        let (mut content, applied) = self.compute(id, previous)?;
        if content.compact_if_grown(LIST_COMPACTION_INTERVAL) {
            debug!(id = %id, "compacted list content");
        }
        if let Some(entry) = self.entries.get_mut(id) {
            entry.content = Some(content);
            entry.applied = applied;
            entry.built_generation = generation;
            entry.built_tx_count = tx_count;
        }
        Ok(())
    }

    fn decode(&self, order: &TxOrder, tx: &Transaction, group: Option<&GroupContent>) -> Option<DecodedTx> {
        let changes_json = match tx {
            Transaction::Trusting { changes, .. } => changes.clone(),
            Transaction::Private {
                key_used,
                encrypted_changes,
                ..
            } => {
                let secret = key_secret(group?, key_used, self.identity(), self)?;
                match decrypt_changes(encrypted_changes, &secret) {
                    Ok(changes) => changes,
                    Err(e) => {
                        debug!(session = %order.session_id, error = %e, "could not decrypt transaction");
                        return None;
                    }
                }
            }
        };
        let changes = serde_json::from_str::<Vec<Value>>(&changes_json).ok()?;
        let meta = tx.meta().and_then(|m| serde_json::from_str(m).ok());
        Some(DecodedTx {
            order: order.clone(),
            changes,
            meta,
        })
    }

    fn compute(
        &self,
        id: &CoId,
        previous: Option<(Content, HashSet<TransactionId>)>,
    ) -> CoreResult<(Content, HashSet<TransactionId>)> {
        let core = self.core(id)?;
        let header = core.header();
        let ordered = core.ordered_transactions();

        if let Ruleset::Group { .. } = header.ruleset {
            let txs: Vec<GroupTx> = ordered
                .iter()
                .filter_map(|(order, tx)| {
                    let author = order.session_id.author().ok()?;
                    let decoded = if tx.is_private() {
                        None
                    } else {
                        self.decode(order, tx, None)
                    };
                    Some(GroupTx {
                        author,
                        order: order.clone(),
                        body: group_tx_body(decoded.as_ref(), tx.is_private()),
                    })
                })
                .collect();
            let group = build_group_content(id, header, &txs, self);
            let content = if header.content_kind() == ContentKind::Account {
                Content::Account(AccountContent::from_group(group))
            } else {
                Content::Group(group)
            };
            return Ok((content, HashSet::new()));
        }

        let owner = match header.owner_group() {
            Some(group_id) => Some(self.group(group_id).ok_or_else(|| CoreError::MissingDependency {
                id: id.clone(),
                dependency: group_id.clone(),
            })?),
            None => None,
        };
        let (mut content, mut applied) =
            previous.unwrap_or_else(|| (Content::empty(id, header), HashSet::new()));
        for (order, tx) in &ordered {
            if !applied.insert(order.tx_id()) {
                continue;
            }
            if let Some(group) = owner {
                let Ok(author) = order.session_id.author() else {
                    continue;
                };
                if !can_write_at(group, &author, order.made_at, self) {
                    debug!(id = %id, author = %author, "permission error: author cannot write at madeAt");
                    continue;
                }
            }
            if let Some(decoded) = self.decode(order, tx, owner) {
                content.apply(&decoded);
            }
        }
        Ok((content, applied))
    }

    fn content_ref(&mut self, id: &CoId) -> CoreResult<&Content> {
        self.ensure_content(id, &mut HashSet::new())?;
        self.entries
            .get(id)
            .and_then(|e| e.content.as_ref())
            .ok_or_else(|| CoreError::Unavailable(id.clone()))
    }

    fn group_content(&mut self, id: &CoId) -> CoreResult<GroupContent> {
        self.content_ref(id)?
            .as_group()
            .cloned()
            .ok_or_else(|| CoreError::WrongContentType {
                id: id.clone(),
                expected: "group",
            })
    }

    fn state_of(&mut self, id: &CoId) -> CoValueState {
        let Some(entry) = self.entries.get(id) else {
            return CoValueState::Unavailable;
        };
        match (entry.status, entry.core.as_ref()) {
            (EntryStatus::Loading, None) => return CoValueState::Loading,
            (_, None) => return CoValueState::Unavailable,
            (_, Some(core)) if core.is_deleted() => return CoValueState::Deleted,
            _ => {}
        }
        let owner = self
            .core(id)
            .ok()
            .and_then(|core| core.header().owner_group().cloned());
        match self.ensure_content(id, &mut HashSet::new()) {
            Ok(()) => {}
            Err(CoreError::MissingDependency { .. }) => return CoValueState::Loading,
            Err(CoreError::DeletedCoValue(_)) => return CoValueState::Deleted,
            Err(_) => return CoValueState::Unavailable,
        }
        if let Some(owner) = owner {
            let me = self.me();
            let readable = self
                .group(&owner)
                .and_then(|group| role_of(group, &me, u64::MAX, &*self))
                .is_some();
            if !readable {
                return CoValueState::Unauthorized;
            }
        }
        match self.entries.get(id).and_then(|e| e.content.clone()) {
            Some(content) => CoValueState::Available(content),
            None => CoValueState::Unavailable,
        }
    }

    /// Listener invocations owed after `id` changed. A group change can
    /// alter the validity of anything, so it notifies every subscriber.
    fn pending_notifications(&mut self, id: &CoId) -> Vec<(Listener, CoValueState)> {
        let is_group = self
            .core(id)
            .is_ok_and(|core| core.header().is_group_or_account());
        let ids: Vec<CoId> = if is_group {
            self.listeners.keys().cloned().collect()
        } else {
            self.listeners.contains_key(id).then(|| id.clone()).into_iter().collect()
        };
        let mut calls = Vec::new();
        for target in ids {
            let state = self.state_of(&target);
            if let Some(listeners) = self.listeners.get(&target) {
                calls.extend(listeners.iter().map(|(_, l)| (Arc::clone(l), state.clone())));
            }
        }
        calls
    }

    fn role_in(&mut self, group: &CoId, member: &AccountOrAgentId) -> CoreResult<Option<Role>> {
        self.ensure_content(group, &mut HashSet::new())?;
        let content = self.group(group).ok_or_else(|| CoreError::WrongContentType {
            id: group.clone(),
            expected: "group",
        })?;
        Ok(role_of(content, member, u64::MAX, &*self))
    }

    fn require_admin(&mut self, group: &CoId) -> CoreResult<()> {
        let me = self.me();
        if self.role_in(group, &me)? == Some(Role::Admin) {
            Ok(())
        } else {
            Err(CoreError::Unauthorized {
                id: group.clone(),
                reason: "admin role required".into(),
            })
        }
    }

    // ── Local writes ─────────────────────────────────────────────

    fn create_covalue(&mut self, mut header: CoValueHeader) -> CoreResult<CoId> {
        if header.created_at.is_none() {
            header.created_at = Some(now_ms());
        }
        let core = CoValueCore::from_header(header, self.config.session_log.clone())?;
        let id = core.id().clone();
        self.insert_core(core);
        let _ = self.local_changes.send(id.clone());
        debug!(id = %id, "created covalue");
        Ok(id)
    }

    fn make_transaction(
        &mut self,
        id: &CoId,
        changes: Vec<Value>,
        privacy: Privacy,
        meta: Option<Value>,
    ) -> CoreResult<TransactionId> {
        let header = self.core(id)?.header().clone();
        if self.core(id)?.is_deleted() {
            return Err(CoreError::DeletedCoValue(id.clone()));
        }
        let made_at = now_ms();
        let meta = meta.map(|m| stable_json(&m)).transpose()?;
        let changes = stable_json(&changes)?;

        let tx = match header.owner_group() {
            Some(group_id) => {
                let me = self.me();
                let role = self.role_in(group_id, &me)?;
                if !role.is_some_and(Role::can_write) {
                    return Err(CoreError::Unauthorized {
                        id: id.clone(),
                        reason: format!("role {} cannot write", role.map_or("none", Role::as_str)),
                    });
                }
                if privacy == Privacy::Private {
                    let group = self.group(group_id).ok_or_else(|| CoreError::MissingDependency {
                        id: id.clone(),
                        dependency: group_id.clone(),
                    })?;
                    let (key_used, secret) = encryption_key(group, self.identity(), &*self)
                        .ok_or_else(|| CoreError::Unauthorized {
                            id: id.clone(),
                            reason: "no readable key".into(),
                        })?;
                    Transaction::Private {
                        made_at,
                        key_used,
                        encrypted_changes: encrypt_changes(&changes, &secret)?,
                        meta,
                    }
                } else {
                    Transaction::Trusting {
                        made_at,
                        changes,
                        meta,
                    }
                }
            }
            None => Transaction::Trusting {
                made_at,
                changes,
                meta,
            },
        };

        let session = self.session_for(id);
        let signer = self.agent.signer.clone();
        let count = self.core_mut(id)?.add_own_transaction(&session, tx, &signer)?;
        if header.is_group_or_account() {
            self.groups_generation += 1;
        }
        let _ = self.local_changes.send(id.clone());
        Ok(TransactionId::new(session, count - 1))
    }

    fn edit(
        &mut self,
        id: &CoId,
        privacy: Privacy,
        build: impl FnOnce(&Content) -> CoreResult<Vec<Value>>,
    ) -> CoreResult<TransactionId> {
        let changes = build(self.content_ref(id)?)?;
        self.make_transaction(id, changes, privacy, None)
    }

    fn set_group_entry(&mut self, group: &CoId, key: &str, value: Value) -> CoreResult<TransactionId> {
        let change = MapOp::set(key, value).to_change();
        self.make_transaction(group, vec![change], Privacy::Trusting, None)
    }

    /// Writes a revelation of `secret` to `member`: sealed to its agent, or
    /// in the clear for `everyone`.
    fn reveal_key(&mut self, group: &CoId, key_id: &KeyId, secret: &KeySecret, member: &Member) -> CoreResult<()> {
        let value = match member {
            Member::Everyone => secret.to_secret_string(),
            Member::Id(id) => {
                let sealer = sealer_for(id, &*self).ok_or_else(|| CoreError::MissingDependency {
                    id: group.clone(),
                    dependency: id.as_account().cloned().unwrap_or_else(|| group.clone()),
                })?;
                seal(secret.to_secret_string().as_bytes(), &sealer)?
            }
        };
        self.set_group_entry(group, &format!("{key_id}_for_{member}"), Value::String(value))?;
        Ok(())
    }

    fn read_key(&mut self, group: &CoId) -> CoreResult<(KeyId, KeySecret)> {
        let content = self.group_content(group)?;
        let key_id = content.read_key_id().ok_or_else(|| CoreError::Unauthorized {
            id: group.clone(),
            reason: "group has no read key".into(),
        })?;
        let secret = key_secret(&content, &key_id, self.identity(), &*self).ok_or_else(|| {
            CoreError::Unauthorized {
                id: group.clone(),
                reason: format!("cannot read key {key_id}"),
            }
        })?;
        Ok((key_id, secret))
    }

    fn create_group(&mut self) -> CoreResult<CoId> {
        let me = self.me();
        let header = CoValueHeader::group(me.clone(), json!(random_hex(12)));
        let id = self.create_covalue(header)?;
        self.set_group_entry(&id, me.as_str(), json!(Role::Admin.as_str()))?;
        let (key_id, secret) = new_random_key();
        self.reveal_key(&id, &key_id, &secret, &Member::Id(me))?;
        self.set_group_entry(&id, "readKey", json!(key_id.as_str()))?;
        info!(group = %id, "created group");
        Ok(id)
    }

    fn add_member(&mut self, group: &CoId, member: &Member, role: Role) -> CoreResult<()> {
        self.require_admin(group)?;
        let (read_key_id, read_secret) = self.read_key(group)?;
        self.set_group_entry(group, &member.to_string(), json!(role.as_str()))?;
        match role {
            Role::WriteOnly => {
                let (write_key_id, write_secret) = new_random_key();
                self.set_group_entry(group, &format!("writeKeyFor_{member}"), json!(write_key_id.as_str()))?;
                self.reveal_key(group, &write_key_id, &write_secret, member)?;
                let under_read_key = encrypt_key_secret(&write_secret, &read_secret)?;
                self.set_group_entry(group, &format!("{write_key_id}_for_{read_key_id}"), json!(under_read_key))?;
            }
            Role::Revoked => {}
            Role::Reader | Role::Writer | Role::Admin => {
                self.reveal_key(group, &read_key_id, &read_secret, member)?;
            }
        }
        debug!(group = %group, member = %member, role = %role, "member added");
        Ok(())
    }

    fn rotate_read_key(&mut self, group: &CoId, visited: &mut HashSet<CoId>) -> CoreResult<()> {
        if !visited.insert(group.clone()) {
            return Ok(());
        }
        let old = self.read_key(group).ok();
        let content = self.group_content(group)?;
        let (new_id, new_secret) = new_random_key();

        for (member, role) in content.members() {
            if role.can_read() {
                if let Err(e) = self.reveal_key(group, &new_id, &new_secret, &member) {
                    warn!(group = %group, member = %member, error = %e, "could not reveal rotated key");
                }
            } else if role == Role::WriteOnly {
                let Some(write_key_id) = content.write_key_for(&member.to_string()) else {
                    continue;
                };
                let Some(write_secret) = key_secret(&content, &write_key_id, self.identity(), &*self) else {
                    continue;
                };
                let encrypted = encrypt_key_secret(&write_secret, &new_secret)?;
                self.set_group_entry(group, &format!("{write_key_id}_for_{new_id}"), json!(encrypted))?;
            }
        }
        if let Some((old_id, old_secret)) = old {
            let encrypted = encrypt_key_secret(&old_secret, &new_secret)?;
            self.set_group_entry(group, &format!("{old_id}_for_{new_id}"), json!(encrypted))?;
        }
        for (parent, _) in content.parents() {
            match self.read_key(&parent) {
                Ok((parent_key_id, parent_secret)) => {
                    let encrypted = encrypt_key_secret(&new_secret, &parent_secret)?;
                    self.set_group_entry(group, &format!("{new_id}_for_{parent_key_id}"), json!(encrypted))?;
                }
                Err(e) => debug!(group = %group, parent = %parent, error = %e, "parent key not readable"),
            }
        }
        self.set_group_entry(group, "readKey", json!(new_id.as_str()))?;
        info!(group = %group, key = %new_id, "rotated read key");

        for child in content.children() {
            let result = self
                .require_admin(&child)
                .and_then(|()| self.rotate_read_key(&child, visited));
            if let Err(e) = result {
                debug!(group = %group, child = %child, error = %e, "child group key not rotated");
            }
        }
        Ok(())
    }

    fn extend_group(&mut self, child: &CoId, parent: &CoId, mapping: ParentMapping) -> CoreResult<()> {
        self.require_admin(child)?;
        let (child_key_id, child_secret) = self.read_key(child)?;
        let (parent_key_id, parent_secret) = self.read_key(parent)?;
        self.set_group_entry(child, &format!("parent_{parent}"), json!(mapping.as_str()))?;
        let encrypted = encrypt_key_secret(&child_secret, &parent_secret)?;
        self.set_group_entry(child, &format!("{child_key_id}_for_{parent_key_id}"), json!(encrypted))?;
        if let Err(e) = self.set_group_entry(parent, &format!("child_{child}"), json!(ParentMapping::EXTEND)) {
            debug!(parent = %parent, child = %child, error = %e, "could not record child on parent");
        }
        Ok(())
    }

    fn delete_value(&mut self, id: &CoId) -> CoreResult<()> {
        let header = self.core(id)?.header().clone();
        if header.is_group_or_account() {
            return Err(CoreError::DeleteTransactionRejected {
                id: id.clone(),
                reason: "groups and accounts cannot be deleted".into(),
            });
        }
        if let Some(group) = header.owner_group() {
            self.require_admin(group)?;
        }
        let session = new_delete_session_id(&self.me());
        let tx = Transaction::Trusting {
            made_at: now_ms(),
            changes: "[]".into(),
            meta: Some(stable_json(&delete_marker(id))?),
        };
        let signer = self.agent.signer.clone();
        self.core_mut(id)?.add_own_transaction(&session, tx, &signer)?;
        let _ = self.local_changes.send(id.clone());
        info!(id = %id, "deleted covalue");
        Ok(())
    }

    // ── Remote writes ────────────────────────────────────────────

    fn try_add_transactions(
        &mut self,
        id: &CoId,
        session_id: &SessionId,
        txs: Vec<Transaction>,
        signature: &Signature,
        skip_verify: bool,
    ) -> CoreResult<u32> {
        let header = self.core(id)?.header().clone();
        let signer = self.signer_for(id, session_id)?;
        if session_id.is_delete() {
            if let Some(group) = header.owner_group() {
                self.ensure_content(group, &mut HashSet::new())
                    .map_err(|_| CoreError::MissingDependency {
                        id: id.clone(),
                        dependency: group.clone(),
                    })?;
                let author = session_id.author()?;
                let made_at = txs.first().map_or(0, Transaction::made_at);
                let allowed = self
                    .group(group)
                    .and_then(|g| role_of(g, &author, made_at, &*self))
                    .is_some_and(Role::can_admin);
                if !allowed {
                    return Err(CoreError::DeleteTransactionRejected {
                        id: id.clone(),
                        reason: "only admins of the owner group can delete".into(),
                    });
                }
            }
        }
        let count = self
            .core_mut(id)?
            .try_add_transactions(session_id, txs, signature, &signer, skip_verify)?;
        if header.is_group_or_account() {
            self.groups_generation += 1;
        }
        Ok(count)
    }

    fn mark(&mut self, id: &CoId, status: EntryStatus) {
        match self.entries.get_mut(id) {
            Some(entry) if entry.core.is_none() => entry.status = status,
            Some(_) => {}
            None => {
                self.entries.insert(id.clone(), Entry::placeholder(status));
            }
        }
    }
}

/// Handle to the local node. Clones share state.
#[derive(Clone)]
pub struct LocalNode {
    state: Arc<Mutex<NodeState>>,
    local_changes: Arc<Mutex<Option<mpsc::UnboundedReceiver<CoId>>>>,
}

/// Keeps a listener registered; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: CoId,
    token: u64,
    state: Weak<Mutex<NodeState>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(listeners) = state.listeners.get_mut(&self.id) {
            listeners.retain(|(token, _)| *token != self.token);
            if listeners.is_empty() {
                state.listeners.remove(&self.id);
            }
        }
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("LocalNode")
            .field("agent", &state.agent.agent_id())
            .field("account", &state.account)
            .field("values", &state.entries.len())
            .finish_non_exhaustive()
    }
}

impl LocalNode {
    fn new(agent: AgentSecret, account: Option<CoId>, config: NodeConfig) -> Self {
        let agent_author = AccountOrAgentId::Agent(agent.agent_id());
        let main_author = match &account {
            Some(account) => AccountOrAgentId::Account(account.clone()),
            None => agent_author.clone(),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let state = NodeState {
            agent_session: new_random_session_id(&agent_author),
            main_session: new_random_session_id(&main_author),
            agent,
            account,
            entries: HashMap::new(),
            groups_generation: 0,
            listeners: HashMap::new(),
            next_listener: 0,
            loader: None,
            config,
            local_changes: tx,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            local_changes: Arc::new(Mutex::new(Some(rx))),
        }
    }

    /// A node running as a bare agent, without an account (e.g. a sync server).
    pub fn with_agent(agent: AgentSecret, config: NodeConfig) -> Self {
        Self::new(agent, None, config)
    }

    /// Creates a fresh agent and account, with a public profile named `name`.
    pub fn with_new_account(name: &str, config: NodeConfig) -> CoreResult<Self> {
        let agent = AgentSecret::generate();
        let agent_id = agent.agent_id();
        let mut header = CoValueHeader::account(agent_id.clone().into(), json!(random_hex(12)));
        header.created_at = Some(now_ms());
        let account_id = id_for_header(&header)?;
        let node = Self::new(agent, Some(account_id.clone()), config);
        {
            let mut state = node.lock();
            let core = CoValueCore::new(account_id.clone(), header, state.config.session_log.clone())?;
            state.insert_core(core);
            let _ = state.local_changes.send(account_id.clone());

            state.set_group_entry(&account_id, agent_id.as_str(), json!(Role::Admin.as_str()))?;
            let (key_id, secret) = new_random_key();
            state.reveal_key(&account_id, &key_id, &secret, &Member::Id(agent_id.into()))?;
            state.set_group_entry(&account_id, "readKey", json!(key_id.as_str()))?;

            let profile_group = state.create_group()?;
            state.add_member(&profile_group, &Member::Everyone, Role::Reader)?;
            let profile = state.create_covalue(CoValueHeader::new(
                CoValueType::Comap,
                Ruleset::OwnedByGroup { group: profile_group },
                Some(json!({"type": "profile"})),
                json!(random_hex(12)),
            ))?;
            state.make_transaction(
                &profile,
                vec![MapOp::set("name", json!(name)).to_change()],
                Privacy::Trusting,
                None,
            )?;
            state.set_group_entry(&account_id, "profile", json!(profile.as_str()))?;
            info!(account = %account_id, "created account");
        }
        Ok(node)
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(calls: Vec<(Listener, CoValueState)>) {
        for (listener, state) in calls {
            listener(&state);
        }
    }

    /// Runs `f` under the lock, then notifies subscribers of `id` if it succeeded.
    fn mutate<T>(&self, id: &CoId, f: impl FnOnce(&mut NodeState) -> CoreResult<T>) -> CoreResult<T> {
        let (result, calls) = {
            let mut state = self.lock();
            let result = f(&mut state);
            let calls = if result.is_ok() {
                state.pending_notifications(id)
            } else {
                Vec::new()
            };
            (result, calls)
        };
        Self::dispatch(calls);
        result
    }

    // ── Identity ─────────────────────────────────────────────────

    pub fn agent_id(&self) -> AgentId {
        self.lock().agent.agent_id()
    }

    pub fn account_id(&self) -> Option<CoId> {
        self.lock().account.clone()
    }

    /// The id this node appears under in role tables.
    pub fn member_id(&self) -> AccountOrAgentId {
        self.lock().me()
    }

    pub fn config(&self) -> NodeConfig {
        self.lock().config.clone()
    }

    /// Installs the loader used by [`load`](Self::load) and subscriptions.
    pub fn set_loader(&self, loader: Arc<dyn CoValueLoader>) {
        self.lock().loader = Some(loader);
    }

    /// Ids of locally created or changed values. Can be taken once.
    pub fn take_local_changes(&self) -> Option<mpsc::UnboundedReceiver<CoId>> {
        self.local_changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    // ── Creating values ──────────────────────────────────────────

    /// Creates a value from `header` and returns its id.
    pub fn create_covalue(&self, header: CoValueHeader) -> CoreResult<CoId> {
        self.lock().create_covalue(header)
    }

    /// Creates a value of `kind` under `ruleset`.
    pub fn create_value(&self, kind: CoValueType, ruleset: Ruleset, meta: Option<Value>) -> CoreResult<CoId> {
        self.create_covalue(CoValueHeader::new(kind, ruleset, meta, json!(random_hex(12))))
    }

    /// Creates a group administered by this node's identity.
    pub fn create_group(&self) -> CoreResult<CoId> {
        self.lock().create_group()
    }

    pub fn create_map(&self, group: &CoId) -> CoreResult<CoId> {
        self.create_value(CoValueType::Comap, Ruleset::OwnedByGroup { group: group.clone() }, None)
    }

    pub fn create_list(&self, group: &CoId) -> CoreResult<CoId> {
        self.create_value(CoValueType::Colist, Ruleset::OwnedByGroup { group: group.clone() }, None)
    }

    pub fn create_stream(&self, group: &CoId) -> CoreResult<CoId> {
        self.create_value(CoValueType::Costream, Ruleset::OwnedByGroup { group: group.clone() }, None)
    }

    pub fn create_plaintext(&self, group: &CoId) -> CoreResult<CoId> {
        self.create_value(CoValueType::Coplaintext, Ruleset::OwnedByGroup { group: group.clone() }, None)
    }

    // ── Editing ──────────────────────────────────────────────────

    /// Signs and appends a transaction with raw `changes` to `id`.
    ///
    /// Private transactions are encrypted with the owner group's current
    /// key. Group transactions are always trusting.
    pub fn make_transaction(
        &self,
        id: &CoId,
        changes: Vec<Value>,
        privacy: Privacy,
        meta: Option<Value>,
    ) -> CoreResult<TransactionId> {
        self.mutate(id, |state| state.make_transaction(id, changes, privacy, meta))
    }

    fn edit(
        &self,
        id: &CoId,
        privacy: Privacy,
        build: impl FnOnce(&Content) -> CoreResult<Vec<Value>>,
    ) -> CoreResult<TransactionId> {
        self.mutate(id, |state| state.edit(id, privacy, build))
    }

    pub fn map_set(&self, id: &CoId, key: &str, value: Value, privacy: Privacy) -> CoreResult<TransactionId> {
        let wrong = wrong_type(id, "map");
        self.edit(id, privacy, |content| {
            content.as_map().ok_or(wrong)?;
            Ok(vec![MapOp::set(key, value).to_change()])
        })
    }

    pub fn map_delete(&self, id: &CoId, key: &str, privacy: Privacy) -> CoreResult<TransactionId> {
        let wrong = wrong_type(id, "map");
        self.edit(id, privacy, |content| {
            content.as_map().ok_or(wrong)?;
            Ok(vec![MapOp::del(key).to_change()])
        })
    }

    /// Appends `value` after the item at `after` (default: at the end).
    pub fn list_append(&self, id: &CoId, value: Value, after: Option<usize>, privacy: Privacy) -> CoreResult<TransactionId> {
        self.list_append_items(id, vec![value], after, privacy)
    }

    /// Appends `values` in order after the item at `after` in one transaction.
    pub fn list_append_items(
        &self,
        id: &CoId,
        values: Vec<Value>,
        after: Option<usize>,
        privacy: Privacy,
    ) -> CoreResult<TransactionId> {
        let wrong = wrong_type(id, "list");
        self.edit(id, privacy, |content| {
            content.as_list().ok_or(wrong)?.append_changes(values, after)
        })
    }

    pub fn list_prepend(&self, id: &CoId, value: Value, before: Option<usize>, privacy: Privacy) -> CoreResult<TransactionId> {
        let wrong = wrong_type(id, "list");
        self.edit(id, privacy, |content| {
            Ok(vec![content.as_list().ok_or(wrong)?.prepend_change(value, before)?])
        })
    }

    pub fn list_delete(&self, id: &CoId, index: usize, privacy: Privacy) -> CoreResult<TransactionId> {
        let wrong = wrong_type(id, "list");
        self.edit(id, privacy, |content| {
            Ok(vec![content.as_list().ok_or(wrong)?.delete_change(index)?])
        })
    }

    pub fn list_replace(&self, id: &CoId, index: usize, value: Value, privacy: Privacy) -> CoreResult<TransactionId> {
        let wrong = wrong_type(id, "list");
        self.edit(id, privacy, |content| {
            content.as_list().ok_or(wrong)?.replace_changes(index, value)
        })
    }

    pub fn stream_push(&self, id: &CoId, value: Value, privacy: Privacy) -> CoreResult<TransactionId> {
        let wrong = wrong_type(id, "stream");
        self.edit(id, privacy, |content| {
            content.as_stream().ok_or(wrong)?;
            Ok(vec![value])
        })
    }

    /// Inserts `text` after the character at `after`, or at the start.
    pub fn text_insert_after(&self, id: &CoId, after: Option<usize>, text: &str, privacy: Privacy) -> CoreResult<TransactionId> {
        let wrong = wrong_type(id, "plaintext");
        self.edit(id, privacy, |content| {
            content.as_plaintext().ok_or(wrong)?.insert_after_changes(after, text)
        })
    }

    /// Deletes the characters in `[from, to)`.
    pub fn text_delete_range(&self, id: &CoId, from: usize, to: usize, privacy: Privacy) -> CoreResult<TransactionId> {
        let wrong = wrong_type(id, "plaintext");
        self.edit(id, privacy, |content| {
            content.as_plaintext().ok_or(wrong)?.delete_range_changes(from, to)
        })
    }

    // ── Groups ───────────────────────────────────────────────────

    /// Gives `member` a role and reveals the keys it needs.
    pub fn add_member(&self, group: &CoId, member: &Member, role: Role) -> CoreResult<()> {
        self.mutate(group, |state| state.add_member(group, member, role))
    }

    /// Revokes `member` and rotates the read key so it cannot read new content.
    pub fn remove_member(&self, group: &CoId, member: &Member) -> CoreResult<()> {
        self.mutate(group, |state| {
            state.require_admin(group)?;
            state.set_group_entry(group, &member.to_string(), json!(Role::Revoked.as_str()))?;
            state.rotate_read_key(group, &mut HashSet::new())
        })
    }

    pub fn rotate_read_key(&self, group: &CoId) -> CoreResult<()> {
        self.mutate(group, |state| {
            state.require_admin(group)?;
            state.rotate_read_key(group, &mut HashSet::new())
        })
    }

    /// Makes members of `parent` members of `child`, capped by `mapping`.
    pub fn extend_group(&self, child: &CoId, parent: &CoId, mapping: ParentMapping) -> CoreResult<()> {
        self.mutate(child, |state| state.extend_group(child, parent, mapping))
    }

    /// Effective role of `member` in `group`.
    pub fn role_in(&self, group: &CoId, member: &AccountOrAgentId) -> CoreResult<Option<Role>> {
        self.lock().role_in(group, member)
    }

    pub fn my_role(&self, group: &CoId) -> CoreResult<Option<Role>> {
        let mut state = self.lock();
        let me = state.me();
        state.role_in(group, &me)
    }

    /// Writes the delete-session tombstone for `id`. Admins only.
    pub fn delete_value(&self, id: &CoId) -> CoreResult<()> {
        self.mutate(id, |state| state.delete_value(id))
    }

    // ── Reading ──────────────────────────────────────────────────

    /// Current content of a loaded value.
    pub fn content(&self, id: &CoId) -> CoreResult<Content> {
        self.lock().content_ref(id).cloned()
    }

    pub fn state(&self, id: &CoId) -> CoValueState {
        self.lock().state_of(id)
    }

    /// Rebuilds the content of `id` from scratch, ignoring cached state.
    pub fn rebuild_content(&self, id: &CoId) -> CoreResult<Content> {
        let mut state = self.lock();
        state.ensure_content(id, &mut HashSet::new())?;
        let (content, _) = state.compute(id, None)?;
        Ok(content)
    }

    pub fn has(&self, id: &CoId) -> bool {
        self.lock().core(id).is_ok()
    }

    pub fn is_deleted(&self, id: &CoId) -> bool {
        self.lock().core(id).is_ok_and(CoValueCore::is_deleted)
    }

    pub fn header(&self, id: &CoId) -> Option<CoValueHeader> {
        self.lock().core(id).ok().map(|core| core.header().clone())
    }

    pub fn known_state(&self, id: &CoId) -> Option<KnownState> {
        self.lock().core(id).ok().map(CoValueCore::known_state)
    }

    /// Content messages bringing a peer at `known` up to date.
    pub fn new_content_since(&self, id: &CoId, known: Option<&KnownState>) -> Option<Vec<ContentMessage>> {
        self.lock().core(id).ok()?.new_content_since(known)
    }

    /// Ids of every value with a known header.
    pub fn covalue_ids(&self) -> Vec<CoId> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, e)| e.core.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Runs `f` against the verified core of `id`.
    pub fn with_core<T>(&self, id: &CoId, f: impl FnOnce(&CoValueCore) -> T) -> Option<T> {
        self.lock().core(id).ok().map(f)
    }

    // ── Receiving ────────────────────────────────────────────────

    /// Registers the header of a value received from elsewhere.
    ///
    /// Returns `false` if the header was already known.
    pub fn ensure_header(&self, id: &CoId, header: CoValueHeader) -> CoreResult<bool> {
        self.mutate(id, |state| {
            if state.core(id).is_ok() {
                return Ok(false);
            }
            let config = state.config.session_log.clone();
            state.insert_core(CoValueCore::new(id.clone(), header, config)?);
            Ok(true)
        })
    }

    /// Verifies and appends transactions received from elsewhere.
    pub fn try_add_transactions(
        &self,
        id: &CoId,
        session_id: &SessionId,
        txs: Vec<Transaction>,
        signature: &Signature,
        skip_verify: bool,
    ) -> CoreResult<u32> {
        self.mutate(id, |state| {
            state.try_add_transactions(id, session_id, txs, signature, skip_verify)
        })
    }

    /// Restores checkpoint signatures of a session loaded from storage.
    pub fn restore_checkpoints(
        &self,
        id: &CoId,
        session_id: &SessionId,
        signature_after: std::collections::BTreeMap<u32, Signature>,
        bytes_since_last_signature: usize,
    ) {
        if let Ok(core) = self.lock().core_mut(id) {
            core.restore_checkpoints(session_id, signature_after, bytes_since_last_signature);
        }
    }

    pub fn mark_loading(&self, id: &CoId) {
        let _ = self.mutate(id, |state| {
            state.mark(id, EntryStatus::Loading);
            Ok(())
        });
    }

    pub fn mark_unavailable(&self, id: &CoId) {
        let _ = self.mutate(id, |state| {
            state.mark(id, EntryStatus::Unavailable);
            Ok(())
        });
    }

    // ── Loading ──────────────────────────────────────────────────

    async fn fetch(&self, id: &CoId) -> bool {
        if self.has(id) {
            return true;
        }
        let (loader, config) = {
            let state = self.lock();
            (state.loader.clone(), state.config.clone())
        };
        let Some(loader) = loader else {
            self.mark_unavailable(id);
            return false;
        };
        self.mark_loading(id);
        for attempt in 0..=config.load_retries {
            match tokio::time::timeout(config.load_timeout, loader.load(id)).await {
                Ok(true) => {}
                Ok(false) => debug!(id = %id, attempt, "covalue not found"),
                Err(_) => warn!(id = %id, attempt, "load timed out"),
            }
            if self.has(id) {
                return true;
            }
        }
        self.mark_unavailable(id);
        false
    }

    /// Loads `id` and the groups it depends on, then returns its content.
    pub async fn load(&self, id: &CoId) -> Result<Content, LoadError> {
        let mut todo = vec![id.clone()];
        let mut seen = HashSet::new();
        while let Some(next) = todo.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if !self.fetch(&next).await {
                continue;
            }
            let deps = self
                .with_core(&next, |core| {
                    let mut deps: Vec<CoId> = core.header().owner_group().cloned().into_iter().collect();
                    if matches!(core.header().ruleset, Ruleset::Group { .. }) {
                        deps.extend(declared_parents(core));
                    }
                    deps
                })
                .unwrap_or_default();
            todo.extend(deps);
        }
        match self.state(id) {
            CoValueState::Available(content) => Ok(content),
            CoValueState::Unauthorized => Err(LoadError::Unauthorized),
            CoValueState::Deleted => Err(LoadError::Deleted),
            CoValueState::Loading | CoValueState::Unavailable => Err(LoadError::Unavailable),
        }
    }

    /// Calls `listener` with the current state of `id` and on every change.
    ///
    /// Subscribing to an unknown value starts loading it in the background
    /// when a loader and a tokio runtime are available.
    pub fn subscribe(
        &self,
        id: &CoId,
        listener: impl Fn(&CoValueState) + Send + Sync + 'static,
    ) -> Subscription {
        let listener: Listener = Arc::new(listener);
        let (token, current, should_load) = {
            let mut state = self.lock();
            let token = state.next_listener;
            state.next_listener += 1;
            state
                .listeners
                .entry(id.clone())
                .or_default()
                .push((token, Arc::clone(&listener)));
            let should_load = !state.entries.contains_key(id) && state.loader.is_some();
            if should_load {
                state.mark(id, EntryStatus::Loading);
            }
            (token, state.state_of(id), should_load)
        };
        listener(&current);

        if should_load {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let node = self.clone();
                let id = id.clone();
                handle.spawn(async move {
                    if let Err(e) = node.load(&id).await {
                        debug!(id = %id, error = %e, "background load failed");
                    }
                });
            }
        }

        Subscription {
            id: id.clone(),
            token,
            state: Arc::downgrade(&self.state),
        }
    }
}

fn wrong_type(id: &CoId, expected: &'static str) -> CoreError {
    CoreError::WrongContentType {
        id: id.clone(),
        expected,
    }
}
