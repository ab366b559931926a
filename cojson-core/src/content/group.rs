use crate::permissions::{ParentMapping, Role};
use cojson_crdt::LwwMap;
use cojson_types::{
    AccountOrAgentId, CoId, CoValueHeader, ContentKind, KeyId, Member, Ruleset, TxOrder,
};
use serde_json::{Map, Value};

pub(crate) const READ_KEY: &str = "readKey";
pub(crate) const PROFILE: &str = "profile";
pub(crate) const ROOT: &str = "root";
pub(crate) const PARENT_PREFIX: &str = "parent_";
pub(crate) const CHILD_PREFIX: &str = "child_";
pub(crate) const WRITE_KEY_PREFIX: &str = "writeKeyFor_";

/// Role table and key material of a group, built from its valid transactions.
#[derive(Debug, Clone)]
pub struct GroupContent {
    id: CoId,
    initial_admin: Option<AccountOrAgentId>,
    is_account: bool,
    entries: LwwMap<Value>,
}

impl GroupContent {
    pub(crate) fn new(id: CoId, header: &CoValueHeader) -> Self {
        let initial_admin = match &header.ruleset {
            Ruleset::Group { initial_admin } => Some(initial_admin.clone()),
            _ => None,
        };
        Self {
            id,
            initial_admin,
            is_account: header.content_kind() == ContentKind::Account,
            entries: LwwMap::new(),
        }
    }

    pub(crate) fn record(&mut self, key: String, value: Value, order: TxOrder) {
        self.entries.set(key, order, 0, value);
    }

    pub fn id(&self) -> &CoId {
        &self.id
    }

    pub fn initial_admin(&self) -> Option<&AccountOrAgentId> {
        self.initial_admin.as_ref()
    }

    pub fn is_account(&self) -> bool {
        self.is_account
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_at(&self, key: &str, time: u64) -> Option<&Value> {
        self.entries.get_at(key, time)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.entries()
    }

    pub fn as_object(&self) -> Map<String, Value> {
        self.entries
            .entries()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    /// Role set directly on `member` as of `time`, revocations included.
    pub fn direct_role_at(&self, member: &str, time: u64) -> Option<Role> {
        self.entries.get_at(member, time)?.as_str().and_then(Role::parse)
    }

    pub fn direct_role(&self, member: &str) -> Option<Role> {
        self.direct_role_at(member, u64::MAX)
    }

    /// Members with a current direct role, `everyone` included.
    pub fn members(&self) -> Vec<(Member, Role)> {
        self.entries
            .entries()
            .filter_map(|(key, value)| {
                let member = Member::parse(key).ok()?;
                let role = value.as_str().and_then(Role::parse)?;
                Some((member, role))
            })
            .collect()
    }

    /// Id of the current read key.
    pub fn read_key_id(&self) -> Option<KeyId> {
        self.read_key_id_at(u64::MAX)
    }

    pub fn read_key_id_at(&self, time: u64) -> Option<KeyId> {
        KeyId::parse(self.entries.get_at(READ_KEY, time)?.as_str()?).ok()
    }

    /// Dedicated write key of a write-only member.
    pub fn write_key_for(&self, member: &str) -> Option<KeyId> {
        let value = self.entries.get(&format!("{WRITE_KEY_PREFIX}{member}"))?;
        KeyId::parse(value.as_str()?).ok()
    }

    /// Parent groups and how their roles map into this group, as of `time`.
    pub fn parents_at(&self, time: u64) -> Vec<(CoId, ParentMapping)> {
        self.entries
            .all_keys()
            .filter_map(|key| {
                let parent = CoId::parse(key.strip_prefix(PARENT_PREFIX)?).ok()?;
                let mapping = ParentMapping::parse(self.entries.get_at(key, time)?.as_str()?)?;
                Some((parent, mapping))
            })
            .collect()
    }

    pub fn parents(&self) -> Vec<(CoId, ParentMapping)> {
        self.parents_at(u64::MAX)
    }

    pub fn children(&self) -> Vec<CoId> {
        self.entries
            .keys()
            .filter_map(|key| CoId::parse(key.strip_prefix(CHILD_PREFIX)?).ok())
            .collect()
    }

    pub fn profile(&self) -> Option<CoId> {
        CoId::parse(self.entries.get(PROFILE)?.as_str()?).ok()
    }

    pub fn root(&self) -> Option<CoId> {
        CoId::parse(self.entries.get(ROOT)?.as_str()?).ok()
    }
}
