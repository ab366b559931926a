use super::GroupContent;
use cojson_types::{AgentId, CoId, CoValueHeader};

/// An account: a group whose only founding admin is the account's agent,
/// plus pointers to its profile and root values.
#[derive(Debug, Clone)]
pub struct AccountContent {
    group: GroupContent,
}

impl AccountContent {
    pub(crate) fn new(id: CoId, header: &CoValueHeader) -> Self {
        Self {
            group: GroupContent::new(id, header),
        }
    }

    pub(crate) fn from_group(group: GroupContent) -> Self {
        Self { group }
    }

    pub fn id(&self) -> &CoId {
        self.group.id()
    }

    pub fn group(&self) -> &GroupContent {
        &self.group
    }

    /// The agent that founded the account and signs for it.
    pub fn agent_id(&self) -> Option<&AgentId> {
        self.group.initial_admin()?.as_agent()
    }

    pub fn profile(&self) -> Option<CoId> {
        self.group.profile()
    }

    pub fn root(&self) -> Option<CoId> {
        self.group.root()
    }
}
