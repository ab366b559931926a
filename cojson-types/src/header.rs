//! Immutable value headers.
//!
//! The header decides what kind of content a value holds and who may write
//! it. Its canonical JSON is hashed into the value's [`CoId`](crate::CoId).

use crate::ids::{AccountOrAgentId, CoId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Storage type tag carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoValueType {
    Comap,
    Colist,
    Costream,
    Coplaintext,
}

/// Write-permission rules for a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Ruleset {
    /// The value is itself a group; its content is the role table.
    #[serde(rename = "group")]
    Group {
        #[serde(rename = "initialAdmin")]
        initial_admin: AccountOrAgentId,
    },
    /// Writes are checked against the roles of `group`.
    #[serde(rename = "ownedByGroup")]
    OwnedByGroup { group: CoId },
    /// Every transaction is accepted.
    #[serde(rename = "unsafeAllowAll")]
    UnsafeAllowAll,
}

/// The closed set of content reducers, derived from a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Map,
    List,
    Stream,
    PlainText,
    Group,
    Account,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoValueHeader {
    #[serde(rename = "type")]
    pub kind: CoValueType,
    pub ruleset: Ruleset,
    #[serde(default)]
    pub meta: Option<Value>,
    pub uniqueness: Value,
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

impl CoValueHeader {
    #[must_use]
    pub fn new(kind: CoValueType, ruleset: Ruleset, meta: Option<Value>, uniqueness: Value) -> Self {
        Self {
            kind,
            ruleset,
            meta,
            uniqueness,
            created_at: None,
        }
    }

    /// Header of a new group administered by `admin`.
    #[must_use]
    pub fn group(admin: AccountOrAgentId, uniqueness: Value) -> Self {
        Self::new(
            CoValueType::Comap,
            Ruleset::Group {
                initial_admin: admin,
            },
            None,
            uniqueness,
        )
    }

    /// Header of a new account whose first admin is its own agent.
    #[must_use]
    pub fn account(agent: AccountOrAgentId, uniqueness: Value) -> Self {
        Self::new(
            CoValueType::Comap,
            Ruleset::Group {
                initial_admin: agent,
            },
            Some(serde_json::json!({"type": "account"})),
            uniqueness,
        )
    }

    /// `meta.type`, if present.
    pub fn meta_type(&self) -> Option<&str> {
        self.meta.as_ref()?.get("type")?.as_str()
    }

    pub fn content_kind(&self) -> ContentKind {
        if self.meta_type() == Some("account") {
            return ContentKind::Account;
        }
        if matches!(self.ruleset, Ruleset::Group { .. }) {
            return ContentKind::Group;
        }
        match self.kind {
            CoValueType::Comap => ContentKind::Map,
            CoValueType::Colist => ContentKind::List,
            CoValueType::Costream => ContentKind::Stream,
            CoValueType::Coplaintext => ContentKind::PlainText,
        }
    }

    /// The owning group, for values governed by one.
    pub fn owner_group(&self) -> Option<&CoId> {
        match &self.ruleset {
            Ruleset::OwnedByGroup { group } => Some(group),
            _ => None,
        }
    }

    pub fn is_group_or_account(&self) -> bool {
        matches!(
            self.content_kind(),
            ContentKind::Group | ContentKind::Account
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::stable_json;
    use serde_json::json;

    fn agent() -> AccountOrAgentId {
        AccountOrAgentId::parse("sealer_zab/signer_zcd").unwrap()
    }

    #[test]
    fn ruleset_wire_form() {
        let owned = Ruleset::OwnedByGroup {
            group: CoId::from_short_hash("abc"),
        };
        assert_eq!(
            serde_json::to_value(&owned).unwrap(),
            json!({"type": "ownedByGroup", "group": "co_zabc"})
        );
        let allow: Ruleset = serde_json::from_value(json!({"type": "unsafeAllowAll"})).unwrap();
        assert_eq!(allow, Ruleset::UnsafeAllowAll);
    }

    #[test]
    fn content_kind_follows_ruleset_and_meta() {
        let group = CoValueHeader::group(agent(), json!("u"));
        assert_eq!(group.content_kind(), ContentKind::Group);

        let account = CoValueHeader::account(agent(), json!("u"));
        assert_eq!(account.content_kind(), ContentKind::Account);

        let list = CoValueHeader::new(
            CoValueType::Colist,
            Ruleset::UnsafeAllowAll,
            None,
            json!(null),
        );
        assert_eq!(list.content_kind(), ContentKind::List);
    }

    #[test]
    fn stable_json_sorts_header_keys() {
        let header = CoValueHeader::new(
            CoValueType::Comap,
            Ruleset::UnsafeAllowAll,
            None,
            json!("x"),
        );
        assert_eq!(
            stable_json(&header).unwrap(),
            r#"{"meta":null,"ruleset":{"type":"unsafeAllowAll"},"type":"comap","uniqueness":"x"}"#
        );
    }
}
