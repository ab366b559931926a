use cojson_types::{AccountOrAgentId, AgentId, CoId, KeyId, Member, OpId, SessionId};
use proptest::prelude::*;
use std::collections::HashSet;
use std::str::FromStr;

const AGENT: &str = "sealer_z0a1b/signer_z2c3d";

// ── CoId ──────────────────────────────────────────────────────────

#[test]
fn co_id_from_short_hash_has_prefix() {
    let id = CoId::from_short_hash("deadbeef");
    assert_eq!(id.as_str(), "co_zdeadbeef");
    assert_eq!(id.to_string(), "co_zdeadbeef");
}

#[test]
fn co_id_parse_rejects_bad_prefix() {
    assert!(CoId::parse("co_zabc").is_ok());
    assert!(CoId::parse("co_abc").is_err());
    assert!(CoId::parse("co_z").is_err());
    assert!(CoId::parse("co_zab/cd").is_err());
}

#[test]
fn co_id_serde_is_plain_string() {
    let id = CoId::from_short_hash("abc");
    assert_eq!(serde_json::to_string(&id).unwrap(), "\"co_zabc\"");
    let back: CoId = serde_json::from_str("\"co_zabc\"").unwrap();
    assert_eq!(back, id);
    assert!(serde_json::from_str::<CoId>("\"nope\"").is_err());
}

// ── AgentId ───────────────────────────────────────────────────────

#[test]
fn agent_id_parts() {
    let agent = AgentId::parse(AGENT).unwrap();
    assert_eq!(agent.sealer_id(), "sealer_z0a1b");
    assert_eq!(agent.signer_id(), "signer_z2c3d");
    assert_eq!(AgentId::from_parts("sealer_z0a1b", "signer_z2c3d"), agent);
}

#[test]
fn agent_id_rejects_malformed() {
    assert!(AgentId::parse("sealer_z0a1b").is_err());
    assert!(AgentId::parse("signer_z1/sealer_z2").is_err());
    assert!(AgentId::parse("sealer_z/signer_z").is_err());
}

#[test]
fn account_or_agent_dispatches_on_prefix() {
    let account = AccountOrAgentId::from_str("co_zabc").unwrap();
    assert!(account.as_account().is_some());
    let agent = AccountOrAgentId::from_str(AGENT).unwrap();
    assert!(agent.as_agent().is_some());
    assert_eq!(agent.to_string(), AGENT);
}

#[test]
fn member_everyone() {
    assert_eq!(Member::parse("everyone").unwrap(), Member::Everyone);
    assert_eq!(Member::Everyone.to_string(), "everyone");
    assert!(matches!(Member::parse("co_zabc").unwrap(), Member::Id(_)));
}

// ── SessionId ─────────────────────────────────────────────────────

#[test]
fn session_id_author_roundtrip() {
    let author = AccountOrAgentId::parse("co_zabc").unwrap();
    let session = SessionId::new(&author, "ff00");
    assert_eq!(session.as_str(), "co_zabc_session_zff00");
    assert_eq!(session.author().unwrap(), author);
    assert!(!session.is_delete());
}

#[test]
fn delete_session_shape() {
    let author = AccountOrAgentId::parse(AGENT).unwrap();
    let session = SessionId::new_delete(&author, "ab");
    assert!(session.as_str().ends_with("_session_dab$"));
    assert!(session.is_delete());
    assert_eq!(session.author().unwrap(), author);
}

#[test]
fn delete_marker_needs_trailing_dollar() {
    let session = SessionId::parse("co_zabc_session_dab").unwrap();
    assert!(!session.is_delete());
}

#[test]
fn session_id_parse_requires_valid_author() {
    assert!(SessionId::parse("garbage_session_z1").is_err());
    assert!(SessionId::parse("co_zabc").is_err());
}

#[test]
fn session_ids_hash_and_eq() {
    let a = SessionId::parse("co_zabc_session_z1").unwrap();
    let mut set = HashSet::new();
    set.insert(a.clone());
    set.insert(a);
    assert_eq!(set.len(), 1);
}

// ── KeyId / OpId ──────────────────────────────────────────────────

#[test]
fn key_id_prefix() {
    assert_eq!(KeyId::from_hex("12").as_str(), "key_z12");
    assert!(KeyId::parse("key_").is_err());
}

#[test]
fn op_id_wire_names() {
    let op = OpId::new(SessionId::parse("co_zabc_session_z1").unwrap(), 2, 3);
    let value = serde_json::to_value(&op).unwrap();
    assert_eq!(value["sessionID"], "co_zabc_session_z1");
    assert_eq!(value["txIndex"], 2);
    assert_eq!(value["changeIdx"], 3);
    assert_eq!(op.tx_id().tx_index, 2);
}

// ── Properties ────────────────────────────────────────────────────

proptest! {
    #[test]
    fn co_id_parse_accepts_any_hex(hash in "[0-9a-f]{1,40}") {
        let id = CoId::from_short_hash(&hash);
        prop_assert_eq!(CoId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn session_author_is_recovered(suffix in "[0-9a-f]{1,16}") {
        let author = AccountOrAgentId::parse(AGENT).unwrap();
        let session = SessionId::new(&author, &suffix);
        prop_assert_eq!(session.author().unwrap(), author);
    }
}
