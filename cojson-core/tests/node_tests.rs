use async_trait::async_trait;
use cojson_core::{
    CoValueLoader, CoValueState, CoreError, LIST_COMPACTION_INTERVAL, LoadError, LocalNode,
    NodeConfig, Privacy, Role,
};
use cojson_crypto::Signature;
use cojson_types::{CoId, Member, Transaction};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Helpers ──────────────────────────────────────────────────────

fn make_node(name: &str) -> LocalNode {
    LocalNode::with_new_account(name, NodeConfig::default()).unwrap()
}

fn account(node: &LocalNode) -> CoId {
    node.account_id().unwrap()
}

fn member(node: &LocalNode) -> Member {
    Member::Id(node.member_id())
}

/// Copies whatever `to` is missing of `id` from `from`, verifying signatures.
fn sync_value(from: &LocalNode, to: &LocalNode, id: &CoId) {
    let known = to.known_state(id);
    let Some(messages) = from.new_content_since(id, known.as_ref()) else {
        return;
    };
    for message in messages {
        if let Some(header) = message.header {
            to.ensure_header(&message.id, header).unwrap();
        }
        for (session, content) in message.new {
            let signature = Signature::parse(&content.last_signature).unwrap();
            to.try_add_transactions(&message.id, &session, content.new_transactions, &signature, false)
                .unwrap();
        }
    }
}

fn sync_all(from: &LocalNode, to: &LocalNode, ids: &[&CoId]) {
    for id in ids {
        sync_value(from, to, id);
    }
}

fn pause() {
    std::thread::sleep(Duration::from_millis(5));
}

/// Alice owns a group with a list and Bob holds `role` in it; both nodes
/// have everything.
fn shared_list(role: Role) -> (LocalNode, LocalNode, CoId, CoId) {
    let alice = make_node("alice");
    let bob = make_node("bob");
    sync_value(&bob, &alice, &account(&bob));

    let group = alice.create_group().unwrap();
    alice.add_member(&group, &member(&bob), role).unwrap();
    let list = alice.create_list(&group).unwrap();
    sync_all(&alice, &bob, &[&account(&alice), &group, &list]);
    pause();
    (alice, bob, group, list)
}

// ── Accounts ─────────────────────────────────────────────────────

#[test]
fn new_account_has_public_profile() {
    let node = make_node("alice");
    let account_id = account(&node);
    let content = node.content(&account_id).unwrap();
    let profile = content.as_account().unwrap().profile().unwrap();

    let profile_content = node.content(&profile).unwrap();
    assert_eq!(profile_content.as_map().unwrap().get("name"), Some(&json!("alice")));

    let other = make_node("bob");
    let profile_group = node.header(&profile).unwrap().owner_group().cloned().unwrap();
    sync_all(&node, &other, &[&account_id, &profile_group, &profile]);
    assert_eq!(other.my_role(&profile_group).unwrap(), Some(Role::Reader));
    match other.state(&profile) {
        CoValueState::Available(content) => {
            assert_eq!(content.as_map().unwrap().get("name"), Some(&json!("alice")));
        }
        state => panic!("unexpected state {state:?}"),
    }
}

#[test]
fn account_agent_is_admin_of_account() {
    let node = make_node("alice");
    let account_id = account(&node);
    assert_eq!(node.my_role(&account_id).unwrap(), Some(Role::Admin));
    let content = node.content(&account_id).unwrap();
    assert_eq!(content.as_account().unwrap().agent_id(), Some(&node.agent_id()));
}

// ── Content operations ───────────────────────────────────────────

#[test]
fn map_set_and_delete() {
    let node = make_node("alice");
    let group = node.create_group().unwrap();
    let map = node.create_map(&group).unwrap();

    node.map_set(&map, "color", json!("red"), Privacy::Private).unwrap();
    node.map_set(&map, "size", json!(3), Privacy::Trusting).unwrap();
    node.map_delete(&map, "color", Privacy::Private).unwrap();

    let content = node.content(&map).unwrap();
    let map_content = content.as_map().unwrap();
    assert_eq!(map_content.get("color"), None);
    assert_eq!(map_content.get("size"), Some(&json!(3)));
    assert_eq!(content.to_json(), json!({"size": 3}));
}

#[test]
fn list_operations() {
    let node = make_node("alice");
    let group = node.create_group().unwrap();
    let list = node.create_list(&group).unwrap();

    node.list_append(&list, json!("a"), None, Privacy::Private).unwrap();
    node.list_append(&list, json!("b"), None, Privacy::Private).unwrap();
    node.list_append(&list, json!("c"), None, Privacy::Private).unwrap();
    node.list_prepend(&list, json!("z"), None, Privacy::Private).unwrap();
    assert_eq!(node.content(&list).unwrap().to_json(), json!(["z", "a", "b", "c"]));

    node.list_delete(&list, 1, Privacy::Private).unwrap();
    node.list_replace(&list, 2, json!("C"), Privacy::Private).unwrap();
    assert_eq!(node.content(&list).unwrap().to_json(), json!(["z", "b", "C"]));

    let err = node.list_delete(&list, 7, Privacy::Private).unwrap_err();
    assert!(matches!(err, CoreError::InvalidIndex { index: 7, len: 3 }));
}

#[test]
fn list_append_items_in_one_transaction() {
    let node = make_node("alice");
    let group = node.create_group().unwrap();
    let list = node.create_list(&group).unwrap();

    node.list_append_items(&list, vec![json!(1), json!(2)], None, Privacy::Trusting)
        .unwrap();
    node.list_append_items(&list, vec![json!("x"), json!("y")], Some(0), Privacy::Trusting)
        .unwrap();
    assert_eq!(node.content(&list).unwrap().to_json(), json!([1, "x", "y", 2]));
}

#[test]
fn plaintext_insert_and_delete() {
    let node = make_node("alice");
    let group = node.create_group().unwrap();
    let text = node.create_plaintext(&group).unwrap();

    node.text_insert_after(&text, None, "world", Privacy::Private).unwrap();
    node.text_insert_after(&text, None, "hello ", Privacy::Private).unwrap();
    node.text_insert_after(&text, Some(4), ",", Privacy::Private).unwrap();
    assert_eq!(node.content(&text).unwrap().to_json(), json!("hello, world"));

    node.text_delete_range(&text, 5, 6, Privacy::Private).unwrap();
    assert_eq!(node.content(&text).unwrap().to_json(), json!("hello world"));
    assert!(node.text_delete_range(&text, 3, 99, Privacy::Private).is_err());
}

#[test]
fn stream_push_keeps_items_per_session() {
    let node = make_node("alice");
    let group = node.create_group().unwrap();
    let stream = node.create_stream(&group).unwrap();

    node.stream_push(&stream, json!({"n": 1}), Privacy::Private).unwrap();
    node.stream_push(&stream, json!({"n": 2}), Privacy::Private).unwrap();

    let content = node.content(&stream).unwrap();
    let items = content.as_stream().unwrap();
    assert_eq!(items.len(), 2);
    let latest = items.latest_by_session();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest.values().next().unwrap().value, json!({"n": 2}));
}

#[test]
fn wrong_content_type_is_rejected() {
    let node = make_node("alice");
    let group = node.create_group().unwrap();
    let map = node.create_map(&group).unwrap();
    let err = node.list_append(&map, json!(1), None, Privacy::Private).unwrap_err();
    assert!(matches!(err, CoreError::WrongContentType { expected: "list", .. }));
}

#[test]
fn rebuild_matches_incremental_content() {
    let node = make_node("alice");
    let group = node.create_group().unwrap();
    let list = node.create_list(&group).unwrap();
    for i in 0..10 {
        node.list_append(&list, json!(i), None, Privacy::Private).unwrap();
        // read in between so the cached content is extended incrementally
        node.content(&list).unwrap();
    }
    node.list_delete(&list, 3, Privacy::Private).unwrap();

    let incremental = node.content(&list).unwrap().to_json();
    let rebuilt = node.rebuild_content(&list).unwrap().to_json();
    assert_eq!(incremental, rebuilt);
}

// ── Sync between nodes ───────────────────────────────────────────

#[test]
fn concurrent_appends_converge() {
    let (alice, bob, _group, list) = shared_list(Role::Writer);

    for i in 0..50 {
        alice.list_append(&list, json!(format!("a{i}")), None, Privacy::Private).unwrap();
        bob.list_append(&list, json!(format!("b{i}")), None, Privacy::Private).unwrap();
    }
    sync_value(&alice, &bob, &list);
    sync_value(&bob, &alice, &list);

    let on_alice = alice.content(&list).unwrap().to_json();
    let on_bob = bob.content(&list).unwrap().to_json();
    assert_eq!(on_alice.as_array().unwrap().len(), 100);
    assert_eq!(on_alice, on_bob);
    assert_eq!(alice.known_state(&list), bob.known_state(&list));
}

// ── List compaction ──────────────────────────────────────────────

#[test]
fn long_list_is_compacted_without_changing_order() {
    let node = make_node("alice");
    let group = node.create_group().unwrap();
    let list = node.create_list(&group).unwrap();
    for i in 0..1000 {
        node.list_append(&list, json!(i), None, Privacy::Trusting).unwrap();
    }

    let content = node.content(&list).unwrap();
    let items = content.as_list().unwrap();
    assert!(items.span_count() >= 1);
    let expected: Vec<_> = (0..1000).map(|i| json!(i)).collect();
    assert_eq!(items.as_array(), expected);

    let stats = items.compaction_stats();
    assert_eq!(stats.linear_chains, 1);
    assert_eq!(stats.max_chain_length, 1000);
}

#[test]
fn short_list_is_left_uncompacted() {
    let node = make_node("alice");
    let group = node.create_group().unwrap();
    let list = node.create_list(&group).unwrap();
    for i in 0..10 {
        node.list_append(&list, json!(i), None, Privacy::Trusting).unwrap();
    }
    let content = node.content(&list).unwrap();
    assert_eq!(content.as_list().unwrap().span_count(), 0);
}

#[test]
fn long_text_is_compacted() {
    let node = make_node("alice");
    let group = node.create_group().unwrap();
    let text = node.create_plaintext(&group).unwrap();
    node.text_insert_after(&text, None, "a", Privacy::Trusting).unwrap();
    for i in 1..LIST_COMPACTION_INTERVAL + 10 {
        node.text_insert_after(&text, Some(i - 1), "b", Privacy::Trusting).unwrap();
    }

    let content = node.content(&text).unwrap();
    let chars = content.as_plaintext().unwrap();
    assert!(chars.span_count() >= 1);
    assert_eq!(chars.len(), LIST_COMPACTION_INTERVAL + 10);
    assert!(chars.to_string().starts_with("ab"));
}

#[test]
fn compacted_lists_converge_with_uncompacted_rebuild() {
    let (alice, bob, _group, list) = shared_list(Role::Writer);
    let per_node = LIST_COMPACTION_INTERVAL + 44;

    for i in 0..per_node {
        alice.list_append(&list, json!(format!("a{i}")), None, Privacy::Trusting).unwrap();
        bob.list_append(&list, json!(format!("b{i}")), None, Privacy::Trusting).unwrap();
    }
    assert!(alice.content(&list).unwrap().as_list().unwrap().span_count() >= 1);
    assert!(bob.content(&list).unwrap().as_list().unwrap().span_count() >= 1);

    sync_value(&alice, &bob, &list);
    sync_value(&bob, &alice, &list);
    let on_alice = alice.content(&list).unwrap().to_json();
    let on_bob = bob.content(&list).unwrap().to_json();
    assert_eq!(on_alice.as_array().unwrap().len(), 2 * per_node);
    assert_eq!(on_alice, on_bob);
    assert_eq!(on_alice, alice.rebuild_content(&list).unwrap().to_json());

    // edits in the middle of compacted chains, applied incrementally
    alice.list_append(&list, json!("mid-a"), Some(10), Privacy::Trusting).unwrap();
    bob.list_delete(&list, 20, Privacy::Trusting).unwrap();
    bob.list_append(&list, json!("mid-b"), Some(per_node), Privacy::Trusting).unwrap();
    sync_value(&alice, &bob, &list);
    sync_value(&bob, &alice, &list);

    let on_alice = alice.content(&list).unwrap().to_json();
    assert_eq!(on_alice, bob.content(&list).unwrap().to_json());
    assert_eq!(on_alice, alice.rebuild_content(&list).unwrap().to_json());
    assert_eq!(on_alice, bob.rebuild_content(&list).unwrap().to_json());
    assert_eq!(on_alice.as_array().unwrap().len(), 2 * per_node + 1);
}

#[test]
fn member_decrypts_private_content_and_outsider_cannot() {
    let alice = make_node("alice");
    let bob = make_node("bob");
    let carol = make_node("carol");
    sync_value(&bob, &alice, &account(&bob));

    let group = alice.create_group().unwrap();
    alice.add_member(&group, &member(&bob), Role::Reader).unwrap();
    let map = alice.create_map(&group).unwrap();
    alice.map_set(&map, "secret", json!("x"), Privacy::Private).unwrap();

    let ids = [&account(&alice), &group, &map];
    sync_all(&alice, &bob, &ids);
    sync_all(&alice, &carol, &ids);

    let content = bob.content(&map).unwrap();
    assert_eq!(content.as_map().unwrap().get("secret"), Some(&json!("x")));
    assert!(matches!(carol.state(&map), CoValueState::Unauthorized));
}

#[test]
fn reader_cannot_write() {
    let (_alice, bob, _group, list) = shared_list(Role::Reader);
    let err = bob.list_append(&list, json!(1), None, Privacy::Private).unwrap_err();
    assert!(matches!(err, CoreError::Unauthorized { .. }));
}

#[test]
fn revoked_member_writes_are_ignored() {
    let (alice, bob, group, list) = shared_list(Role::Writer);
    bob.list_append(&list, json!("before"), None, Privacy::Private).unwrap();
    sync_value(&bob, &alice, &list);

    alice.remove_member(&group, &member(&bob)).unwrap();
    pause();
    // bob has not seen the revocation yet
    bob.list_append(&list, json!("after"), None, Privacy::Private).unwrap();
    sync_value(&bob, &alice, &list);

    assert_eq!(alice.content(&list).unwrap().to_json(), json!(["before"]));
    assert_eq!(alice.role_in(&group, &bob.member_id()).unwrap(), None);

    sync_value(&alice, &bob, &group);
    assert_eq!(bob.content(&list).unwrap().to_json(), json!(["before"]));
}

#[test]
fn rotated_key_is_readable_by_remaining_members() {
    let alice = make_node("alice");
    let bob = make_node("bob");
    let carol = make_node("carol");
    sync_all(&bob, &alice, &[&account(&bob)]);
    sync_all(&carol, &alice, &[&account(&carol)]);

    let group = alice.create_group().unwrap();
    alice.add_member(&group, &member(&bob), Role::Reader).unwrap();
    alice.add_member(&group, &member(&carol), Role::Reader).unwrap();
    alice.remove_member(&group, &member(&carol)).unwrap();

    let map = alice.create_map(&group).unwrap();
    alice.map_set(&map, "k", json!("v"), Privacy::Private).unwrap();
    sync_all(&alice, &bob, &[&account(&alice), &group, &map]);
    let content = bob.content(&map).unwrap();
    assert_eq!(content.as_map().unwrap().get("k"), Some(&json!("v")));
}

#[test]
fn write_only_member_can_write_but_not_read() {
    let (alice, bob, _group, list) = shared_list(Role::WriteOnly);
    alice.list_append(&list, json!("from alice"), None, Privacy::Private).unwrap();
    sync_value(&alice, &bob, &list);
    bob.list_append(&list, json!("from bob"), None, Privacy::Private).unwrap();
    sync_value(&bob, &alice, &list);

    let on_alice = alice.content(&list).unwrap().to_json();
    assert_eq!(on_alice.as_array().unwrap().len(), 2);
    assert!(matches!(bob.state(&list), CoValueState::Available(_)));
    let on_bob = bob.content(&list).unwrap().to_json();
    assert_eq!(on_bob, json!(["from bob"]));
}

#[test]
fn direct_write_only_outranks_everyone_reader() {
    let alice = make_node("alice");
    let bob = make_node("bob");
    let carol = make_node("carol");
    sync_value(&bob, &alice, &account(&bob));

    let group = alice.create_group().unwrap();
    alice.add_member(&group, &Member::Everyone, Role::Reader).unwrap();
    alice.add_member(&group, &member(&bob), Role::WriteOnly).unwrap();

    let bob_role = alice.role_in(&group, &bob.member_id()).unwrap();
    assert_eq!(bob_role, Some(Role::WriteOnly));
    assert!(!bob_role.unwrap().can_read());
    assert_eq!(alice.role_in(&group, &carol.member_id()).unwrap(), Some(Role::Reader));
}

#[test]
fn everyone_writer_lifts_direct_reader() {
    let alice = make_node("alice");
    let bob = make_node("bob");
    sync_value(&bob, &alice, &account(&bob));

    let group = alice.create_group().unwrap();
    alice.add_member(&group, &member(&bob), Role::Reader).unwrap();
    alice.add_member(&group, &Member::Everyone, Role::Writer).unwrap();

    assert_eq!(alice.role_in(&group, &bob.member_id()).unwrap(), Some(Role::Writer));
}

#[test]
fn tampered_transactions_are_rejected() {
    let alice = make_node("alice");
    let bob = make_node("bob");
    let group = alice.create_group().unwrap();
    let map = alice.create_map(&group).unwrap();
    alice.map_set(&map, "k", json!(1), Privacy::Trusting).unwrap();
    sync_all(&alice, &bob, &[&account(&alice), &group]);

    let mut messages = alice.new_content_since(&map, None).unwrap();
    let mut message = messages.remove(0);
    bob.ensure_header(&map, message.header.take().unwrap()).unwrap();
    let (session, mut content) = message.new.into_iter().next().unwrap();
    if let Some(Transaction::Trusting { changes, .. }) = content.new_transactions.first_mut() {
        *changes = json!([{"op": "set", "key": "k", "value": 2}]).to_string();
    }
    let signature = Signature::parse(&content.last_signature).unwrap();
    let err = bob
        .try_add_transactions(&map, &session, content.new_transactions, &signature, false)
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidSignature { .. }));
    assert_eq!(bob.known_state(&map).unwrap().count(&session), 0);
}

#[test]
fn unknown_author_account_is_a_missing_dependency() {
    let alice = make_node("alice");
    let bob = make_node("bob");
    let group = alice.create_group().unwrap();
    let err = {
        let messages = alice.new_content_since(&group, None).unwrap();
        let message = messages.into_iter().next().unwrap();
        bob.ensure_header(&group, message.header.unwrap()).unwrap();
        let (session, content) = message.new.into_iter().next().unwrap();
        let signature = Signature::parse(&content.last_signature).unwrap();
        bob.try_add_transactions(&group, &session, content.new_transactions, &signature, false)
            .unwrap_err()
    };
    assert!(matches!(err, CoreError::MissingDependency { .. }));
}

// ── Deletion ─────────────────────────────────────────────────────

#[test]
fn deleted_value_rejects_writes_and_syncs_tombstone() {
    let alice = make_node("alice");
    let bob = make_node("bob");
    let group = alice.create_group().unwrap();
    let map = alice.create_map(&group).unwrap();
    alice.map_set(&map, "k", json!(1), Privacy::Private).unwrap();
    sync_all(&alice, &bob, &[&account(&alice), &group, &map]);

    alice.delete_value(&map).unwrap();
    assert!(alice.is_deleted(&map));
    assert!(matches!(alice.state(&map), CoValueState::Deleted));
    let err = alice.map_set(&map, "k", json!(2), Privacy::Private).unwrap_err();
    assert!(matches!(err, CoreError::DeletedCoValue(_)));

    let known = alice.known_state(&map).unwrap();
    assert_eq!(known.sessions.len(), 1);
    assert!(known.sessions.keys().all(|s| s.is_delete()));

    sync_value(&alice, &bob, &map);
    assert!(bob.is_deleted(&map));
}

#[test]
fn groups_cannot_be_deleted() {
    let node = make_node("alice");
    let group = node.create_group().unwrap();
    let err = node.delete_value(&group).unwrap_err();
    assert!(matches!(err, CoreError::DeleteTransactionRejected { .. }));
}

#[test]
fn non_admin_cannot_delete() {
    let (_alice, bob, _group, list) = shared_list(Role::Writer);
    let err = bob.delete_value(&list).unwrap_err();
    assert!(matches!(err, CoreError::Unauthorized { .. }));
}

// ── Group extension ──────────────────────────────────────────────

#[test]
fn parent_members_inherit_capped_role() {
    let alice = make_node("alice");
    let bob = make_node("bob");
    sync_value(&bob, &alice, &account(&bob));

    let parent = alice.create_group().unwrap();
    let child = alice.create_group().unwrap();
    alice.add_member(&parent, &member(&bob), Role::Admin).unwrap();
    alice
        .extend_group(&child, &parent, cojson_core::ParentMapping::Role(Role::Writer))
        .unwrap();

    assert_eq!(alice.role_in(&child, &bob.member_id()).unwrap(), Some(Role::Writer));

    let map = alice.create_map(&child).unwrap();
    alice.map_set(&map, "k", json!("v"), Privacy::Private).unwrap();
    sync_all(&alice, &bob, &[&account(&alice), &parent, &child, &map]);
    let content = bob.content(&map).unwrap();
    assert_eq!(content.as_map().unwrap().get("k"), Some(&json!("v")));
}

#[test]
fn extension_cycle_is_ignored() {
    let node = make_node("alice");
    let a = node.create_group().unwrap();
    let b = node.create_group().unwrap();
    node.extend_group(&a, &b, cojson_core::ParentMapping::Extend).unwrap();
    node.extend_group(&b, &a, cojson_core::ParentMapping::Extend).unwrap();

    let b_content = node.content(&b).unwrap();
    assert!(b_content.as_group().unwrap().parents().is_empty());
    let a_content = node.content(&a).unwrap();
    assert_eq!(a_content.as_group().unwrap().parents().len(), 1);
}

// ── Subscriptions and loading ────────────────────────────────────

#[test]
fn subscription_sees_updates_until_dropped() {
    let node = make_node("alice");
    let group = node.create_group().unwrap();
    let map = node.create_map(&group).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = node.subscribe(&map, move |state| {
        if let CoValueState::Available(content) = state {
            sink.lock().unwrap().push(content.to_json());
        }
    });
    node.map_set(&map, "k", json!(1), Privacy::Private).unwrap();
    drop(subscription);
    node.map_set(&map, "k", json!(2), Privacy::Private).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, vec![json!({}), json!({"k": 1})]);
}

struct CopyLoader {
    source: LocalNode,
    target: LocalNode,
    accounts: Vec<CoId>,
}

#[async_trait]
impl CoValueLoader for CopyLoader {
    async fn load(&self, id: &CoId) -> bool {
        for account in &self.accounts {
            sync_value(&self.source, &self.target, account);
        }
        sync_value(&self.source, &self.target, id);
        self.target.has(id)
    }
}

#[tokio::test]
async fn load_fetches_value_and_its_group() {
    let alice = make_node("alice");
    let bob = make_node("bob");
    sync_value(&bob, &alice, &account(&bob));
    let group = alice.create_group().unwrap();
    alice.add_member(&group, &member(&bob), Role::Reader).unwrap();
    let map = alice.create_map(&group).unwrap();
    alice.map_set(&map, "k", json!("v"), Privacy::Private).unwrap();

    bob.set_loader(Arc::new(CopyLoader {
        source: alice.clone(),
        target: bob.clone(),
        accounts: vec![account(&alice)],
    }));
    let content = bob.load(&map).await.unwrap();
    assert_eq!(content.as_map().unwrap().get("k"), Some(&json!("v")));
    assert!(bob.has(&group));
}

#[tokio::test]
async fn load_of_unknown_value_is_unavailable() {
    let alice = make_node("alice");
    let bob = make_node("bob");
    bob.set_loader(Arc::new(CopyLoader {
        source: alice.clone(),
        target: bob.clone(),
        accounts: Vec::new(),
    }));
    let missing = CoId::parse("co_zmissing").unwrap();
    assert_eq!(bob.load(&missing).await.unwrap_err(), LoadError::Unavailable);
    assert!(matches!(bob.state(&missing), CoValueState::Unavailable));
}

#[test]
fn local_changes_stream_reports_writes() {
    let node = make_node("alice");
    let mut changes = node.take_local_changes().unwrap();
    assert!(node.take_local_changes().is_none());
    let group = node.create_group().unwrap();
    let mut seen = Vec::new();
    while let Ok(id) = changes.try_recv() {
        seen.push(id);
    }
    assert!(seen.contains(&group));
    assert!(seen.contains(&account(&node)));
}
