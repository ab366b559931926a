use cojson_storage::{
    LocalStorage, MemoryClient, SqliteClient, StorageApi, StoreOutcome, SyncStateUpdate,
    WorkerStorage,
};
use cojson_types::{
    AccountOrAgentId, AgentId, CoId, CoValueHeader, CoValuePriority, ContentMessage, KnownState,
    PeerId, SessionId, SessionNewContent, Transaction,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ── Helpers ──────────────────────────────────────────────────────

fn author() -> AccountOrAgentId {
    AgentId::parse("sealer_zAlice/signer_zAlice").unwrap().into()
}

fn session(suffix: &str) -> SessionId {
    SessionId::new(&author(), suffix)
}

fn delete_session() -> SessionId {
    SessionId::new_delete(&author(), "d1")
}

fn header() -> CoValueHeader {
    CoValueHeader::group(author(), serde_json::json!("storage-tests"))
}

fn tx(n: u64) -> Transaction {
    Transaction::Trusting {
        made_at: 1_000 + n,
        changes: format!("[{n}]"),
        meta: None,
    }
}

fn big_tx(n: u64) -> Transaction {
    Transaction::Trusting {
        made_at: 1_000 + n,
        changes: "x".repeat(60 * 1024),
        meta: None,
    }
}

fn content(id: &CoId, with_header: bool, sessions: Vec<(SessionId, u32, Vec<Transaction>, &str)>) -> ContentMessage {
    let mut msg = ContentMessage::new(id.clone(), CoValuePriority::High);
    if with_header {
        msg.header = Some(header());
    }
    for (session_id, after, new_transactions, signature) in sessions {
        msg.new.insert(
            session_id,
            SessionNewContent {
                after,
                new_transactions,
                last_signature: signature.to_string(),
            },
        );
    }
    msg
}

fn id(short: &str) -> CoId {
    CoId::from_short_hash(short)
}

/// Every backend, each with the temp dir it lives in.
fn make_storages() -> Vec<(&'static str, Box<dyn StorageApi>, TempDir)> {
    let memory_dir = TempDir::new().unwrap();
    let sqlite_dir = TempDir::new().unwrap();
    let redb_dir = TempDir::new().unwrap();
    let sqlite = SqliteClient::open(sqlite_dir.path().join("storage.db")).unwrap();
    let redb = WorkerStorage::open_redb(redb_dir.path().join("storage.redb")).unwrap();
    vec![
        ("memory", Box::new(LocalStorage::new(MemoryClient::new())) as Box<dyn StorageApi>, memory_dir),
        ("sqlite", Box::new(LocalStorage::new(sqlite)) as Box<dyn StorageApi>, sqlite_dir),
        ("redb", Box::new(redb) as Box<dyn StorageApi>, redb_dir),
    ]
}

// ── Store / load ────────────────────────────────────────────────

#[tokio::test]
async fn store_then_load_returns_same_content() {
    for (name, storage, _dir) in make_storages() {
        let value = id("roundtrip");
        let msg = content(
            &value,
            true,
            vec![
                (session("01"), 0, vec![tx(0), tx(1), tx(2)], "sig_s1"),
                (session("02"), 0, vec![tx(3), tx(4)], "sig_s2"),
            ],
        );

        assert_eq!(storage.store(msg.clone()).await.unwrap(), StoreOutcome::Stored, "{name}");
        let loaded = storage.load(&value).await.unwrap();
        assert_eq!(loaded, vec![msg], "{name}");

        let known = storage.load_known_state(&value).await.unwrap().unwrap();
        assert!(known.header, "{name}");
        assert_eq!(known.count(&session("01")), 3, "{name}");
        assert_eq!(known.count(&session("02")), 2, "{name}");
    }
}

#[tokio::test]
async fn load_of_unknown_value_is_empty() {
    for (name, storage, _dir) in make_storages() {
        assert!(storage.load(&id("missing")).await.unwrap().is_empty(), "{name}");
        assert!(storage.load_known_state(&id("missing")).await.unwrap().is_none(), "{name}");
    }
}

#[tokio::test]
async fn overlapping_content_is_appended_once() {
    for (name, storage, _dir) in make_storages() {
        let value = id("overlap");
        let s = session("01");
        storage
            .store(content(&value, true, vec![(s.clone(), 0, vec![tx(0), tx(1), tx(2)], "sig3")]))
            .await
            .unwrap();
        let outcome = storage
            .store(content(&value, false, vec![(s.clone(), 1, vec![tx(1), tx(2), tx(3)], "sig4")]))
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::Stored, "{name}");

        let loaded = storage.load(&value).await.unwrap();
        assert_eq!(loaded.len(), 1, "{name}");
        let piece = &loaded[0].new[&s];
        assert_eq!(piece.new_transactions, vec![tx(0), tx(1), tx(2), tx(3)], "{name}");
        assert_eq!(piece.last_signature, "sig4", "{name}");
    }
}

// ── Corrections ─────────────────────────────────────────────────

#[tokio::test]
async fn content_without_header_for_unknown_value_is_corrected() {
    for (name, storage, _dir) in make_storages() {
        let value = id("noheader");
        let outcome = storage
            .store(content(&value, false, vec![(session("01"), 0, vec![tx(0)], "sig")]))
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::Correction(KnownState::empty(value.clone())), "{name}");
        assert_eq!(storage.covalue_count().await.unwrap(), 0, "{name}");
    }
}

#[tokio::test]
async fn gap_after_stored_count_is_corrected_and_nothing_written() {
    for (name, storage, _dir) in make_storages() {
        let value = id("gap");
        let s1 = session("01");
        storage
            .store(content(&value, true, vec![(s1.clone(), 0, vec![tx(0)], "sig1")]))
            .await
            .unwrap();

        let outcome = storage
            .store(content(
                &value,
                false,
                vec![
                    (s1.clone(), 1, vec![tx(1)], "sig2"),
                    (session("02"), 5, vec![tx(9)], "sig9"),
                ],
            ))
            .await
            .unwrap();

        let mut expected = KnownState::empty(value.clone());
        expected.header = true;
        expected.sessions.insert(s1.clone(), 1);
        assert_eq!(outcome, StoreOutcome::Correction(expected.clone()), "{name}");
        assert_eq!(storage.load_known_state(&value).await.unwrap(), Some(expected), "{name}");
    }
}

// ── Signature checkpoints ───────────────────────────────────────

#[tokio::test]
async fn large_sessions_load_in_pieces_split_at_checkpoints() {
    for (name, storage, _dir) in make_storages() {
        let value = id("pieces");
        let s = session("01");
        storage
            .store(content(&value, true, vec![(s.clone(), 0, vec![big_tx(0)], "sig1")]))
            .await
            .unwrap();
        storage
            .store(content(&value, false, vec![(s.clone(), 1, vec![big_tx(1)], "sig2")]))
            .await
            .unwrap();
        storage
            .store(content(&value, false, vec![(s.clone(), 2, vec![big_tx(2)], "sig3")]))
            .await
            .unwrap();

        let loaded = storage.load(&value).await.unwrap();
        assert_eq!(loaded.len(), 2, "{name}");

        assert!(loaded[0].header.is_some(), "{name}");
        assert_eq!(
            loaded[0].expect_content_until,
            Some(BTreeMap::from([(s.clone(), 3)])),
            "{name}"
        );
        let first = &loaded[0].new[&s];
        assert_eq!(first.after, 0, "{name}");
        assert_eq!(first.new_transactions, vec![big_tx(0), big_tx(1)], "{name}");
        assert_eq!(first.last_signature, "sig2", "{name}");

        assert!(loaded[1].header.is_none(), "{name}");
        let second = &loaded[1].new[&s];
        assert_eq!(second.after, 2, "{name}");
        assert_eq!(second.new_transactions, vec![big_tx(2)], "{name}");
        assert_eq!(second.last_signature, "sig3", "{name}");
    }
}

// ── Deletion ────────────────────────────────────────────────────

#[tokio::test]
async fn erase_keeps_header_and_delete_session() {
    for (name, storage, _dir) in make_storages() {
        let value = id("deleted");
        storage
            .store(content(
                &value,
                true,
                vec![
                    (session("01"), 0, vec![tx(0), tx(1)], "sig1"),
                    (delete_session(), 0, vec![tx(2)], "sigd"),
                ],
            ))
            .await
            .unwrap();
        storage.mark_delete_as_valid(&value).await.unwrap();
        // marking twice is harmless
        storage.mark_delete_as_valid(&value).await.unwrap();

        let run = storage
            .erase_deleted(Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.erased, 1, "{name}");
        assert!(!run.has_more, "{name}");

        let loaded = storage.load(&value).await.unwrap();
        assert_eq!(loaded.len(), 1, "{name}");
        assert!(loaded[0].header.is_some(), "{name}");
        assert_eq!(loaded[0].new.keys().cloned().collect::<Vec<_>>(), vec![delete_session()], "{name}");

        let again = storage
            .erase_deleted(Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.erased, 0, "{name}");
    }
}

#[tokio::test]
async fn cancelled_erase_reports_more_work() {
    for (name, storage, _dir) in make_storages() {
        let value = id("pending");
        storage
            .store(content(&value, true, vec![(session("01"), 0, vec![tx(0)], "sig1")]))
            .await
            .unwrap();
        storage.mark_delete_as_valid(&value).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = storage.erase_deleted(Duration::from_secs(5), cancel).await.unwrap();
        assert_eq!(run.erased, 0, "{name}");
        assert!(run.has_more, "{name}");
        assert_eq!(storage.load(&value).await.unwrap()[0].new.len(), 1, "{name}");
    }
}

// ── Sync state tracking ─────────────────────────────────────────

#[tokio::test]
async fn unsynced_until_every_peer_confirms() {
    for (name, storage, _dir) in make_storages() {
        let (a, b) = (id("a"), id("b"));
        let (p1, p2) = (PeerId::new("p1"), PeerId::new("p2"));
        let update = |id: &CoId, peer: &PeerId, synced| SyncStateUpdate {
            id: id.clone(),
            peer: peer.clone(),
            synced,
        };

        storage
            .track_sync_state(vec![update(&a, &p1, false), update(&a, &p2, false), update(&b, &p1, false)])
            .await
            .unwrap();
        assert_eq!(storage.get_unsynced_ids().await.unwrap(), vec![a.clone(), b.clone()], "{name}");

        storage.track_sync_state(vec![update(&a, &p1, true)]).await.unwrap();
        assert_eq!(storage.get_unsynced_ids().await.unwrap(), vec![a.clone(), b.clone()], "{name}");

        storage.track_sync_state(vec![update(&a, &p2, true)]).await.unwrap();
        assert_eq!(storage.get_unsynced_ids().await.unwrap(), vec![b.clone()], "{name}");

        storage.stop_tracking(&b).await.unwrap();
        assert!(storage.get_unsynced_ids().await.unwrap().is_empty(), "{name}");
    }
}

// ── Listing ─────────────────────────────────────────────────────

#[tokio::test]
async fn ids_are_listed_in_insertion_order() {
    for (name, storage, _dir) in make_storages() {
        for short in ["c", "a", "b"] {
            storage
                .store(content(&id(short), true, vec![(session("01"), 0, vec![tx(0)], "sig")]))
                .await
                .unwrap();
        }
        assert_eq!(storage.covalue_count().await.unwrap(), 3, "{name}");
        assert_eq!(storage.covalue_ids(10, 0).await.unwrap(), vec![id("c"), id("a"), id("b")], "{name}");
        assert_eq!(storage.covalue_ids(1, 1).await.unwrap(), vec![id("a")], "{name}");
    }
}

// ── Persistence ─────────────────────────────────────────────────

#[tokio::test]
async fn sqlite_content_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("storage.db");
    let value = id("durable");
    let msg = content(&value, true, vec![(session("01"), 0, vec![tx(0), tx(1)], "sig")]);

    {
        let storage = LocalStorage::new(SqliteClient::open(&path).unwrap());
        storage.store(msg.clone()).await.unwrap();
    }

    let storage = LocalStorage::new(SqliteClient::open(&path).unwrap());
    assert_eq!(storage.load(&value).await.unwrap(), vec![msg]);
}

#[tokio::test]
async fn redb_content_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("storage.redb");
    let value = id("durable");
    let msg = content(&value, true, vec![(session("01"), 0, vec![tx(0), tx(1)], "sig")]);

    {
        let storage = WorkerStorage::open_redb(&path).unwrap();
        storage.store(msg.clone()).await.unwrap();
    }
    // the worker thread releases the file once its channel closes
    let mut reopened = None;
    for _ in 0..100 {
        match WorkerStorage::open_redb(&path) {
            Ok(storage) => {
                reopened = Some(storage);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    let storage = reopened.expect("redb file still locked");
    assert_eq!(storage.load(&value).await.unwrap(), vec![msg]);
}
