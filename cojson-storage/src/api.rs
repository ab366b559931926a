//! The async storage surface used by the sync layer.

use crate::client::{DbClient, SessionUpdate, StoredSessionRow, SyncStateUpdate};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use cojson_types::{
    CoId, CoValuePriority, ContentMessage, KnownState, SessionId, SessionNewContent,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Bytes of transaction payload after which an in-between signature is kept.
pub const MAX_BYTES_BETWEEN_SIGNATURES: usize = 100 * 1024;

/// Result of [`StorageApi::store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// The message did not line up with what is stored; this is what is.
    Correction(KnownState),
}

/// Result of one bounded [`StorageApi::erase_deleted`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EraseRun {
    pub erased: usize,
    pub has_more: bool,
}

#[async_trait]
pub trait StorageApi: Send + Sync {
    /// The stored content of `id` as one or more messages. Empty when the
    /// value or its header is not stored.
    async fn load(&self, id: &CoId) -> StorageResult<Vec<ContentMessage>>;

    async fn load_known_state(&self, id: &CoId) -> StorageResult<Option<KnownState>>;

    /// Appends a content message atomically.
    async fn store(&self, msg: ContentMessage) -> StorageResult<StoreOutcome>;

    /// Queues a verified deleted value for erasure.
    async fn mark_delete_as_valid(&self, id: &CoId) -> StorageResult<()>;

    /// Erases queued values until the queue is empty, `budget` is spent or
    /// `cancel` fires.
    async fn erase_deleted(&self, budget: Duration, cancel: CancellationToken) -> StorageResult<EraseRun>;

    async fn track_sync_state(&self, updates: Vec<SyncStateUpdate>) -> StorageResult<()>;

    async fn get_unsynced_ids(&self) -> StorageResult<Vec<CoId>>;

    async fn stop_tracking(&self, id: &CoId) -> StorageResult<()>;

    async fn covalue_count(&self) -> StorageResult<u64>;

    async fn covalue_ids(&self, limit: usize, offset: usize) -> StorageResult<Vec<CoId>>;
}

// ── Shared logic over a blocking client ─────────────────────────

pub(crate) fn load_known_state(db: &mut dyn DbClient, id: &CoId) -> StorageResult<Option<KnownState>> {
    let Some(row) = db.get_covalue(id)? else {
        return Ok(None);
    };
    let mut state = KnownState::empty(id.clone());
    state.header = row.header.is_some();
    for session in db.get_covalue_sessions(row.row_id)? {
        state.sessions.insert(session.session_id, session.last_idx);
    }
    Ok(Some(state))
}

/// Transactions of one session split at its in-between signatures.
fn session_pieces(
    db: &mut dyn DbClient,
    session: &StoredSessionRow,
) -> StorageResult<Vec<SessionNewContent>> {
    if session.last_idx == 0 {
        return Ok(Vec::new());
    }
    let last = session.last_idx - 1;
    let mut txs = db
        .get_new_transactions_in_session(session.row_id, 0, last)?
        .into_iter();
    let mut pieces = Vec::new();
    let mut after = 0u32;
    for checkpoint in db.get_signatures(session.row_id, 0)? {
        if checkpoint.idx >= last {
            break;
        }
        let len = (checkpoint.idx + 1 - after) as usize;
        pieces.push(SessionNewContent {
            after,
            new_transactions: txs.by_ref().take(len).collect(),
            last_signature: checkpoint.signature,
        });
        after = checkpoint.idx + 1;
    }
    pieces.push(SessionNewContent {
        after,
        new_transactions: txs.collect(),
        last_signature: session.last_signature.clone(),
    });
    Ok(pieces)
}

pub(crate) fn load(db: &mut dyn DbClient, id: &CoId) -> StorageResult<Vec<ContentMessage>> {
    let Some(row) = db.get_covalue(id)? else {
        return Ok(Vec::new());
    };
    let Some(header) = row.header else {
        return Ok(Vec::new());
    };
    let priority = CoValuePriority::for_header(&header);
    let sessions = db.get_covalue_sessions(row.row_id)?;

    let mut first = ContentMessage::new(id.clone(), priority);
    first.header = Some(header);
    let mut messages = vec![first];
    let mut until = BTreeMap::new();
    for session in &sessions {
        until.insert(session.session_id.clone(), session.last_idx);
        for (i, piece) in session_pieces(db, session)?.into_iter().enumerate() {
            if messages.len() <= i {
                messages.push(ContentMessage::new(id.clone(), priority));
            }
            messages[i].new.insert(session.session_id.clone(), piece);
        }
    }
    if messages.len() > 1 {
        messages[0].expect_content_until = Some(until);
    }
    Ok(messages)
}

struct PlannedSession<'a> {
    session_id: &'a SessionId,
    stored: Option<StoredSessionRow>,
    skip: usize,
    content: &'a SessionNewContent,
}

pub(crate) fn store(db: &mut dyn DbClient, msg: &ContentMessage) -> StorageResult<StoreOutcome> {
    let mut outcome = StoreOutcome::Stored;
    db.transaction(&mut |db: &mut dyn DbClient| {
        outcome = store_in_transaction(db, msg)?;
        Ok(())
    })?;
    Ok(outcome)
}

fn store_in_transaction(db: &mut dyn DbClient, msg: &ContentMessage) -> StorageResult<StoreOutcome> {
    let existing = db.get_covalue(&msg.id)?;
    let has_header = existing.as_ref().is_some_and(|row| row.header.is_some());
    if !has_header && msg.header.is_none() {
        debug!(id = %msg.id, "content without header for unknown value");
        let state = load_known_state(db, &msg.id)?.unwrap_or_else(|| KnownState::empty(msg.id.clone()));
        return Ok(StoreOutcome::Correction(state));
    }

    // check every session before writing anything
    let mut planned = Vec::with_capacity(msg.new.len());
    for (session_id, content) in &msg.new {
        let stored = match &existing {
            Some(row) => db.get_single_covalue_session(row.row_id, session_id)?,
            None => None,
        };
        let stored_count = stored.as_ref().map_or(0, |s| s.last_idx);
        if content.after > stored_count {
            debug!(id = %msg.id, session = %session_id, after = content.after, stored = stored_count, "gap in stored session");
            let state = load_known_state(db, &msg.id)?.unwrap_or_else(|| KnownState::empty(msg.id.clone()));
            return Ok(StoreOutcome::Correction(state));
        }
        planned.push(PlannedSession {
            session_id,
            stored,
            skip: (stored_count - content.after) as usize,
            content,
        });
    }

    let covalue = db.upsert_covalue(&msg.id, msg.header.as_ref())?;
    for plan in planned {
        let new_txs = plan.content.new_transactions.get(plan.skip..).unwrap_or_default();
        if new_txs.is_empty() {
            continue;
        }
        let (session_row, stored_count, mut bytes) = match &plan.stored {
            Some(s) => (s.row_id, s.last_idx, s.bytes_since_last_signature),
            None => {
                let row = db.add_session_update(&SessionUpdate {
                    covalue,
                    session_id: plan.session_id.clone(),
                    last_idx: 0,
                    last_signature: String::new(),
                    bytes_since_last_signature: 0,
                })?;
                (row, 0, 0)
            }
        };
        for (offset, tx) in new_txs.iter().enumerate() {
            db.add_transaction(session_row, stored_count + offset as u32, tx)?;
            bytes += tx.size();
        }
        let new_last_idx = stored_count + new_txs.len() as u32;
        if bytes > MAX_BYTES_BETWEEN_SIGNATURES {
            db.add_signature_after(session_row, new_last_idx - 1, &plan.content.last_signature)?;
            bytes = 0;
        }
        db.add_session_update(&SessionUpdate {
            covalue,
            session_id: plan.session_id.clone(),
            last_idx: new_last_idx,
            last_signature: plan.content.last_signature.clone(),
            bytes_since_last_signature: bytes,
        })?;
    }
    Ok(StoreOutcome::Stored)
}

pub(crate) fn erase_deleted(
    db: &mut dyn DbClient,
    budget: Duration,
    cancel: &CancellationToken,
) -> StorageResult<EraseRun> {
    let started = Instant::now();
    let queue = db.get_all_covalues_waiting_for_delete()?;
    let mut run = EraseRun::default();
    for id in &queue {
        if cancel.is_cancelled() || started.elapsed() >= budget {
            run.has_more = true;
            break;
        }
        let result = db.transaction(&mut |db: &mut dyn DbClient| db.erase_covalue_but_keep_tombstone(id));
        match result {
            Ok(()) => run.erased += 1,
            Err(e) => warn!(id = %id, error = %e, "failed to erase deleted value"),
        }
    }
    debug!(erased = run.erased, has_more = run.has_more, "erase run finished");
    Ok(run)
}

// ── LocalStorage ─────────────────────────────────────────────────

/// A [`StorageApi`] over a blocking client, driven on tokio's blocking pool.
pub struct LocalStorage<C: DbClient + Send + 'static> {
    client: Arc<Mutex<C>>,
}

impl<C: DbClient + Send + 'static> Clone for LocalStorage<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
        }
    }
}

impl<C: DbClient + Send + 'static> LocalStorage<C> {
    pub fn new(client: C) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
        }
    }

    async fn run<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn DbClient) -> StorageResult<T> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            let mut client = client.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut *client)
        })
        .await
        .map_err(|e| {
            error!(error = %e, "storage task failed");
            StorageError::Task(e.to_string())
        })?
    }
}

#[async_trait]
impl<C: DbClient + Send + 'static> StorageApi for LocalStorage<C> {
    async fn load(&self, id: &CoId) -> StorageResult<Vec<ContentMessage>> {
        let id = id.clone();
        self.run(move |db| load(db, &id)).await
    }

    async fn load_known_state(&self, id: &CoId) -> StorageResult<Option<KnownState>> {
        let id = id.clone();
        self.run(move |db| load_known_state(db, &id)).await
    }

    async fn store(&self, msg: ContentMessage) -> StorageResult<StoreOutcome> {
        self.run(move |db| store(db, &msg)).await
    }

    async fn mark_delete_as_valid(&self, id: &CoId) -> StorageResult<()> {
        let id = id.clone();
        self.run(move |db| db.mark_covalue_as_deleted(&id)).await
    }

    async fn erase_deleted(&self, budget: Duration, cancel: CancellationToken) -> StorageResult<EraseRun> {
        self.run(move |db| erase_deleted(db, budget, &cancel)).await
    }

    async fn track_sync_state(&self, updates: Vec<SyncStateUpdate>) -> StorageResult<()> {
        self.run(move |db| db.track_covalues_sync_state(&updates)).await
    }

    async fn get_unsynced_ids(&self) -> StorageResult<Vec<CoId>> {
        self.run(|db| db.get_unsynced_covalue_ids()).await
    }

    async fn stop_tracking(&self, id: &CoId) -> StorageResult<()> {
        let id = id.clone();
        self.run(move |db| db.stop_tracking_sync_state(&id)).await
    }

    async fn covalue_count(&self) -> StorageResult<u64> {
        self.run(|db| db.get_covalue_count()).await
    }

    async fn covalue_ids(&self, limit: usize, offset: usize) -> StorageResult<Vec<CoId>> {
        self.run(move |db| db.get_covalue_ids(limit, offset)).await
    }
}
