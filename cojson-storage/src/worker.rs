//! Storage on a dedicated thread.
//!
//! The thread owns the [`DbClient`]. Callers never touch it: they send a
//! [`Request`] tagged with a request id and wait for the reply registered
//! under that id.

use crate::api::{self, EraseRun, StorageApi, StoreOutcome};
use crate::client::{DbClient, SyncStateUpdate};
use crate::error::{StorageError, StorageResult};
use crate::redb_store::RedbClient;
use async_trait::async_trait;
use cojson_types::{CoId, ContentMessage, KnownState};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

enum Op {
    Load(CoId),
    LoadKnownState(CoId),
    Store(ContentMessage),
    MarkDeleteAsValid(CoId),
    EraseDeleted(Duration, CancellationToken),
    TrackSyncState(Vec<SyncStateUpdate>),
    GetUnsyncedIds,
    StopTracking(CoId),
    CovalueCount,
    CovalueIds { limit: usize, offset: usize },
}

enum Reply {
    Messages(Vec<ContentMessage>),
    KnownState(Option<KnownState>),
    Stored(StoreOutcome),
    Erased(EraseRun),
    Ids(Vec<CoId>),
    Count(u64),
    Done,
}

struct Request {
    request_id: u64,
    op: Op,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<StorageResult<Reply>>>>>;

fn execute(db: &mut dyn DbClient, op: Op) -> StorageResult<Reply> {
    Ok(match op {
        Op::Load(id) => Reply::Messages(api::load(db, &id)?),
        Op::LoadKnownState(id) => Reply::KnownState(api::load_known_state(db, &id)?),
        Op::Store(msg) => Reply::Stored(api::store(db, &msg)?),
        Op::MarkDeleteAsValid(id) => {
            db.mark_covalue_as_deleted(&id)?;
            Reply::Done
        }
        Op::EraseDeleted(budget, cancel) => Reply::Erased(api::erase_deleted(db, budget, &cancel)?),
        Op::TrackSyncState(updates) => {
            db.track_covalues_sync_state(&updates)?;
            Reply::Done
        }
        Op::GetUnsyncedIds => Reply::Ids(db.get_unsynced_covalue_ids()?),
        Op::StopTracking(id) => {
            db.stop_tracking_sync_state(&id)?;
            Reply::Done
        }
        Op::CovalueCount => Reply::Count(db.get_covalue_count()?),
        Op::CovalueIds { limit, offset } => Reply::Ids(db.get_covalue_ids(limit, offset)?),
    })
}

/// A [`StorageApi`] whose client lives on its own thread.
///
/// The thread exits once every handle is dropped.
pub struct WorkerStorage {
    requests: Mutex<mpsc::Sender<Request>>,
    pending: Pending,
    next_request_id: AtomicU64,
}

impl std::fmt::Debug for WorkerStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerStorage").finish_non_exhaustive()
    }
}

impl WorkerStorage {
    /// Starts the worker. `open` runs on the worker thread, so the client
    /// does not need to be `Send`.
    pub fn spawn<C, F>(open: F) -> StorageResult<Self>
    where
        C: DbClient + 'static,
        F: FnOnce() -> StorageResult<C> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = mpsc::channel::<StorageResult<()>>();
        let pending: Pending = Arc::default();
        let worker_pending = Arc::clone(&pending);

        std::thread::Builder::new()
            .name("cojson-storage".into())
            .spawn(move || {
                let mut client = match open() {
                    Ok(client) => {
                        let _ = ready_tx.send(Ok(()));
                        client
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while let Ok(Request { request_id, op }) = rx.recv() {
                    let result = execute(&mut client, op);
                    if let Err(e) = &result {
                        error!(request_id, error = %e, "storage request failed");
                    }
                    let reply = worker_pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&request_id);
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => debug!(request_id, "reply dropped, caller went away"),
                    }
                }
                info!("storage worker stopped");
            })?;

        ready_rx.recv().map_err(|_| StorageError::WorkerClosed)??;
        Ok(Self {
            requests: Mutex::new(tx),
            pending,
            next_request_id: AtomicU64::new(1),
        })
    }

    /// A worker over a redb database at `path`.
    pub fn open_redb(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        Self::spawn(move || RedbClient::open(&path))
    }

    async fn call(&self, op: Op) -> StorageResult<Reply> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id, reply_tx);
        let sent = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(Request { request_id, op });
        if sent.is_err() {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&request_id);
            return Err(StorageError::WorkerClosed);
        }
        reply_rx.await.map_err(|_| StorageError::WorkerClosed)?
    }
}

fn unexpected() -> StorageError {
    StorageError::InvalidData("unexpected worker reply".into())
}

#[async_trait]
impl StorageApi for WorkerStorage {
    async fn load(&self, id: &CoId) -> StorageResult<Vec<ContentMessage>> {
        match self.call(Op::Load(id.clone())).await? {
            Reply::Messages(messages) => Ok(messages),
            _ => Err(unexpected()),
        }
    }

    async fn load_known_state(&self, id: &CoId) -> StorageResult<Option<KnownState>> {
        match self.call(Op::LoadKnownState(id.clone())).await? {
            Reply::KnownState(state) => Ok(state),
            _ => Err(unexpected()),
        }
    }

    async fn store(&self, msg: ContentMessage) -> StorageResult<StoreOutcome> {
        match self.call(Op::Store(msg)).await? {
            Reply::Stored(outcome) => Ok(outcome),
            _ => Err(unexpected()),
        }
    }

    async fn mark_delete_as_valid(&self, id: &CoId) -> StorageResult<()> {
        match self.call(Op::MarkDeleteAsValid(id.clone())).await? {
            Reply::Done => Ok(()),
            _ => Err(unexpected()),
        }
    }

    async fn erase_deleted(&self, budget: Duration, cancel: CancellationToken) -> StorageResult<EraseRun> {
        match self.call(Op::EraseDeleted(budget, cancel)).await? {
            Reply::Erased(run) => Ok(run),
            _ => Err(unexpected()),
        }
    }

    async fn track_sync_state(&self, updates: Vec<SyncStateUpdate>) -> StorageResult<()> {
        match self.call(Op::TrackSyncState(updates)).await? {
            Reply::Done => Ok(()),
            _ => Err(unexpected()),
        }
    }

    async fn get_unsynced_ids(&self) -> StorageResult<Vec<CoId>> {
        match self.call(Op::GetUnsyncedIds).await? {
            Reply::Ids(ids) => Ok(ids),
            _ => Err(unexpected()),
        }
    }

    async fn stop_tracking(&self, id: &CoId) -> StorageResult<()> {
        match self.call(Op::StopTracking(id.clone())).await? {
            Reply::Done => Ok(()),
            _ => Err(unexpected()),
        }
    }

    async fn covalue_count(&self) -> StorageResult<u64> {
        match self.call(Op::CovalueCount).await? {
            Reply::Count(count) => Ok(count),
            _ => Err(unexpected()),
        }
    }

    async fn covalue_ids(&self, limit: usize, offset: usize) -> StorageResult<Vec<CoId>> {
        match self.call(Op::CovalueIds { limit, offset }).await? {
            Reply::Ids(ids) => Ok(ids),
            _ => Err(unexpected()),
        }
    }
}
