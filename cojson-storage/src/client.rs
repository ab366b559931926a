//! The low-level storage contract every backend implements.

use crate::error::StorageResult;
use cojson_types::{CoId, CoValueHeader, PeerId, SessionId, Transaction};

/// A stored value. `header` is `None` until a message carrying it arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCoValueRow {
    pub row_id: u64,
    pub id: CoId,
    pub header: Option<CoValueHeader>,
}

/// Bookkeeping of one stored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSessionRow {
    pub row_id: u64,
    pub covalue: u64,
    pub session_id: SessionId,
    /// Number of stored transactions.
    pub last_idx: u32,
    pub last_signature: String,
    pub bytes_since_last_signature: usize,
}

/// New bookkeeping for a session, written after its transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    pub covalue: u64,
    pub session_id: SessionId,
    pub last_idx: u32,
    pub last_signature: String,
    pub bytes_since_last_signature: usize,
}

/// An in-between signature: valid for the session prefix ending at `idx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureAfterRow {
    pub idx: u32,
    pub signature: String,
}

/// Progress of a deleted value through the erase queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionStatus {
    Pending = 0,
    Done = 1,
}

impl DeletionStatus {
    pub fn from_i64(v: i64) -> Self {
        if v == Self::Done as i64 {
            Self::Done
        } else {
            Self::Pending
        }
    }
}

/// Whether `id` is now synced with `peer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateUpdate {
    pub id: CoId,
    pub peer: PeerId,
    pub synced: bool,
}

/// Blocking access to one database connection.
///
/// Reads observe earlier writes of the same client. `(session, idx)` pairs
/// are unique. Callers write a session's transactions before its
/// [`SessionUpdate`], so `last_idx` never runs ahead of stored data.
pub trait DbClient {
    fn get_covalue(&mut self, id: &CoId) -> StorageResult<Option<StoredCoValueRow>>;

    /// Inserts `id` if missing, fills in a missing header, returns the row id.
    fn upsert_covalue(&mut self, id: &CoId, header: Option<&CoValueHeader>) -> StorageResult<u64>;

    fn get_covalue_sessions(&mut self, covalue: u64) -> StorageResult<Vec<StoredSessionRow>>;

    fn get_single_covalue_session(
        &mut self,
        covalue: u64,
        session_id: &SessionId,
    ) -> StorageResult<Option<StoredSessionRow>>;

    /// Transactions with `from_idx <= idx <= to_idx`.
    fn get_new_transactions_in_session(
        &mut self,
        session: u64,
        from_idx: u32,
        to_idx: u32,
    ) -> StorageResult<Vec<Transaction>>;

    /// In-between signatures with `idx >= from_idx`, ascending.
    fn get_signatures(&mut self, session: u64, from_idx: u32) -> StorageResult<Vec<SignatureAfterRow>>;

    /// Upserts session bookkeeping and returns the session row id.
    fn add_session_update(&mut self, update: &SessionUpdate) -> StorageResult<u64>;

    fn add_transaction(&mut self, session: u64, idx: u32, tx: &Transaction) -> StorageResult<()>;

    fn add_signature_after(&mut self, session: u64, idx: u32, signature: &str) -> StorageResult<()>;

    /// Queues `id` for erasure. Idempotent.
    fn mark_covalue_as_deleted(&mut self, id: &CoId) -> StorageResult<()>;

    /// Removes every non-delete session of `id` and marks the erasure done.
    /// The header and delete sessions stay as the tombstone.
    fn erase_covalue_but_keep_tombstone(&mut self, id: &CoId) -> StorageResult<()>;

    fn get_all_covalues_waiting_for_delete(&mut self) -> StorageResult<Vec<CoId>>;

    fn track_covalues_sync_state(&mut self, updates: &[SyncStateUpdate]) -> StorageResult<()>;

    /// Values with at least one peer that has not confirmed them.
    fn get_unsynced_covalue_ids(&mut self) -> StorageResult<Vec<CoId>>;

    fn stop_tracking_sync_state(&mut self, id: &CoId) -> StorageResult<()>;

    fn get_covalue_count(&mut self) -> StorageResult<u64>;

    /// Ids ordered by insertion.
    fn get_covalue_ids(&mut self, limit: usize, offset: usize) -> StorageResult<Vec<CoId>>;

    /// Runs `f` atomically: an `Err` rolls back everything `f` wrote.
    fn transaction(
        &mut self,
        f: &mut dyn FnMut(&mut dyn DbClient) -> StorageResult<()>,
    ) -> StorageResult<()>;
}
