//! In-memory backend.

use crate::client::{
    DbClient, DeletionStatus, SessionUpdate, SignatureAfterRow, StoredCoValueRow,
    StoredSessionRow, SyncStateUpdate,
};
use crate::error::StorageResult;
use cojson_types::{CoId, CoValueHeader, PeerId, SessionId, Transaction};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Default)]
struct Tables {
    covalues: HashMap<CoId, (u64, Option<CoValueHeader>)>,
    covalue_ids: BTreeMap<u64, CoId>,
    sessions: BTreeMap<(u64, SessionId), StoredSessionRow>,
    transactions: BTreeMap<(u64, u32), Transaction>,
    signatures: BTreeMap<(u64, u32), String>,
    deleted: BTreeMap<CoId, DeletionStatus>,
    unsynced: BTreeSet<(CoId, PeerId)>,
    next_row_id: u64,
}

impl Tables {
    fn next_row_id(&mut self) -> u64 {
        self.next_row_id += 1;
        self.next_row_id
    }
}

/// A [`DbClient`] backed by maps. Transactions snapshot the tables and
/// restore them on error.
#[derive(Debug, Default)]
pub struct MemoryClient {
    tables: Tables,
}

impl MemoryClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DbClient for MemoryClient {
    fn get_covalue(&mut self, id: &CoId) -> StorageResult<Option<StoredCoValueRow>> {
        Ok(self
            .tables
            .covalues
            .get(id)
            .map(|(row_id, header)| StoredCoValueRow {
                row_id: *row_id,
                id: id.clone(),
                header: header.clone(),
            }))
    }

    fn upsert_covalue(&mut self, id: &CoId, header: Option<&CoValueHeader>) -> StorageResult<u64> {
        if let Some((row_id, stored)) = self.tables.covalues.get_mut(id) {
            if stored.is_none() {
                *stored = header.cloned();
            }
            return Ok(*row_id);
        }
        let row_id = self.tables.next_row_id();
        self.tables
            .covalues
            .insert(id.clone(), (row_id, header.cloned()));
        self.tables.covalue_ids.insert(row_id, id.clone());
        Ok(row_id)
    }

    fn get_covalue_sessions(&mut self, covalue: u64) -> StorageResult<Vec<StoredSessionRow>> {
        Ok(self
            .tables
            .sessions
            .iter()
            .filter(|((c, _), _)| *c == covalue)
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn get_single_covalue_session(
        &mut self,
        covalue: u64,
        session_id: &SessionId,
    ) -> StorageResult<Option<StoredSessionRow>> {
        Ok(self
            .tables
            .sessions
            .get(&(covalue, session_id.clone()))
            .cloned())
    }

    fn get_new_transactions_in_session(
        &mut self,
        session: u64,
        from_idx: u32,
        to_idx: u32,
    ) -> StorageResult<Vec<Transaction>> {
        if from_idx > to_idx {
            return Ok(Vec::new());
        }
        Ok(self
            .tables
            .transactions
            .range((session, from_idx)..=(session, to_idx))
            .map(|(_, tx)| tx.clone())
            .collect())
    }

    fn get_signatures(&mut self, session: u64, from_idx: u32) -> StorageResult<Vec<SignatureAfterRow>> {
        Ok(self
            .tables
            .signatures
            .range((session, from_idx)..=(session, u32::MAX))
            .map(|((_, idx), signature)| SignatureAfterRow {
                idx: *idx,
                signature: signature.clone(),
            })
            .collect())
    }

    fn add_session_update(&mut self, update: &SessionUpdate) -> StorageResult<u64> {
        let key = (update.covalue, update.session_id.clone());
        let row_id = match self.tables.sessions.get(&key) {
            Some(existing) => existing.row_id,
            None => self.tables.next_row_id(),
        };
        self.tables.sessions.insert(
            key,
            StoredSessionRow {
                row_id,
                covalue: update.covalue,
                session_id: update.session_id.clone(),
                last_idx: update.last_idx,
                last_signature: update.last_signature.clone(),
                bytes_since_last_signature: update.bytes_since_last_signature,
            },
        );
        Ok(row_id)
    }

    fn add_transaction(&mut self, session: u64, idx: u32, tx: &Transaction) -> StorageResult<()> {
        self.tables.transactions.insert((session, idx), tx.clone());
        Ok(())
    }

    fn add_signature_after(&mut self, session: u64, idx: u32, signature: &str) -> StorageResult<()> {
        self.tables
            .signatures
            .insert((session, idx), signature.to_string());
        Ok(())
    }

    fn mark_covalue_as_deleted(&mut self, id: &CoId) -> StorageResult<()> {
        self.tables
            .deleted
            .entry(id.clone())
            .or_insert(DeletionStatus::Pending);
        Ok(())
    }

    fn erase_covalue_but_keep_tombstone(&mut self, id: &CoId) -> StorageResult<()> {
        let Some((covalue, _)) = self.tables.covalues.get(id) else {
            return Ok(());
        };
        let covalue = *covalue;
        let erased: Vec<(u64, SessionId)> = self
            .tables
            .sessions
            .iter()
            .filter(|((c, session), _)| *c == covalue && !session.is_delete())
            .map(|(key, _)| key.clone())
            .collect();
        for key in erased {
            if let Some(row) = self.tables.sessions.remove(&key) {
                self.tables
                    .transactions
                    .retain(|(ses, _), _| *ses != row.row_id);
                self.tables
                    .signatures
                    .retain(|(ses, _), _| *ses != row.row_id);
            }
        }
        self.tables.deleted.insert(id.clone(), DeletionStatus::Done);
        Ok(())
    }

    fn get_all_covalues_waiting_for_delete(&mut self) -> StorageResult<Vec<CoId>> {
        Ok(self
            .tables
            .deleted
            .iter()
            .filter(|(_, status)| **status == DeletionStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn track_covalues_sync_state(&mut self, updates: &[SyncStateUpdate]) -> StorageResult<()> {
        for update in updates {
            let key = (update.id.clone(), update.peer.clone());
            if update.synced {
                self.tables.unsynced.remove(&key);
            } else {
                self.tables.unsynced.insert(key);
            }
        }
        Ok(())
    }

    fn get_unsynced_covalue_ids(&mut self) -> StorageResult<Vec<CoId>> {
        let ids: BTreeSet<&CoId> = self.tables.unsynced.iter().map(|(id, _)| id).collect();
        Ok(ids.into_iter().cloned().collect())
    }

    fn stop_tracking_sync_state(&mut self, id: &CoId) -> StorageResult<()> {
        self.tables.unsynced.retain(|(tracked, _)| tracked != id);
        Ok(())
    }

    fn get_covalue_count(&mut self) -> StorageResult<u64> {
        Ok(self.tables.covalues.len() as u64)
    }

    fn get_covalue_ids(&mut self, limit: usize, offset: usize) -> StorageResult<Vec<CoId>> {
        Ok(self
            .tables
            .covalue_ids
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn transaction(
        &mut self,
        f: &mut dyn FnMut(&mut dyn DbClient) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let snapshot = self.tables.clone();
        let result = f(self);
        if result.is_err() {
            self.tables = snapshot;
        }
        result
    }
}
