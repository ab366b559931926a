//! redb backend. Owned by the storage worker thread (see [`crate::worker`]).

use crate::client::{
    DbClient, DeletionStatus, SessionUpdate, SignatureAfterRow, StoredCoValueRow,
    StoredSessionRow, SyncStateUpdate,
};
use crate::error::{StorageError, StorageResult};
use cojson_types::{CoId, CoValueHeader, SessionId, Transaction};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Value id -> serialized [`CoValueRecord`].
const COVALUES: TableDefinition<&str, &[u8]> = TableDefinition::new("covalues");

/// Value row id -> value id, in insertion order.
const COVALUE_IDS: TableDefinition<u64, &str> = TableDefinition::new("covalue_ids");

/// (value row id, session id) -> serialized [`SessionRecord`].
const SESSIONS: TableDefinition<(u64, &str), &[u8]> = TableDefinition::new("sessions");

/// (session row id, idx) -> serialized transaction.
const TRANSACTIONS: TableDefinition<(u64, u32), &[u8]> = TableDefinition::new("transactions");

/// (session row id, idx) -> in-between signature.
const SIGNATURES: TableDefinition<(u64, u32), &str> = TableDefinition::new("signature_after");

/// Value id -> [`DeletionStatus`].
const DELETED: TableDefinition<&str, u8> = TableDefinition::new("deleted_covalues");

/// (value id, peer id) -> unused marker.
const UNSYNCED: TableDefinition<(&str, &str), u8> = TableDefinition::new("unsynced_covalues");

/// Counters.
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

#[derive(Serialize, Deserialize)]
struct CoValueRecord {
    row_id: u64,
    header: Option<CoValueHeader>,
}

#[derive(Serialize, Deserialize)]
struct SessionRecord {
    row_id: u64,
    last_idx: u32,
    last_signature: String,
    bytes_since_last_signature: usize,
}

fn db_err(e: impl Into<redb::Error>) -> StorageError {
    StorageError::Database(e.into().to_string())
}

/// A [`DbClient`] over a redb database file.
///
/// Every call runs in its own write transaction unless it happens inside
/// [`DbClient::transaction`], which shares one across the batch.
pub struct RedbClient {
    db: Database,
    txn: Option<WriteTransaction>,
}

impl std::fmt::Debug for RedbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbClient")
            .field("in_transaction", &self.txn.is_some())
            .finish_non_exhaustive()
    }
}

impl RedbClient {
    /// Opens or creates a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = Database::create(path.as_ref()).map_err(db_err)?;
        let write_txn = db.begin_write().map_err(db_err)?;
        {
            write_txn.open_table(COVALUES).map_err(db_err)?;
            write_txn.open_table(COVALUE_IDS).map_err(db_err)?;
            write_txn.open_table(SESSIONS).map_err(db_err)?;
            write_txn.open_table(TRANSACTIONS).map_err(db_err)?;
            write_txn.open_table(SIGNATURES).map_err(db_err)?;
            write_txn.open_table(DELETED).map_err(db_err)?;
            write_txn.open_table(UNSYNCED).map_err(db_err)?;
            write_txn.open_table(METADATA).map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;
        Ok(Self { db, txn: None })
    }

    fn with_txn<T>(&mut self, f: impl FnOnce(&WriteTransaction) -> StorageResult<T>) -> StorageResult<T> {
        if let Some(txn) = &self.txn {
            return f(txn);
        }
        let txn = self.db.begin_write().map_err(db_err)?;
        // dropping an uncommitted transaction aborts it
        let out = f(&txn)?;
        txn.commit().map_err(db_err)?;
        Ok(out)
    }
}

fn next_row_id(txn: &WriteTransaction) -> StorageResult<u64> {
    let mut meta = txn.open_table(METADATA).map_err(db_err)?;
    let next = meta
        .get("next_row_id")
        .map_err(db_err)?
        .map_or(1, |v| v.value() + 1);
    meta.insert("next_row_id", next).map_err(db_err)?;
    Ok(next)
}

fn read_session(covalue: u64, session_id: &str, raw: &[u8]) -> StorageResult<StoredSessionRow> {
    let record: SessionRecord = serde_json::from_slice(raw)?;
    Ok(StoredSessionRow {
        row_id: record.row_id,
        covalue,
        session_id: SessionId::parse(session_id)?,
        last_idx: record.last_idx,
        last_signature: record.last_signature,
        bytes_since_last_signature: record.bytes_since_last_signature,
    })
}

fn session_keys(txn: &WriteTransaction, covalue: u64) -> StorageResult<Vec<(String, u64)>> {
    let sessions = txn.open_table(SESSIONS).map_err(db_err)?;
    let mut keys = Vec::new();
    for entry in sessions.range((covalue, "")..(covalue + 1, "")).map_err(db_err)? {
        let (key, value) = entry.map_err(db_err)?;
        let record: SessionRecord = serde_json::from_slice(value.value())?;
        keys.push((key.value().1.to_string(), record.row_id));
    }
    Ok(keys)
}

fn remove_range<V: redb::Value + 'static>(
    txn: &WriteTransaction,
    table: TableDefinition<(u64, u32), V>,
    session: u64,
) -> StorageResult<()> {
    let mut table = txn.open_table(table).map_err(db_err)?;
    let mut keys = Vec::new();
    for entry in table.range((session, 0u32)..=(session, u32::MAX)).map_err(db_err)? {
        let (key, _) = entry.map_err(db_err)?;
        keys.push(key.value());
    }
    for key in keys {
        table.remove(key).map_err(db_err)?;
    }
    Ok(())
}

impl DbClient for RedbClient {
    fn get_covalue(&mut self, id: &CoId) -> StorageResult<Option<StoredCoValueRow>> {
        self.with_txn(|txn| {
            let table = txn.open_table(COVALUES).map_err(db_err)?;
            let Some(raw) = table.get(id.as_str()).map_err(db_err)? else {
                return Ok(None);
            };
            let record: CoValueRecord = serde_json::from_slice(raw.value())?;
            Ok(Some(StoredCoValueRow {
                row_id: record.row_id,
                id: id.clone(),
                header: record.header,
            }))
        })
    }

    fn upsert_covalue(&mut self, id: &CoId, header: Option<&CoValueHeader>) -> StorageResult<u64> {
        self.with_txn(|txn| {
            let existing: Option<CoValueRecord> = {
                let table = txn.open_table(COVALUES).map_err(db_err)?;
                let raw = table.get(id.as_str()).map_err(db_err)?;
                raw.map(|raw| serde_json::from_slice(raw.value())).transpose()?
            };
            let record = match existing {
                Some(record) if record.header.is_some() || header.is_none() => return Ok(record.row_id),
                Some(record) => CoValueRecord {
                    row_id: record.row_id,
                    header: header.cloned(),
                },
                None => {
                    let row_id = next_row_id(txn)?;
                    let mut ids = txn.open_table(COVALUE_IDS).map_err(db_err)?;
                    ids.insert(row_id, id.as_str()).map_err(db_err)?;
                    CoValueRecord {
                        row_id,
                        header: header.cloned(),
                    }
                }
            };
            let bytes = serde_json::to_vec(&record)?;
            let mut table = txn.open_table(COVALUES).map_err(db_err)?;
            table.insert(id.as_str(), bytes.as_slice()).map_err(db_err)?;
            Ok(record.row_id)
        })
    }

    fn get_covalue_sessions(&mut self, covalue: u64) -> StorageResult<Vec<StoredSessionRow>> {
        self.with_txn(|txn| {
            let table = txn.open_table(SESSIONS).map_err(db_err)?;
            let mut rows = Vec::new();
            for entry in table.range((covalue, "")..(covalue + 1, "")).map_err(db_err)? {
                let (key, value) = entry.map_err(db_err)?;
                rows.push(read_session(covalue, key.value().1, value.value())?);
            }
            Ok(rows)
        })
    }

    fn get_single_covalue_session(
        &mut self,
        covalue: u64,
        session_id: &SessionId,
    ) -> StorageResult<Option<StoredSessionRow>> {
        self.with_txn(|txn| {
            let table = txn.open_table(SESSIONS).map_err(db_err)?;
            let Some(raw) = table.get((covalue, session_id.as_str())).map_err(db_err)? else {
                return Ok(None);
            };
            read_session(covalue, session_id.as_str(), raw.value()).map(Some)
        })
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
        self.with_txn(|txn| {
            let table = txn.open_table(TRANSACTIONS).map_err(db_err)?;
            let mut txs = Vec::new();
            for entry in table.range((session, from_idx)..=(session, to_idx)).map_err(db_err)? {
                let (_, value) = entry.map_err(db_err)?;
                txs.push(serde_json::from_slice(value.value())?);
            }
            Ok(txs)
        })
    }

    fn get_signatures(&mut self, session: u64, from_idx: u32) -> StorageResult<Vec<SignatureAfterRow>> {
        self.with_txn(|txn| {
            let table = txn.open_table(SIGNATURES).map_err(db_err)?;
            let mut rows = Vec::new();
            for entry in table.range((session, from_idx)..=(session, u32::MAX)).map_err(db_err)? {
                let (key, value) = entry.map_err(db_err)?;
                rows.push(SignatureAfterRow {
                    idx: key.value().1,
                    signature: value.value().to_string(),
                });
            }
            Ok(rows)
        })
    }

    fn add_session_update(&mut self, update: &SessionUpdate) -> StorageResult<u64> {
        self.with_txn(|txn| {
            let key = (update.covalue, update.session_id.as_str());
            let existing: Option<SessionRecord> = {
                let table = txn.open_table(SESSIONS).map_err(db_err)?;
                let raw = table.get(key).map_err(db_err)?;
                raw.map(|raw| serde_json::from_slice(raw.value())).transpose()?
            };
            let row_id = match existing {
                Some(record) => record.row_id,
                None => next_row_id(txn)?,
            };
            let record = SessionRecord {
                row_id,
                last_idx: update.last_idx,
                last_signature: update.last_signature.clone(),
                bytes_since_last_signature: update.bytes_since_last_signature,
            };
            let bytes = serde_json::to_vec(&record)?;
            let mut table = txn.open_table(SESSIONS).map_err(db_err)?;
            table.insert(key, bytes.as_slice()).map_err(db_err)?;
            Ok(row_id)
        })
    }

    fn add_transaction(&mut self, session: u64, idx: u32, tx: &Transaction) -> StorageResult<()> {
        let bytes = serde_json::to_vec(tx)?;
        self.with_txn(|txn| {
            let mut table = txn.open_table(TRANSACTIONS).map_err(db_err)?;
            table.insert((session, idx), bytes.as_slice()).map_err(db_err)?;
            Ok(())
        })
    }

    fn add_signature_after(&mut self, session: u64, idx: u32, signature: &str) -> StorageResult<()> {
        self.with_txn(|txn| {
            let mut table = txn.open_table(SIGNATURES).map_err(db_err)?;
            table.insert((session, idx), signature).map_err(db_err)?;
            Ok(())
        })
    }

    fn mark_covalue_as_deleted(&mut self, id: &CoId) -> StorageResult<()> {
        self.with_txn(|txn| {
            let mut table = txn.open_table(DELETED).map_err(db_err)?;
            let present = table.get(id.as_str()).map_err(db_err)?.is_some();
            if !present {
                table
                    .insert(id.as_str(), DeletionStatus::Pending as u8)
                    .map_err(db_err)?;
            }
            Ok(())
        })
    }

    fn erase_covalue_but_keep_tombstone(&mut self, id: &CoId) -> StorageResult<()> {
        let Some(row) = self.get_covalue(id)? else {
            warn!(id = %id, "covalue not found, skipping erase");
            return Ok(());
        };
        self.with_txn(|txn| {
            for (session_id, session_row) in session_keys(txn, row.row_id)? {
                if SessionId::parse(&session_id)?.is_delete() {
                    continue;
                }
                remove_range(txn, TRANSACTIONS, session_row)?;
                remove_range(txn, SIGNATURES, session_row)?;
                let mut sessions = txn.open_table(SESSIONS).map_err(db_err)?;
                sessions
                    .remove((row.row_id, session_id.as_str()))
                    .map_err(db_err)?;
            }
            let mut deleted = txn.open_table(DELETED).map_err(db_err)?;
            deleted
                .insert(id.as_str(), DeletionStatus::Done as u8)
                .map_err(db_err)?;
            Ok(())
        })?;
        debug!(id = %id, "erased covalue history");
        Ok(())
    }

    fn get_all_covalues_waiting_for_delete(&mut self) -> StorageResult<Vec<CoId>> {
        self.with_txn(|txn| {
            let table = txn.open_table(DELETED).map_err(db_err)?;
            let mut ids = Vec::new();
            for entry in table.iter().map_err(db_err)? {
                let (key, value) = entry.map_err(db_err)?;
                if value.value() == DeletionStatus::Pending as u8 {
                    ids.push(CoId::parse(key.value())?);
                }
            }
            Ok(ids)
        })
    }

    fn track_covalues_sync_state(&mut self, updates: &[SyncStateUpdate]) -> StorageResult<()> {
        self.with_txn(|txn| {
            let mut table = txn.open_table(UNSYNCED).map_err(db_err)?;
            for update in updates {
                let key = (update.id.as_str(), update.peer.as_str());
                if update.synced {
                    table.remove(key).map_err(db_err)?;
                } else {
                    table.insert(key, 0u8).map_err(db_err)?;
                }
            }
            Ok(())
        })
    }

    fn get_unsynced_covalue_ids(&mut self) -> StorageResult<Vec<CoId>> {
        self.with_txn(|txn| {
            let table = txn.open_table(UNSYNCED).map_err(db_err)?;
            let mut ids: Vec<CoId> = Vec::new();
            for entry in table.iter().map_err(db_err)? {
                let (key, _) = entry.map_err(db_err)?;
                let id = CoId::parse(key.value().0)?;
                // keys are sorted, so duplicates are adjacent
                if ids.last() != Some(&id) {
                    ids.push(id);
                }
            }
            Ok(ids)
        })
    }

    fn stop_tracking_sync_state(&mut self, id: &CoId) -> StorageResult<()> {
        self.with_txn(|txn| {
            let mut table = txn.open_table(UNSYNCED).map_err(db_err)?;
            let mut peers = Vec::new();
            for entry in table.iter().map_err(db_err)? {
                let (key, _) = entry.map_err(db_err)?;
                let (tracked, peer) = key.value();
                if tracked == id.as_str() {
                    peers.push(peer.to_string());
                }
            }
            for peer in peers {
                table.remove((id.as_str(), peer.as_str())).map_err(db_err)?;
            }
            Ok(())
        })
    }

    fn get_covalue_count(&mut self) -> StorageResult<u64> {
        self.with_txn(|txn| {
            let table = txn.open_table(COVALUE_IDS).map_err(db_err)?;
            table.len().map_err(db_err)
        })
    }

    fn get_covalue_ids(&mut self, limit: usize, offset: usize) -> StorageResult<Vec<CoId>> {
        self.with_txn(|txn| {
            let table = txn.open_table(COVALUE_IDS).map_err(db_err)?;
            let mut ids = Vec::new();
            for entry in table.iter().map_err(db_err)?.skip(offset).take(limit) {
                let (_, value) = entry.map_err(db_err)?;
                ids.push(CoId::parse(value.value())?);
            }
            Ok(ids)
        })
    }

    fn transaction(
        &mut self,
        f: &mut dyn FnMut(&mut dyn DbClient) -> StorageResult<()>,
    ) -> StorageResult<()> {
        if self.txn.is_some() {
            return f(self);
        }
        self.txn = Some(self.db.begin_write().map_err(db_err)?);
        let result = f(self);
        let Some(txn) = self.txn.take() else {
            return result;
        };
        match result {
            Ok(()) => txn.commit().map_err(db_err),
            Err(e) => {
                if let Err(abort) = txn.abort() {
                    warn!(error = %abort, "abort failed");
                }
                Err(e)
            }
        }
    }
}
