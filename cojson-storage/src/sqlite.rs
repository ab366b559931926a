//! SQLite backend.

use crate::client::{
    DbClient, DeletionStatus, SessionUpdate, SignatureAfterRow, StoredCoValueRow,
    StoredSessionRow, SyncStateUpdate,
};
use crate::error::{StorageError, StorageResult};
use cojson_types::{CoId, CoValueHeader, SessionId, Transaction};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use tracing::{debug, info, warn};

/// Schema version reached after all migrations.
pub const SCHEMA_VERSION: u32 = 5;

/// Migration steps; step `n` takes the schema from version `n` to `n + 1`.
const MIGRATIONS: [&str; 5] = [
    "
    CREATE TABLE IF NOT EXISTS transactions (
        ses INTEGER,
        idx INTEGER,
        tx TEXT NOT NULL,
        PRIMARY KEY (ses, idx)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS sessions (
        rowID INTEGER PRIMARY KEY,
        coValue INTEGER NOT NULL,
        sessionID TEXT NOT NULL,
        lastIdx INTEGER,
        lastSignature TEXT,
        UNIQUE (sessionID, coValue)
    );

    CREATE TABLE IF NOT EXISTS coValues (
        rowID INTEGER PRIMARY KEY,
        id TEXT NOT NULL UNIQUE,
        header TEXT
    );
    CREATE INDEX IF NOT EXISTS coValuesByID ON coValues (id);
    ",
    "CREATE INDEX IF NOT EXISTS sessionsByCoValue ON sessions (coValue);",
    "
    CREATE TABLE IF NOT EXISTS signatureAfter (
        ses INTEGER,
        idx INTEGER,
        signature TEXT NOT NULL,
        PRIMARY KEY (ses, idx)
    ) WITHOUT ROWID;
    ",
    "
    CREATE TABLE IF NOT EXISTS deletedCoValues (
        coValueID TEXT PRIMARY KEY,
        status INTEGER NOT NULL DEFAULT 0
    );
    ",
    "
    CREATE TABLE IF NOT EXISTS unsynced_covalues (
        rowID INTEGER PRIMARY KEY,
        co_value_id TEXT NOT NULL,
        peer_id TEXT NOT NULL,
        UNIQUE (co_value_id, peer_id)
    );
    CREATE INDEX IF NOT EXISTS unsyncedByCoValue ON unsynced_covalues (co_value_id);
    ",
];

/// A [`DbClient`] over one SQLite connection.
pub struct SqliteClient {
    conn: Connection,
}

impl std::fmt::Debug for SqliteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteClient")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl SqliteClient {
    /// Opens (or creates) a database file and migrates it.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory database (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut conn: Connection) -> StorageResult<Self> {
        migrate(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn schema_version(&self) -> StorageResult<u32> {
        user_version(&self.conn)
    }
}

fn user_version(conn: &Connection) -> StorageResult<u32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn has_column(conn: &Connection, table: &str, column: &str) -> StorageResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn migrate(conn: &mut Connection) -> StorageResult<()> {
    let from = user_version(conn)?;
    if from > SCHEMA_VERSION {
        return Err(StorageError::Migration(format!(
            "database schema {from} is newer than supported {SCHEMA_VERSION}"
        )));
    }
    for version in from..SCHEMA_VERSION {
        let tx = conn.transaction()?;
        tx.execute_batch(MIGRATIONS[version as usize])?;
        // ALTER TABLE has no IF NOT EXISTS form
        if version == 2 && !has_column(&tx, "sessions", "bytesSinceLastSignature")? {
            tx.execute_batch("ALTER TABLE sessions ADD COLUMN bytesSinceLastSignature INTEGER;")?;
        }
        tx.pragma_update(None, "user_version", version + 1)?;
        tx.commit()?;
        info!(from = version, to = version + 1, "migrated storage schema");
    }
    Ok(())
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<(u64, u64, String, u32, Option<String>, Option<i64>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get::<_, Option<u32>>(3)?.unwrap_or(0),
        row.get(4)?,
        row.get(5)?,
    ))
}

fn to_session(
    (row_id, covalue, session_id, last_idx, last_signature, bytes): (u64, u64, String, u32, Option<String>, Option<i64>),
) -> StorageResult<StoredSessionRow> {
    Ok(StoredSessionRow {
        row_id,
        covalue,
        session_id: SessionId::parse(&session_id)?,
        last_idx,
        last_signature: last_signature.unwrap_or_default(),
        bytes_since_last_signature: bytes.unwrap_or(0).max(0) as usize,
    })
}

const SESSION_COLUMNS: &str =
    "rowID, coValue, sessionID, lastIdx, lastSignature, bytesSinceLastSignature";

impl DbClient for SqliteClient {
    fn get_covalue(&mut self, id: &CoId) -> StorageResult<Option<StoredCoValueRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT rowID, header FROM coValues WHERE id = ?1",
                params![id.as_str()],
                |row| Ok((row.get::<_, u64>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;
        let Some((row_id, header)) = row else {
            return Ok(None);
        };
        let header = header.map(|h| serde_json::from_str(&h)).transpose()?;
        Ok(Some(StoredCoValueRow {
            row_id,
            id: id.clone(),
            header,
        }))
    }

    fn upsert_covalue(&mut self, id: &CoId, header: Option<&CoValueHeader>) -> StorageResult<u64> {
        let header = header.map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT INTO coValues (id, header) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET header = COALESCE(coValues.header, excluded.header)",
            params![id.as_str(), header],
        )?;
        Ok(self.conn.query_row(
            "SELECT rowID FROM coValues WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?)
    }

    fn get_covalue_sessions(&mut self, covalue: u64) -> StorageResult<Vec<StoredSessionRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE coValue = ?1 ORDER BY sessionID"
        ))?;
        let rows = stmt.query_map(params![covalue], session_from_row)?;
        rows.map(|row| to_session(row?)).collect()
    }

    fn get_single_covalue_session(
        &mut self,
        covalue: u64,
        session_id: &SessionId,
    ) -> StorageResult<Option<StoredSessionRow>> {
        self.conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE coValue = ?1 AND sessionID = ?2"),
                params![covalue, session_id.as_str()],
                session_from_row,
            )
            .optional()?
            .map(to_session)
            .transpose()
    }

    fn get_new_transactions_in_session(
        &mut self,
        session: u64,
        from_idx: u32,
        to_idx: u32,
    ) -> StorageResult<Vec<Transaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT tx FROM transactions WHERE ses = ?1 AND idx >= ?2 AND idx <= ?3 ORDER BY idx",
        )?;
        let rows = stmt.query_map(params![session, from_idx, to_idx], |row| row.get::<_, String>(0))?;
        rows.map(|tx| Ok(serde_json::from_str(&tx?)?)).collect()
    }

    fn get_signatures(&mut self, session: u64, from_idx: u32) -> StorageResult<Vec<SignatureAfterRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT idx, signature FROM signatureAfter WHERE ses = ?1 AND idx >= ?2 ORDER BY idx",
        )?;
        let rows = stmt.query_map(params![session, from_idx], |row| {
            Ok(SignatureAfterRow {
                idx: row.get(0)?,
                signature: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn add_session_update(&mut self, update: &SessionUpdate) -> StorageResult<u64> {
        self.conn.execute(
            "INSERT INTO sessions (coValue, sessionID, lastIdx, lastSignature, bytesSinceLastSignature)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(coValue, sessionID) DO UPDATE SET
                lastIdx = excluded.lastIdx,
                lastSignature = excluded.lastSignature,
                bytesSinceLastSignature = excluded.bytesSinceLastSignature",
            params![
                update.covalue,
                update.session_id.as_str(),
                update.last_idx,
                update.last_signature,
                update.bytes_since_last_signature as i64,
            ],
        )?;
        Ok(self.conn.query_row(
            "SELECT rowID FROM sessions WHERE coValue = ?1 AND sessionID = ?2",
            params![update.covalue, update.session_id.as_str()],
            |row| row.get(0),
        )?)
    }

    fn add_transaction(&mut self, session: u64, idx: u32, tx: &Transaction) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO transactions (ses, idx, tx) VALUES (?1, ?2, ?3)",
            params![session, idx, serde_json::to_string(tx)?],
        )?;
        Ok(())
    }

    fn add_signature_after(&mut self, session: u64, idx: u32, signature: &str) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO signatureAfter (ses, idx, signature) VALUES (?1, ?2, ?3)",
            params![session, idx, signature],
        )?;
        Ok(())
    }

    fn mark_covalue_as_deleted(&mut self, id: &CoId) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO deletedCoValues (coValueID) VALUES (?1) ON CONFLICT(coValueID) DO NOTHING",
            params![id.as_str()],
        )?;
        Ok(())
    }

    fn erase_covalue_but_keep_tombstone(&mut self, id: &CoId) -> StorageResult<()> {
        let Some(row) = self.get_covalue(id)? else {
            warn!(id = %id, "covalue not found, skipping erase");
            return Ok(());
        };
        let non_delete = "SELECT rowID FROM sessions WHERE coValue = ?1 AND sessionID NOT LIKE '%$'";
        self.conn.execute(
            &format!("DELETE FROM transactions WHERE ses IN ({non_delete})"),
            params![row.row_id],
        )?;
        self.conn.execute(
            &format!("DELETE FROM signatureAfter WHERE ses IN ({non_delete})"),
            params![row.row_id],
        )?;
        self.conn.execute(
            "DELETE FROM sessions WHERE coValue = ?1 AND sessionID NOT LIKE '%$'",
            params![row.row_id],
        )?;
        self.conn.execute(
            "INSERT INTO deletedCoValues (coValueID, status) VALUES (?1, ?2)
             ON CONFLICT(coValueID) DO UPDATE SET status = excluded.status",
            params![id.as_str(), DeletionStatus::Done as i64],
        )?;
        debug!(id = %id, "erased covalue history");
        Ok(())
    }

    fn get_all_covalues_waiting_for_delete(&mut self) -> StorageResult<Vec<CoId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT coValueID FROM deletedCoValues WHERE status = ?1")?;
        let rows = stmt.query_map(params![DeletionStatus::Pending as i64], |row| row.get::<_, String>(0))?;
        rows.map(|id| Ok(CoId::parse(&id?)?)).collect()
    }

    fn track_covalues_sync_state(&mut self, updates: &[SyncStateUpdate]) -> StorageResult<()> {
        for update in updates {
            if update.synced {
                self.conn.execute(
                    "DELETE FROM unsynced_covalues WHERE co_value_id = ?1 AND peer_id = ?2",
                    params![update.id.as_str(), update.peer.as_str()],
                )?;
            } else {
                self.conn.execute(
                    "INSERT OR REPLACE INTO unsynced_covalues (co_value_id, peer_id) VALUES (?1, ?2)",
                    params![update.id.as_str(), update.peer.as_str()],
                )?;
            }
        }
        Ok(())
    }

    fn get_unsynced_covalue_ids(&mut self) -> StorageResult<Vec<CoId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT co_value_id FROM unsynced_covalues ORDER BY co_value_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.map(|id| Ok(CoId::parse(&id?)?)).collect()
    }

    fn stop_tracking_sync_state(&mut self, id: &CoId) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM unsynced_covalues WHERE co_value_id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    fn get_covalue_count(&mut self) -> StorageResult<u64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM coValues", [], |row| row.get(0))?)
    }

    fn get_covalue_ids(&mut self, limit: usize, offset: usize) -> StorageResult<Vec<CoId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM coValues ORDER BY rowID LIMIT ?1 OFFSET ?2")?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], |row| row.get::<_, String>(0))?;
        rows.map(|id| Ok(CoId::parse(&id?)?)).collect()
    }

    fn transaction(
        &mut self,
        f: &mut dyn FnMut(&mut dyn DbClient) -> StorageResult<()>,
    ) -> StorageResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(()) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }
}
