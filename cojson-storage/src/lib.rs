//! Persistence for cojson values.
//!
//! # Architecture
//!
//! - [`DbClient`] is the blocking, row-level contract every backend implements
//!   ([`SqliteClient`], [`RedbClient`], [`MemoryClient`])
//! - [`StorageApi`] is the async surface the sync layer talks to: whole
//!   content messages in, split content messages out
//! - [`LocalStorage`] drives a client on tokio's blocking pool, [`WorkerStorage`]
//!   keeps one on a dedicated thread behind a request channel
//! - [`EraserScheduler`] erases deleted values in the background, keeping
//!   their tombstones

mod api;
mod client;
mod eraser;
mod error;
mod memory;
mod redb_store;
mod sqlite;
mod worker;

pub use api::{EraseRun, LocalStorage, MAX_BYTES_BETWEEN_SIGNATURES, StorageApi, StoreOutcome};
pub use client::{
    DbClient, DeletionStatus, SessionUpdate, SignatureAfterRow, StoredCoValueRow,
    StoredSessionRow, SyncStateUpdate,
};
pub use eraser::{EraseFn, EraserConfig, EraserScheduler, EraserState};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryClient;
pub use redb_store::RedbClient;
pub use sqlite::{SCHEMA_VERSION, SqliteClient};
pub use worker::WorkerStorage;
