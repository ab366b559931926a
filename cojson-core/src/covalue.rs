//! The verified state of one collaborative value.
//!
//! A [`CoValueCore`] owns the immutable header and every session log. It
//! knows nothing about other values: resolving a session author to a signer
//! and deciding whether a delete is permitted are done by the caller, which
//! passes the results in.

use crate::error::{CoreError, CoreResult};
use crate::session_log::{MAX_RECOMMENDED_TX_SIZE, SessionLog, SessionLogConfig};
use cojson_crypto::{Signature, SignerId, SignerSecret, short_hash};
use cojson_types::{
    CoId, CoValueHeader, CoValuePriority, ContentMessage, KnownState, SessionId,
    SessionNewContent, Transaction, TransactionId, TxOrder,
};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Derives the id of a value from its header.
pub fn id_for_header(header: &CoValueHeader) -> CoreResult<CoId> {
    Ok(CoId::from_short_hash(&short_hash(header)?))
}

/// Meta of the single transaction in a delete session.
pub fn delete_marker(id: &CoId) -> Value {
    serde_json::json!({ "deleted": id.as_str() })
}

#[derive(Debug, Clone)]
pub struct CoValueCore {
    id: CoId,
    header: CoValueHeader,
    sessions: BTreeMap<SessionId, SessionLog>,
    deleted: bool,
    config: SessionLogConfig,
}

impl CoValueCore {
    /// Creates a core for `header`, checking that it hashes to `id`.
    pub fn new(id: CoId, header: CoValueHeader, config: SessionLogConfig) -> CoreResult<Self> {
        let expected = id_for_header(&header)?;
        if expected != id {
            return Err(CoreError::InvalidTransaction(format!(
                "header hashes to {expected}, not {id}"
            )));
        }
        Ok(Self {
            id,
            header,
            sessions: BTreeMap::new(),
            deleted: false,
            config,
        })
    }

    /// Creates a core for a freshly built header.
    pub fn from_header(header: CoValueHeader, config: SessionLogConfig) -> CoreResult<Self> {
        let id = id_for_header(&header)?;
        Self::new(id, header, config)
    }

    pub fn id(&self) -> &CoId {
        &self.id
    }

    pub fn header(&self) -> &CoValueHeader {
        &self.header
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn sessions(&self) -> &BTreeMap<SessionId, SessionLog> {
        &self.sessions
    }

    pub fn session(&self, session_id: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(session_id)
    }

    pub fn transaction_count(&self, session_id: &SessionId) -> u32 {
        self.sessions.get(session_id).map_or(0, SessionLog::len)
    }

    /// What this core holds. A deleted value only reports its delete sessions.
    pub fn known_state(&self) -> KnownState {
        let mut state = KnownState::empty(self.id.clone());
        state.header = true;
        for (session_id, log) in &self.sessions {
            if self.deleted && !session_id.is_delete() {
                continue;
            }
            state.sessions.insert(session_id.clone(), log.len());
        }
        state
    }

    /// Verifies and appends `txs` to the end of `session_id`.
    ///
    /// `signer` is the resolved signer of the session author. When
    /// `skip_verify` is set (trusted local storage) the signature is taken
    /// as-is. Nothing is applied when verification fails.
    pub fn try_add_transactions(
        &mut self,
        session_id: &SessionId,
        txs: Vec<Transaction>,
        signature: &Signature,
        signer: &SignerId,
        skip_verify: bool,
    ) -> CoreResult<u32> {
        if self.deleted && !session_id.is_delete() {
            return Err(CoreError::DeletedCoValue(self.id.clone()));
        }
        if session_id.is_delete() {
            self.check_delete_session(session_id, &txs)?;
        }
        if txs.is_empty() {
            return Ok(self.transaction_count(session_id));
        }

        let log = self.sessions.get(session_id);
        let empty = SessionLog::new();
        let log_ref = log.unwrap_or(&empty);
        let hash = if skip_verify {
            log_ref
                .expected_hash_after(&txs)?
                .ok_or_else(|| CoreError::InvalidTransaction("empty batch".into()))?
        } else {
            log_ref.verify(&txs, signature, signer).map_err(|source| {
                warn!(id = %self.id, session = %session_id, "rejecting transactions with invalid signature");
                CoreError::InvalidSignature {
                    id: self.id.clone(),
                    session_id: session_id.clone(),
                    source,
                }
            })?
        };

        let log = self.sessions.entry(session_id.clone()).or_default();
        log.commit(txs, hash, *signature, &self.config);
        let count = log.len();
        if session_id.is_delete() {
            debug!(id = %self.id, "covalue marked as deleted");
            self.deleted = true;
        }
        Ok(count)
    }

    fn check_delete_session(&self, session_id: &SessionId, txs: &[Transaction]) -> CoreResult<()> {
        let reject = |reason: &str| CoreError::DeleteTransactionRejected {
            id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.header.is_group_or_account() {
            return Err(reject("groups and accounts cannot be deleted"));
        }
        if self.transaction_count(session_id) + txs.len() as u32 > 1 {
            return Err(reject("delete sessions hold exactly one transaction"));
        }
        for tx in txs {
            let Transaction::Trusting { meta, .. } = tx else {
                return Err(reject("delete transaction must be trusting"));
            };
            let meta: Value = match meta {
                Some(raw) => serde_json::from_str(raw)?,
                None => return Err(reject("delete transaction has no meta")),
            };
            if meta != delete_marker(&self.id) {
                return Err(reject("delete transaction meta does not name this value"));
            }
        }
        Ok(())
    }

    /// Signs and appends a transaction authored locally.
    pub fn add_own_transaction(
        &mut self,
        session_id: &SessionId,
        tx: Transaction,
        signer: &SignerSecret,
    ) -> CoreResult<u32> {
        let txs = vec![tx];
        let hash = self
            .sessions
            .get(session_id)
            .unwrap_or(&SessionLog::new())
            .expected_hash_after(&txs)?
            .ok_or_else(|| CoreError::InvalidTransaction("empty batch".into()))?;
        let signature = signer.sign(&hash);
        self.try_add_transactions(session_id, txs, &signature, &signer.signer_id(), true)
    }

    /// Restores checkpoint bookkeeping for a session loaded from storage.
    pub fn restore_checkpoints(
        &mut self,
        session_id: &SessionId,
        signature_after: BTreeMap<u32, Signature>,
        bytes_since_last_signature: usize,
    ) {
        if let Some(log) = self.sessions.get_mut(session_id) {
            log.restore_checkpoints(signature_after, bytes_since_last_signature);
        }
    }

    /// All transactions (delete sessions excluded) with their ids, in [`TxOrder`].
    pub fn ordered_transactions(&self) -> Vec<(TxOrder, &Transaction)> {
        let mut all: Vec<(TxOrder, &Transaction)> = self
            .sessions
            .iter()
            .filter(|(session_id, _)| !session_id.is_delete())
            .flat_map(|(session_id, log)| {
                log.transactions()
                    .iter()
                    .enumerate()
                    .map(move |(idx, tx)| (TxOrder::new(tx.made_at(), session_id.clone(), idx as u32), tx))
            })
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn transaction(&self, id: &TransactionId) -> Option<&Transaction> {
        self.sessions
            .get(&id.session_id)?
            .transactions()
            .get(id.tx_index as usize)
    }

    /// Content messages bringing a peer at `known` up to date, or `None` if
    /// the peer already has everything.
    ///
    /// Output is split into pieces at checkpoint signatures and whenever a
    /// piece would exceed the recommended size. The first piece carries the
    /// header when the peer lacks it, and `expectContentUntil` when several
    /// pieces are produced.
    pub fn new_content_since(&self, known: Option<&KnownState>) -> Option<Vec<ContentMessage>> {
        let empty = KnownState::empty(self.id.clone());
        let known = known.unwrap_or(&empty);
        let priority = CoValuePriority::for_header(&self.header);
        let max_piece = self.config.max_tx_size_bytes.max(1).min(MAX_RECOMMENDED_TX_SIZE);

        let mut first = ContentMessage::new(self.id.clone(), priority);
        if !known.header {
            first.header = Some(self.header.clone());
        }
        let mut pieces = vec![first];
        let mut piece_sizes = vec![0usize];

        for (session_id, log) in &self.sessions {
            if self.deleted && !session_id.is_delete() {
                continue;
            }
            let from = known.count(session_id);
            if from >= log.len() {
                continue;
            }
            for (start, end, signature) in log.signed_ranges_from(from) {
                let txs = &log.transactions()[start as usize..end as usize];
                let size: usize = txs.iter().map(Transaction::size).sum();
                let current = pieces.len() - 1;
                let needs_new = pieces[current].new.contains_key(session_id)
                    || (piece_sizes[current] > 0 && piece_sizes[current] + size > max_piece);
                if needs_new {
                    pieces.push(ContentMessage::new(self.id.clone(), priority));
                    piece_sizes.push(0);
                }
                let current = pieces.len() - 1;
                pieces[current].new.insert(
                    session_id.clone(),
                    SessionNewContent {
                        after: start,
                        new_transactions: txs.to_vec(),
                        last_signature: signature.to_string(),
                    },
                );
                piece_sizes[current] += size;
            }
        }

        if pieces.len() == 1 && pieces[0].is_empty() {
            return None;
        }
        if pieces.len() > 1 {
            pieces[0].expect_content_until = Some(self.known_state().sessions);
        }
        Some(pieces)
    }
}
