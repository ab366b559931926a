//! Per-session, hash-chained, signed transaction logs.

use cojson_crypto::{CryptoResult, Hash, Signature, SignerId, TransactionHasher};
use cojson_types::Transaction;
use std::collections::BTreeMap;

/// Default in-between signature threshold.
pub const MAX_RECOMMENDED_TX_SIZE: usize = 100 * 1024;

#[derive(Debug, Clone)]
pub struct SessionLogConfig {
    /// Payload bytes after which the signature of a batch is kept as a checkpoint.
    pub max_tx_size_bytes: usize,
}

impl Default for SessionLogConfig {
    fn default() -> Self {
        Self {
            max_tx_size_bytes: MAX_RECOMMENDED_TX_SIZE,
        }
    }
}

/// The append-only log of one writer-device.
///
/// Only the latest signature is strictly needed to verify the whole chain.
/// Checkpoints in `signature_after` let content be streamed in pieces, each
/// of which can be verified on arrival.
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    transactions: Vec<Transaction>,
    last_hash: Option<Hash>,
    last_signature: Option<Signature>,
    signature_after: BTreeMap<u32, Signature>,
    bytes_since_last_signature: usize,
}

impl SessionLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> u32 {
        self.transactions.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn last_signature(&self) -> Option<&Signature> {
        self.last_signature.as_ref()
    }

    pub fn last_hash(&self) -> Option<Hash> {
        self.last_hash
    }

    /// Checkpoint signatures keyed by the index of the last covered transaction.
    pub fn signature_after(&self) -> &BTreeMap<u32, Signature> {
        &self.signature_after
    }

    pub fn bytes_since_last_signature(&self) -> usize {
        self.bytes_since_last_signature
    }

    /// Hash the chain would have after appending `txs`. Does not mutate.
    pub fn expected_hash_after(&self, txs: &[Transaction]) -> CryptoResult<Option<Hash>> {
        let mut hasher = TransactionHasher::resume(self.last_hash);
        for tx in txs {
            hasher.update(tx)?;
        }
        Ok(hasher.current())
    }

    /// Checks `signature` over the chain extended by `txs`.
    pub fn verify(
        &self,
        txs: &[Transaction],
        signature: &Signature,
        signer: &SignerId,
    ) -> CryptoResult<Hash> {
        let hash = self
            .expected_hash_after(txs)?
            .ok_or_else(|| cojson_crypto::CryptoError::SignatureMismatch {
                signer: signer.to_string(),
            })?;
        signer.verify(&hash, signature)?;
        Ok(hash)
    }

    /// Appends already verified transactions.
    pub fn commit(
        &mut self,
        txs: Vec<Transaction>,
        hash: Hash,
        signature: Signature,
        config: &SessionLogConfig,
    ) {
        if txs.is_empty() {
            return;
        }
        self.bytes_since_last_signature += txs.iter().map(Transaction::size).sum::<usize>();
        self.transactions.extend(txs);
        self.last_hash = Some(hash);
        if self.bytes_since_last_signature > config.max_tx_size_bytes {
            let last_idx = self.len() - 1;
            self.signature_after.insert(last_idx, signature);
            self.bytes_since_last_signature = 0;
        }
        self.last_signature = Some(signature);
    }

    /// Restores checkpoint state loaded from storage.
    pub fn restore_checkpoints(
        &mut self,
        signature_after: BTreeMap<u32, Signature>,
        bytes_since_last_signature: usize,
    ) {
        self.signature_after.extend(signature_after);
        self.bytes_since_last_signature = bytes_since_last_signature;
    }

    /// Splits `[from, len)` into ranges that each end on a signed index,
    /// paired with the signature covering that end.
    pub fn signed_ranges_from(&self, from: u32) -> Vec<(u32, u32, Signature)> {
        let len = self.len();
        let Some(last) = self.last_signature else {
            return Vec::new();
        };
        let mut ranges = Vec::new();
        let mut start = from;
        for (&idx, signature) in self.signature_after.range(from..len.saturating_sub(1)) {
            ranges.push((start, idx + 1, *signature));
            start = idx + 1;
        }
        if start < len {
            ranges.push((start, len, last));
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cojson_crypto::SignerSecret;

    fn tx(size: usize) -> Transaction {
        Transaction::Trusting {
            made_at: 1,
            changes: "x".repeat(size),
            meta: None,
        }
    }

    fn add(log: &mut SessionLog, secret: &SignerSecret, txs: Vec<Transaction>, config: &SessionLogConfig) {
        let hash = log.expected_hash_after(&txs).unwrap().unwrap();
        let signature = secret.sign(&hash);
        log.verify(&txs, &signature, &secret.signer_id()).unwrap();
        log.commit(txs, hash, signature, config);
    }

    #[test]
    fn checkpoint_recorded_when_size_exceeded() {
        let secret = SignerSecret::generate();
        let config = SessionLogConfig { max_tx_size_bytes: 10 };
        let mut log = SessionLog::new();
        add(&mut log, &secret, vec![tx(6)], &config);
        assert!(log.signature_after().is_empty());
        add(&mut log, &secret, vec![tx(6)], &config);
        assert_eq!(log.signature_after().keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(log.bytes_since_last_signature(), 0);
    }

    #[test]
    fn signed_ranges_split_on_checkpoints() {
        let secret = SignerSecret::generate();
        let config = SessionLogConfig { max_tx_size_bytes: 10 };
        let mut log = SessionLog::new();
        for _ in 0..5 {
            add(&mut log, &secret, vec![tx(6)], &config);
        }
        // checkpoints after idx 1 and 3
        let ranges: Vec<(u32, u32)> = log.signed_ranges_from(0).iter().map(|r| (r.0, r.1)).collect();
        assert_eq!(ranges, vec![(0, 2), (2, 4), (4, 5)]);
        let tail: Vec<(u32, u32)> = log.signed_ranges_from(3).iter().map(|r| (r.0, r.1)).collect();
        assert_eq!(tail, vec![(3, 4), (4, 5)]);
    }

    #[test]
    fn wrong_signer_is_rejected() {
        let secret = SignerSecret::generate();
        let other = SignerSecret::generate();
        let log = SessionLog::new();
        let txs = vec![tx(1)];
        let hash = log.expected_hash_after(&txs).unwrap().unwrap();
        assert!(log.verify(&txs, &secret.sign(&hash), &other.signer_id()).is_err());
    }
}
