//! SHA-256 hashing: short hashes for ids and the per-session hash chain.

use crate::error::{CryptoResult, decode_hex_array};
use cojson_types::{Transaction, stable_json};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

const HASH_PREFIX: &str = "hash_z";

/// Number of digest bytes kept in a short hash (32 hex chars).
pub const SHORT_HASH_BYTES: usize = 16;

/// Hex of the first 16 bytes of SHA-256 over the canonical JSON of `value`.
pub fn short_hash<T: Serialize + ?Sized>(value: &T) -> CryptoResult<String> {
    let json = stable_json(value)?;
    let digest = Sha256::digest(json.as_bytes());
    Ok(hex::encode(&digest[..SHORT_HASH_BYTES]))
}

/// A full SHA-256 digest, textually `hash_z<hex>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash([u8; 32]);

impl Hash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn parse(s: &str) -> CryptoResult<Self> {
        Ok(Self(decode_hex_array::<32>("hash", HASH_PREFIX, s)?))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{HASH_PREFIX}{}", hex::encode(self.0))
    }
}

/// Cumulative hash over a session's transactions.
///
/// `h_1 = sha256(json(tx_1))`, `h_n = sha256(h_{n-1} || json(tx_n))`.
/// Cloning lets a caller try out a batch without committing it.
#[derive(Debug, Clone, Default)]
pub struct TransactionHasher {
    last: Option<[u8; 32]>,
}

impl TransactionHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resumes from a previously computed hash.
    #[must_use]
    pub fn resume(last: Option<Hash>) -> Self {
        Self {
            last: last.map(|h| h.0),
        }
    }

    pub fn update(&mut self, tx: &Transaction) -> CryptoResult<Hash> {
        let json = stable_json(tx)?;
        let mut hasher = Sha256::new();
        if let Some(prev) = &self.last {
            hasher.update(prev);
        }
        hasher.update(json.as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        self.last = Some(digest);
        Ok(Hash(digest))
    }

    /// Hash after the last update, `None` before any transaction.
    pub fn current(&self) -> Option<Hash> {
        self.last.map(Hash)
    }
}
