//! Symmetric read/write keys of groups.

use crate::error::{CryptoResult, decode_hex_array};
use cojson_types::KeyId;
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of symmetric keys in bytes (256 bits for ChaCha20).
pub const KEY_SIZE: usize = 32;

const SECRET_PREFIX: &str = "keySecret_z";

/// A symmetric key with automatic zeroization on drop, textually `keySecret_z<hex>`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeySecret {
    bytes: [u8; KEY_SIZE],
}

impl KeySecret {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    pub fn parse(s: &str) -> CryptoResult<Self> {
        decode_hex_array::<KEY_SIZE>("key secret", SECRET_PREFIX, s).map(Self::from_bytes)
    }

    /// Text form for embedding in group content. Not `Display`, so that
    /// secrets are never formatted by accident.
    pub fn to_secret_string(&self) -> String {
        format!("{SECRET_PREFIX}{}", hex::encode(self.bytes))
    }
}

impl PartialEq for KeySecret {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for KeySecret {}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySecret")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Random bytes, hex encoded. Used for id suffixes.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generates a fresh key and its random id.
pub fn new_random_key() -> (KeyId, KeySecret) {
    let mut bytes = [0u8; KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    (KeyId::from_hex(&random_hex(12)), KeySecret::from_bytes(bytes))
}
