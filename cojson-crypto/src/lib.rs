//! Crypto provider for cojson.
//!
//! Pure functions over key material; nothing here holds state beyond keys.
//! - SHA-256 short hashes and per-session hash chains
//! - Ed25519 signatures over chain hashes
//! - X25519 sealed boxes for revealing keys to a single member
//! - ChaCha20-Poly1305 for private transactions and key-to-key revelations
//!
//! Every key, id, signature and ciphertext has a prefixed text form; those
//! strings are what is stored in group content and sent on the wire.

mod agent;
mod cipher;
mod error;
mod hash;
mod key;
mod sealing;
mod signing;

pub use agent::{
    AgentSecret, new_delete_session_id, new_random_agent_secret, new_random_session_id,
};
pub use cipher::{
    NONCE_SIZE, TAG_SIZE, decrypt, decrypt_changes, decrypt_key_secret, encrypt, encrypt_changes,
    encrypt_key_secret,
};
pub use error::{CryptoError, CryptoResult};
pub use hash::{Hash, SHORT_HASH_BYTES, TransactionHasher, short_hash};
pub use key::{KEY_SIZE, KeySecret, new_random_key, random_hex};
pub use sealing::{SealerId, SealerSecret, seal, unseal};
pub use signing::{Signature, SignerId, SignerSecret, verify};
