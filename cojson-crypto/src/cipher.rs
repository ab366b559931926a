//! ChaCha20-Poly1305 encryption of private transactions and of key secrets.
//!
//! Ciphertexts are textually `encrypted_U<base64(nonce || ciphertext)>`.

use crate::error::{CryptoError, CryptoResult, bad_encoding, decode_base64, encode_base64};
use crate::key::KeySecret;
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;

/// Size of nonce in bytes (96 bits for ChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 12;

/// Size of authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

const ENCRYPTED_PREFIX: &str = "encrypted_U";

/// Encrypts raw bytes under `key`.
pub fn encrypt(key: &KeySecret, plaintext: &[u8]) -> CryptoResult<String> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut bytes = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    bytes.extend_from_slice(&nonce_bytes);
    bytes.extend_from_slice(&ciphertext);
    Ok(encode_base64(ENCRYPTED_PREFIX, &bytes))
}

/// Decrypts a payload produced by [`encrypt`].
pub fn decrypt(key: &KeySecret, encrypted: &str) -> CryptoResult<Vec<u8>> {
    let bytes = decode_base64("encrypted", ENCRYPTED_PREFIX, encrypted)?;
    if bytes.len() < NONCE_SIZE + TAG_SIZE {
        return Err(bad_encoding("encrypted", "data too short"));
    }
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| {
            CryptoError::Decryption("decryption failed (wrong key or tampered data)".to_string())
        })
}

/// Encrypts the canonical JSON of a transaction's changes.
pub fn encrypt_changes(changes_json: &str, key: &KeySecret) -> CryptoResult<String> {
    encrypt(key, changes_json.as_bytes())
}

pub fn decrypt_changes(encrypted: &str, key: &KeySecret) -> CryptoResult<String> {
    let plaintext = decrypt(key, encrypted)?;
    String::from_utf8(plaintext)
        .map_err(|e| CryptoError::Decryption(format!("invalid UTF-8: {e}")))
}

/// Encrypts one key secret under another, for key revelations and rotation.
pub fn encrypt_key_secret(to_encrypt: &KeySecret, encrypting: &KeySecret) -> CryptoResult<String> {
    encrypt(encrypting, to_encrypt.to_secret_string().as_bytes())
}

pub fn decrypt_key_secret(encrypted: &str, encrypting: &KeySecret) -> CryptoResult<KeySecret> {
    let plaintext = decrypt(encrypting, encrypted)?;
    let text = String::from_utf8(plaintext)
        .map_err(|e| CryptoError::Decryption(format!("invalid UTF-8: {e}")))?;
    KeySecret::parse(&text)
}
