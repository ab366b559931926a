//! Error types for the crypto provider.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur in cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed (wrong key or tampered data).
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Signature does not match the signed hash.
    #[error("signature verification failed for {signer}")]
    SignatureMismatch { signer: String },

    /// A textual key, id, signature or ciphertext is malformed.
    #[error("invalid {kind} encoding: {reason}")]
    InvalidEncoding { kind: &'static str, reason: String },

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Canonical encoding of a value failed.
    #[error("encoding error: {0}")]
    Types(#[from] cojson_types::Error),
}

pub(crate) fn bad_encoding(kind: &'static str, reason: impl Into<String>) -> CryptoError {
    CryptoError::InvalidEncoding {
        kind,
        reason: reason.into(),
    }
}

/// Strips `prefix` and hex-decodes a fixed-size array.
pub(crate) fn decode_hex_array<const N: usize>(
    kind: &'static str,
    prefix: &str,
    s: &str,
) -> CryptoResult<[u8; N]> {
    let hex_part = s
        .strip_prefix(prefix)
        .ok_or_else(|| bad_encoding(kind, format!("missing prefix {prefix}")))?;
    let bytes = hex::decode(hex_part).map_err(|e| bad_encoding(kind, e.to_string()))?;
    bytes.try_into().map_err(|v: Vec<u8>| CryptoError::InvalidKeyLength {
        expected: N,
        actual: v.len(),
    })
}

/// Strips `prefix` and base64-decodes the rest.
pub(crate) fn decode_base64(kind: &'static str, prefix: &str, s: &str) -> CryptoResult<Vec<u8>> {
    use base64::{Engine, engine::general_purpose::STANDARD};
    let encoded = s
        .strip_prefix(prefix)
        .ok_or_else(|| bad_encoding(kind, format!("missing prefix {prefix}")))?;
    STANDARD
        .decode(encoded)
        .map_err(|e| bad_encoding(kind, format!("invalid base64: {e}")))
}

pub(crate) fn encode_base64(prefix: &str, bytes: &[u8]) -> String {
    use base64::{Engine, engine::general_purpose::STANDARD};
    format!("{prefix}{}", STANDARD.encode(bytes))
}
