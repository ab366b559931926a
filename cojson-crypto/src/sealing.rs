//! Public-key sealing of key secrets to a single recipient.
//!
//! A fresh ephemeral sender key is generated per message, so opening a sealed
//! payload needs only the recipient's secret. Payload layout before base64:
//! `ephemeral public key (32) || nonce (24) || ciphertext`.

use crate::error::{CryptoError, CryptoResult, bad_encoding, decode_base64, decode_hex_array, encode_base64};
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use std::fmt;

const SECRET_PREFIX: &str = "sealerSecret_z";
const ID_PREFIX: &str = "sealer_z";
const SEALED_PREFIX: &str = "sealed_U";
const PUBLIC_KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;

/// X25519 secret, textually `sealerSecret_z<hex>`.
#[derive(Clone)]
pub struct SealerSecret(SecretKey);

/// X25519 public key, textually `sealer_z<hex>`.
#[derive(Clone, PartialEq, Eq)]
pub struct SealerId(PublicKey);

impl SealerSecret {
    #[must_use]
    pub fn generate() -> Self {
        Self(SecretKey::generate(&mut OsRng))
    }

    pub fn parse(s: &str) -> CryptoResult<Self> {
        let bytes = decode_hex_array::<32>("sealer secret", SECRET_PREFIX, s)?;
        Ok(Self(SecretKey::from_bytes(bytes)))
    }

    pub fn sealer_id(&self) -> SealerId {
        SealerId(self.0.public_key())
    }
}

impl fmt::Display for SealerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SECRET_PREFIX}{}", hex::encode(self.0.to_bytes()))
    }
}

impl fmt::Debug for SealerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SealerSecret").field(&"[REDACTED]").finish()
    }
}

impl SealerId {
    pub fn parse(s: &str) -> CryptoResult<Self> {
        let bytes = decode_hex_array::<32>("sealer id", ID_PREFIX, s)?;
        Ok(Self(PublicKey::from_bytes(bytes)))
    }
}

impl fmt::Display for SealerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ID_PREFIX}{}", hex::encode(self.0.as_bytes()))
    }
}

impl fmt::Debug for SealerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealerId({self})")
    }
}

/// Seals `message` so that only the holder of `to`'s secret can open it.
pub fn seal(message: &[u8], to: &SealerId) -> CryptoResult<String> {
    let ephemeral = SecretKey::generate(&mut OsRng);
    let sealing_box = SalsaBox::new(&to.0, &ephemeral);
    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let ciphertext = sealing_box
        .encrypt(&nonce, message)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut payload = Vec::with_capacity(PUBLIC_KEY_SIZE + NONCE_SIZE + ciphertext.len());
    payload.extend_from_slice(ephemeral.public_key().as_bytes());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    Ok(encode_base64(SEALED_PREFIX, &payload))
}

/// Opens a payload produced by [`seal`].
pub fn unseal(sealed: &str, secret: &SealerSecret) -> CryptoResult<Vec<u8>> {
    let payload = decode_base64("sealed", SEALED_PREFIX, sealed)?;
    if payload.len() < PUBLIC_KEY_SIZE + NONCE_SIZE {
        return Err(bad_encoding("sealed", "payload too short"));
    }
    let (sender, rest) = payload.split_at(PUBLIC_KEY_SIZE);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

    let mut sender_bytes = [0u8; PUBLIC_KEY_SIZE];
    sender_bytes.copy_from_slice(sender);
    let opening_box = SalsaBox::new(&PublicKey::from_bytes(sender_bytes), &secret.0);
    opening_box
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption("sealed payload rejected".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_unseal_roundtrip() {
        let recipient = SealerSecret::generate();
        let sealed = seal(b"key material", &recipient.sealer_id()).unwrap();
        assert!(sealed.starts_with("sealed_U"));
        assert_eq!(unseal(&sealed, &recipient).unwrap(), b"key material");
    }

    #[test]
    fn other_recipient_cannot_open() {
        let recipient = SealerSecret::generate();
        let stranger = SealerSecret::generate();
        let sealed = seal(b"secret", &recipient.sealer_id()).unwrap();
        assert!(unseal(&sealed, &stranger).is_err());
    }

    #[test]
    fn text_forms_roundtrip() {
        let secret = SealerSecret::generate();
        let parsed = SealerSecret::parse(&secret.to_string()).unwrap();
        assert_eq!(parsed.sealer_id(), secret.sealer_id());
        let id = secret.sealer_id();
        assert_eq!(SealerId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let secret = SealerSecret::generate();
        assert!(unseal("sealed_UAAAA", &secret).is_err());
    }
}
