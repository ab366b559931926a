//! Ed25519 signing of session hash chains.

use crate::error::{CryptoError, CryptoResult, decode_hex_array};
use crate::hash::Hash;
use ed25519_dalek::{
    Signature as DalekSignature, Signer as _, SigningKey as DalekSigningKey, Verifier as _,
    VerifyingKey as DalekVerifyingKey,
};
use rand::rngs::OsRng;
use std::fmt;

const SECRET_PREFIX: &str = "signerSecret_z";
const ID_PREFIX: &str = "signer_z";
const SIGNATURE_PREFIX: &str = "signature_z";

/// Ed25519 signing key, textually `signerSecret_z<hex>`.
#[derive(Clone)]
pub struct SignerSecret(DalekSigningKey);

/// Ed25519 verifying key, textually `signer_z<hex>`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignerId(DalekVerifyingKey);

/// Ed25519 signature, textually `signature_z<hex>`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(DalekSignature);

impl SignerSecret {
    /// Generates a new random signing key.
    #[must_use]
    pub fn generate() -> Self {
        Self(DalekSigningKey::generate(&mut OsRng))
    }

    pub fn parse(s: &str) -> CryptoResult<Self> {
        let bytes = decode_hex_array::<32>("signer secret", SECRET_PREFIX, s)?;
        Ok(Self(DalekSigningKey::from_bytes(&bytes)))
    }

    pub fn signer_id(&self) -> SignerId {
        SignerId(self.0.verifying_key())
    }

    /// Signs the textual form of `hash`.
    pub fn sign(&self, hash: &Hash) -> Signature {
        Signature(self.0.sign(hash.to_string().as_bytes()))
    }
}

impl fmt::Display for SignerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SECRET_PREFIX}{}", hex::encode(self.0.to_bytes()))
    }
}

impl fmt::Debug for SignerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SignerSecret").field(&"[REDACTED]").finish()
    }
}

impl SignerId {
    pub fn parse(s: &str) -> CryptoResult<Self> {
        let bytes = decode_hex_array::<32>("signer id", ID_PREFIX, s)?;
        DalekVerifyingKey::from_bytes(&bytes)
            .map(Self)
            .map_err(|e| crate::error::bad_encoding("signer id", e.to_string()))
    }

    /// Verifies `signature` over the textual form of `hash`.
    pub fn verify(&self, hash: &Hash, signature: &Signature) -> CryptoResult<()> {
        self.0
            .verify(hash.to_string().as_bytes(), &signature.0)
            .map_err(|_| CryptoError::SignatureMismatch {
                signer: self.to_string(),
            })
    }
}

impl fmt::Display for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ID_PREFIX}{}", hex::encode(self.0.to_bytes()))
    }
}

impl fmt::Debug for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerId({self})")
    }
}

impl Signature {
    pub fn parse(s: &str) -> CryptoResult<Self> {
        let bytes = decode_hex_array::<64>("signature", SIGNATURE_PREFIX, s)?;
        Ok(Self(DalekSignature::from_bytes(&bytes)))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SIGNATURE_PREFIX}{}", hex::encode(self.0.to_bytes()))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({self})")
    }
}

/// Verifies a textual signature against a textual signer id.
pub fn verify(signer_id: &str, hash: &Hash, signature: &str) -> CryptoResult<()> {
    SignerId::parse(signer_id)?.verify(hash, &Signature::parse(signature)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::TransactionHasher;
    use cojson_types::Transaction;

    fn some_hash(n: u64) -> Hash {
        TransactionHasher::new()
            .update(&Transaction::Trusting {
                made_at: n,
                changes: "[]".into(),
                meta: None,
            })
            .unwrap()
    }

    #[test]
    fn sign_verify_roundtrip() {
        let secret = SignerSecret::generate();
        let hash = some_hash(1);
        let sig = secret.sign(&hash);
        assert!(secret.signer_id().verify(&hash, &sig).is_ok());
    }

    #[test]
    fn wrong_hash_fails() {
        let secret = SignerSecret::generate();
        let sig = secret.sign(&some_hash(1));
        assert!(secret.signer_id().verify(&some_hash(2), &sig).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let a = SignerSecret::generate();
        let b = SignerSecret::generate();
        let hash = some_hash(1);
        assert!(b.signer_id().verify(&hash, &a.sign(&hash)).is_err());
    }

    #[test]
    fn text_forms_roundtrip() {
        let secret = SignerSecret::generate();
        let parsed = SignerSecret::parse(&secret.to_string()).unwrap();
        assert_eq!(parsed.signer_id(), secret.signer_id());

        let id = secret.signer_id();
        assert!(id.to_string().starts_with("signer_z"));
        assert_eq!(SignerId::parse(&id.to_string()).unwrap(), id);

        let hash = some_hash(3);
        let sig = secret.sign(&hash);
        assert!(verify(&id.to_string(), &hash, &sig.to_string()).is_ok());
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = SignerSecret::generate();
        assert!(format!("{secret:?}").contains("REDACTED"));
    }
}
