//! Property-based tests for the crypto provider.
//!
//! - Encryption is reversible with the correct key
//! - Sealed payloads open only for the recipient
//! - Any single-byte change to a transaction breaks its chain signature

use cojson_crypto::{
    decrypt, encrypt, new_random_key, seal, unseal, SealerSecret, SignerSecret, TransactionHasher,
};
use cojson_types::Transaction;
use proptest::prelude::*;

fn tx(changes: &str) -> Transaction {
    Transaction::Trusting {
        made_at: 1,
        changes: changes.to_string(),
        meta: None,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn encrypt_decrypt_roundtrip(plaintext in prop::collection::vec(any::<u8>(), 0..2000)) {
        let (_, key) = new_random_key();
        let encrypted = encrypt(&key, &plaintext).unwrap();
        prop_assert_eq!(decrypt(&key, &encrypted).unwrap(), plaintext);
    }

    #[test]
    fn seal_roundtrip(message in prop::collection::vec(any::<u8>(), 0..512)) {
        let recipient = SealerSecret::generate();
        let sealed = seal(&message, &recipient.sealer_id()).unwrap();
        prop_assert_eq!(unseal(&sealed, &recipient).unwrap(), message);
    }

    #[test]
    fn single_byte_tamper_breaks_signature(
        changes in "[a-z]{4,32}",
        position in any::<prop::sample::Index>(),
    ) {
        let secret = SignerSecret::generate();
        let mut hasher = TransactionHasher::new();
        hasher.update(&tx("[0]")).unwrap();
        let original = hasher.clone().update(&tx(&changes)).unwrap();
        let signature = secret.sign(&original);

        let mut bytes = changes.clone().into_bytes();
        let idx = position.index(bytes.len());
        bytes[idx] = if bytes[idx] == b'z' { b'a' } else { bytes[idx] + 1 };
        let tampered = String::from_utf8(bytes).unwrap();

        let forged = hasher.update(&tx(&tampered)).unwrap();
        prop_assert!(secret.signer_id().verify(&forged, &signature).is_err());
    }
}
