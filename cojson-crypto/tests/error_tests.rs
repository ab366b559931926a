use cojson_crypto::{
    CryptoError, Hash, KeySecret, SealerSecret, Signature, SignerId, SignerSecret, decrypt,
    decrypt_changes, encrypt, encrypt_changes, new_random_key, seal, unseal,
};

fn some_hash() -> Hash {
    Hash::parse(&format!("hash_z{}", "ab".repeat(32))).unwrap()
}

// ── Decryption ───────────────────────────────────────────────────

#[test]
fn wrong_key_fails_decryption() {
    let (_, key) = new_random_key();
    let (_, other) = new_random_key();
    let encrypted = encrypt(&key, b"secret").unwrap();

    let err = decrypt(&other, &encrypted).unwrap_err();
    assert!(matches!(err, CryptoError::Decryption(_)));
    assert!(err.to_string().contains("decryption failed"));
}

#[test]
fn truncated_ciphertext_is_bad_encoding() {
    let (_, key) = new_random_key();
    let err = decrypt_changes("encrypted_UAAAA", &key).unwrap_err();
    assert!(matches!(err, CryptoError::InvalidEncoding { kind: "encrypted", .. }));
}

#[test]
fn changes_without_prefix_are_rejected() {
    let (_, key) = new_random_key();
    let encrypted = encrypt_changes("[]", &key).unwrap();
    let stripped = encrypted.trim_start_matches("encrypted_U");

    let err = decrypt_changes(stripped, &key).unwrap_err();
    assert!(err.to_string().contains("missing prefix encrypted_U"));
}

#[test]
fn sealed_for_someone_else_cannot_be_opened() {
    let recipient = SealerSecret::generate();
    let outsider = SealerSecret::generate();
    let sealed = seal(b"key material", &recipient.sealer_id()).unwrap();

    let err = unseal(&sealed, &outsider).unwrap_err();
    assert!(matches!(err, CryptoError::Decryption(_)));
}

// ── Encodings ────────────────────────────────────────────────────

#[test]
fn short_key_reports_both_lengths() {
    let err = KeySecret::parse(&format!("keySecret_z{}", "00".repeat(16))).unwrap_err();
    assert!(matches!(err, CryptoError::InvalidKeyLength { expected: 32, actual: 16 }));
    let msg = err.to_string();
    assert!(msg.contains("32"));
    assert!(msg.contains("16"));
}

#[test]
fn bad_prefix_is_reported() {
    let err = SignerId::parse("sealer_z00").unwrap_err();
    assert!(matches!(err, CryptoError::InvalidEncoding { kind: "signer id", .. }));
}

#[test]
fn non_hex_signature_is_bad_encoding() {
    let err = Signature::parse("signature_zxyz").unwrap_err();
    assert!(matches!(err, CryptoError::InvalidEncoding { kind: "signature", .. }));
}

// ── Signatures ───────────────────────────────────────────────────

#[test]
fn foreign_signature_names_the_signer() {
    let signer = SignerSecret::generate();
    let forger = SignerSecret::generate();
    let signature = forger.sign(&some_hash());

    let err = signer.signer_id().verify(&some_hash(), &signature).unwrap_err();
    assert!(matches!(err, CryptoError::SignatureMismatch { .. }));
    assert!(err.to_string().contains(&signer.signer_id().to_string()));
}

#[test]
fn error_from_serde() {
    let json_err = serde_json::from_str::<String>("{").unwrap_err();
    let err: CryptoError = json_err.into();
    assert!(matches!(err, CryptoError::Serialization(_)));
}
