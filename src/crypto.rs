//! Cryptographic engine for at-rest encryption.
//!
//! Every persisted payload is an [`EncryptedRecord`] produced here:
//! AES-256-GCM under a key stretched from the caller's passphrase with
//! PBKDF2-HMAC-SHA256. The engine is stateless; backends differ only in
//! where the records live.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

/// Wire format version written into every new record.
pub const FORMAT_VERSION: u32 = 1;

/// PBKDF2 iteration count for freshly encrypted records.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// AEAD algorithm identifier written into every new record.
pub const ALGORITHM: &str = "AES-256-GCM";

pub(crate) const SALT_SIZE: usize = 16;
pub(crate) const IV_SIZE: usize = 12;
pub(crate) const KEY_SIZE: usize = 32;

/// Errors raised by the crypto engine.
///
/// Converted into the storage taxonomy (with the failing operation attached)
/// at the backend boundary.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Authentication failed: wrong passphrase or tampered ciphertext.
    /// The two causes are intentionally indistinguishable.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Malformed record or invalid external key representation.
    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

/// The at-rest representation of one encrypted payload.
///
/// Self-describing: the record carries its own format version, algorithm
/// identifier, and KDF iteration count so old records stay readable after
/// defaults change. Created exclusively by [`encrypt`]; immutable once
/// created; consumed only by [`decrypt`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedRecord {
    /// Wire format version, currently 1.
    pub format_version: u32,
    /// AEAD algorithm identifier.
    pub algorithm: String,
    /// PBKDF2 iteration count used to derive this record's key.
    pub iterations: u32,
    /// Ciphertext with the 128-bit authentication tag appended.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// 12-byte AES-GCM nonce, unique per encryption.
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    /// 16-byte PBKDF2 salt, unique per encryption.
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
}

impl std::fmt::Debug for EncryptedRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedRecord")
            .field("format_version", &self.format_version)
            .field("algorithm", &self.algorithm)
            .field("iterations", &self.iterations)
            .field("ciphertext", &format!("[{} bytes]", self.ciphertext.len()))
            .field("iv", &format!("[{} bytes]", self.iv.len()))
            .field("salt", &format!("[{} bytes]", self.salt.len()))
            .finish()
    }
}

/// External representation of key material.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum KeyFormat {
    /// Standard base64 with padding.
    Base64,
    /// Lowercase hexadecimal.
    Hex,
}

impl KeyFormat {
    /// Encodes raw bytes in this format.
    #[must_use]
    pub fn encode(self, bytes: &[u8]) -> String {
        match self {
            Self::Base64 => base64_bytes::encode(bytes),
            Self::Hex => hex::encode(bytes),
        }
    }

    /// Decodes an external representation back into raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidFormat`] if `input` is not valid in
    /// this format.
    pub fn decode(self, input: &str) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Base64 => base64_bytes::decode(input)
                .map_err(|err| CryptoError::InvalidFormat(format!("invalid base64: {err}"))),
            Self::Hex => hex::decode(input)
                .map_err(|err| CryptoError::InvalidFormat(format!("invalid hex: {err}"))),
        }
    }
}

/// Encrypts `plaintext` under a key derived from `passphrase`.
///
/// Generates a fresh 16-byte salt and 12-byte IV per call, so two
/// encryptions of identical inputs never produce identical records.
///
/// # Errors
///
/// Returns [`CryptoError::EncryptionFailed`] if the AEAD rejects the input.
pub fn encrypt(plaintext: &[u8], passphrase: &str) -> Result<EncryptedRecord, CryptoError> {
    let mut salt = vec![0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    let mut iv = vec![0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let key = derive_key(passphrase, &salt, PBKDF2_ITERATIONS);
    let cipher =
        Aes256Gcm::new_from_slice(key.as_slice()).expect("key length is always 32");

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed("AES-256-GCM seal failed".to_string()))?;

    Ok(EncryptedRecord {
        format_version: FORMAT_VERSION,
        algorithm: ALGORITHM.to_string(),
        iterations: PBKDF2_ITERATIONS,
        ciphertext,
        iv,
        salt,
    })
}

/// Decrypts a record produced by [`encrypt`].
///
/// # Errors
///
/// Returns [`CryptoError::InvalidFormat`] for a record this engine cannot
/// interpret (unknown version or algorithm, truncated iv/salt), and
/// [`CryptoError::DecryptionFailed`] when authentication fails -- which
/// covers both a wrong passphrase and tampered ciphertext.
pub fn decrypt(record: &EncryptedRecord, passphrase: &str) -> Result<Vec<u8>, CryptoError> {
    if record.format_version != FORMAT_VERSION {
        return Err(CryptoError::InvalidFormat(format!(
            "unsupported record format version {}",
            record.format_version
        )));
    }
    if record.algorithm != ALGORITHM {
        return Err(CryptoError::InvalidFormat(format!(
            "unsupported algorithm {}",
            record.algorithm
        )));
    }
    if record.iv.len() != IV_SIZE {
        return Err(CryptoError::InvalidFormat(format!(
            "iv length mismatch: expected {IV_SIZE}, got {}",
            record.iv.len()
        )));
    }
    if record.salt.len() != SALT_SIZE {
        return Err(CryptoError::InvalidFormat(format!(
            "salt length mismatch: expected {SALT_SIZE}, got {}",
            record.salt.len()
        )));
    }

    let key = derive_key(passphrase, &record.salt, record.iterations);
    let cipher =
        Aes256Gcm::new_from_slice(key.as_slice()).expect("key length is always 32");

    cipher
        .decrypt(Nonce::from_slice(&record.iv), record.ciphertext.as_ref())
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Derives a 256-bit key from a passphrase and salt.
///
/// Pure and deterministic for fixed inputs. The result is zeroized on drop.
#[must_use]
pub fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, key.as_mut());
    key
}

/// Generates 32 random bytes suitable for use as a raw symmetric key.
#[must_use]
pub fn generate_encryption_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Checks a candidate passphrase against the subsystem policy.
///
/// A passphrase passes only if it is at least 8 characters long and contains
/// at least one uppercase letter, one lowercase letter, one digit, and one
/// ASCII punctuation symbol.
#[must_use]
pub fn validate_passphrase(candidate: &str) -> bool {
    candidate.chars().count() >= 8
        && candidate.chars().any(char::is_uppercase)
        && candidate.chars().any(char::is_lowercase)
        && candidate.chars().any(|c| c.is_ascii_digit())
        && candidate.chars().any(|c| c.is_ascii_punctuation())
}

/// Converts key material between external representations.
///
/// Identity when `from == to`; the empty string maps to the empty string.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidFormat`] when `key` is not valid in the
/// `from` representation.
pub fn convert_key_format(
    key: &str,
    from: KeyFormat,
    to: KeyFormat,
) -> Result<String, CryptoError> {
    if key.is_empty() {
        return Ok(String::new());
    }
    if from == to {
        return Ok(key.to_owned());
    }
    let bytes = from.decode(key)?;
    Ok(to.encode(&bytes))
}

/// Re-encrypts a set of records from an old passphrase to a new one.
///
/// All-or-nothing: every record is decrypted before the first re-encryption,
/// so a single wrong-passphrase failure yields an error with no partial
/// output. Each re-encrypted record gets a fresh salt and IV.
///
/// # Errors
///
/// Returns [`CryptoError::DecryptionFailed`] if any record fails to decrypt
/// under `old_passphrase`, or [`CryptoError::EncryptionFailed`] if a
/// re-encryption fails.
pub fn reencrypt_records(
    records: &[(String, EncryptedRecord)],
    old_passphrase: &str,
    new_passphrase: &str,
) -> Result<Vec<(String, EncryptedRecord)>, CryptoError> {
    let mut plaintexts = Vec::with_capacity(records.len());
    for (id, record) in records {
        plaintexts.push((id, Zeroizing::new(decrypt(record, old_passphrase)?)));
    }

    let mut rotated = Vec::with_capacity(records.len());
    for (id, plaintext) in plaintexts {
        rotated.push((id.clone(), encrypt(&plaintext, new_passphrase)?));
    }
    Ok(rotated)
}

/// Serde helper encoding byte fields as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, DecodeError, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn encode(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    pub fn decode(input: &str) -> Result<Vec<u8>, DecodeError> {
        STANDARD.decode(input.as_bytes())
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        decode(&encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSPHRASE: &str = "correct horse battery staple";

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let plaintext = b"identity key material";
        let record = encrypt(plaintext, PASSPHRASE).unwrap();
        assert_eq!(record.format_version, FORMAT_VERSION);
        assert_eq!(record.algorithm, ALGORITHM);
        assert_eq!(record.iv.len(), 12);
        assert_eq!(record.salt.len(), 16);
        // ciphertext is plaintext plus the 16-byte tag
        assert_eq!(record.ciphertext.len(), plaintext.len() + 16);

        let decrypted = decrypt(&record, PASSPHRASE).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_empty_plaintext_round_trip() {
        let record = encrypt(b"", PASSPHRASE).unwrap();
        assert_eq!(decrypt(&record, PASSPHRASE).unwrap(), b"");
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let record = encrypt(b"secret", PASSPHRASE).unwrap();
        let result = decrypt(&record, "not the passphrase");
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_tampered_fields_fail_authentication() {
        let record = encrypt(b"secret", PASSPHRASE).unwrap();

        let mut tampered = record.clone();
        tampered.ciphertext[0] ^= 0x01;
        assert!(matches!(
            decrypt(&tampered, PASSPHRASE),
            Err(CryptoError::DecryptionFailed)
        ));

        let mut tampered = record.clone();
        tampered.iv[0] ^= 0x01;
        assert!(matches!(
            decrypt(&tampered, PASSPHRASE),
            Err(CryptoError::DecryptionFailed)
        ));

        let mut tampered = record;
        tampered.salt[0] ^= 0x01;
        assert!(matches!(
            decrypt(&tampered, PASSPHRASE),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_encryption_is_non_deterministic() {
        let first = encrypt(b"same input", PASSPHRASE).unwrap();
        let second = encrypt(b"same input", PASSPHRASE).unwrap();
        assert_ne!((&first.iv, &first.salt), (&second.iv, &second.salt));
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn test_unsupported_version_is_invalid_format() {
        let mut record = encrypt(b"secret", PASSPHRASE).unwrap();
        record.format_version = 99;
        assert!(matches!(
            decrypt(&record, PASSPHRASE),
            Err(CryptoError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let salt = [7u8; 16];
        let a = derive_key("pass", &salt, 1_000);
        let b = derive_key("pass", &salt, 1_000);
        assert_eq!(*a, *b);

        let different_salt = derive_key("pass", &[8u8; 16], 1_000);
        assert_ne!(*a, *different_salt);
    }

    #[test]
    fn test_generated_keys_are_unique() {
        assert_ne!(generate_encryption_key(), generate_encryption_key());
    }

    #[test]
    fn test_passphrase_policy_boundaries() {
        assert!(validate_passphrase("Ab1!2345"));
        assert!(!validate_passphrase("Ab1!234")); // 7 chars
        assert!(!validate_passphrase("alllowercase1!"));
        assert!(!validate_passphrase("ALLUPPER1!"));
        assert!(!validate_passphrase("NoDigits!"));
        assert!(!validate_passphrase("NoSymbols123"));
    }

    #[test]
    fn test_convert_key_format_round_trip() {
        let key = base64_bytes::encode(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x42]);
        let hex = convert_key_format(&key, KeyFormat::Base64, KeyFormat::Hex).unwrap();
        let back = convert_key_format(&hex, KeyFormat::Hex, KeyFormat::Base64).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_convert_key_format_edges() {
        assert_eq!(
            convert_key_format("", KeyFormat::Base64, KeyFormat::Hex).unwrap(),
            ""
        );
        let same = convert_key_format("AAAA", KeyFormat::Base64, KeyFormat::Base64).unwrap();
        assert_eq!(same, "AAAA");
        assert!(matches!(
            convert_key_format("not-hex!", KeyFormat::Hex, KeyFormat::Base64),
            Err(CryptoError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_record_serde_wire_shape() {
        let record = encrypt(b"payload", PASSPHRASE).unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["formatVersion"], 1);
        assert_eq!(json["algorithm"], "AES-256-GCM");
        assert!(json["ciphertext"].is_string());
        assert!(json["iv"].is_string());
        assert!(json["salt"].is_string());

        let parsed: EncryptedRecord = serde_json::from_value(json).unwrap();
        assert_eq!(decrypt(&parsed, PASSPHRASE).unwrap(), b"payload");
    }

    #[test]
    fn test_reencrypt_records_rotates_everything() {
        let records = vec![
            ("a".to_string(), encrypt(b"first", "old!Pass1").unwrap()),
            ("b".to_string(), encrypt(b"second", "old!Pass1").unwrap()),
        ];

        let rotated = reencrypt_records(&records, "old!Pass1", "new!Pass2").unwrap();
        assert_eq!(rotated.len(), 2);
        assert_eq!(decrypt(&rotated[0].1, "new!Pass2").unwrap(), b"first");
        assert_eq!(decrypt(&rotated[1].1, "new!Pass2").unwrap(), b"second");
        assert!(matches!(
            decrypt(&rotated[0].1, "old!Pass1"),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_reencrypt_records_is_all_or_nothing() {
        let records = vec![
            ("a".to_string(), encrypt(b"first", "old!Pass1").unwrap()),
            ("b".to_string(), encrypt(b"stray", "other!Pass3").unwrap()),
        ];
        assert!(matches!(
            reencrypt_records(&records, "old!Pass1", "new!Pass2"),
            Err(CryptoError::DecryptionFailed)
        ));
    }
}
