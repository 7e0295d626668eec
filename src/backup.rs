//! Passphrase-protected backup envelope.
//!
//! A backup is one [`EncryptedRecord`] whose plaintext is a serialized
//! snapshot of every key and credential in the store, encrypted with the
//! same AEAD scheme as live records so it inherits the same tamper evidence
//! and passphrase-oracle resistance.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::crypto::{self, base64_bytes, EncryptedRecord};
use crate::error::{Operation, StorageError, StorageResult};

const SNAPSHOT_VERSION: u32 = 1;

/// One key entry inside a backup snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BackupKey {
    pub key_id: String,
    #[serde(with = "base64_bytes")]
    pub material: Vec<u8>,
}

/// One credential entry inside a backup snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BackupCredential {
    pub credential_id: String,
    pub credential: serde_json::Value,
}

/// The plaintext interior of a backup envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BackupSnapshot {
    pub snapshot_version: u32,
    pub keys: Vec<BackupKey>,
    pub credentials: Vec<BackupCredential>,
}

impl BackupSnapshot {
    pub(crate) fn new(
        keys: Vec<(String, Vec<u8>)>,
        credentials: Vec<(String, serde_json::Value)>,
    ) -> Self {
        Self {
            snapshot_version: SNAPSHOT_VERSION,
            keys: keys
                .into_iter()
                .map(|(key_id, material)| BackupKey { key_id, material })
                .collect(),
            credentials: credentials
                .into_iter()
                .map(|(credential_id, credential)| BackupCredential {
                    credential_id,
                    credential,
                })
                .collect(),
        }
    }

    /// Validates the snapshot's internal structure completely.
    ///
    /// Called before any restored entry becomes visible, so a malformed or
    /// partially-parsed snapshot is never partially applied.
    fn validate(&self) -> StorageResult<()> {
        if self.snapshot_version != SNAPSHOT_VERSION {
            return Err(StorageError::restore(format!(
                "unsupported snapshot version {}",
                self.snapshot_version
            )));
        }

        let mut seen = HashSet::new();
        for key in &self.keys {
            if key.key_id.is_empty() {
                return Err(StorageError::restore("snapshot contains an empty key id"));
            }
            if !seen.insert(key.key_id.as_str()) {
                return Err(StorageError::restore(format!(
                    "snapshot contains duplicate key id {:?}",
                    key.key_id
                )));
            }
        }

        let mut seen = HashSet::new();
        for credential in &self.credentials {
            if credential.credential_id.is_empty() {
                return Err(StorageError::restore(
                    "snapshot contains an empty credential id",
                ));
            }
            if !seen.insert(credential.credential_id.as_str()) {
                return Err(StorageError::restore(format!(
                    "snapshot contains duplicate credential id {:?}",
                    credential.credential_id
                )));
            }
        }
        Ok(())
    }
}

/// Serializes and encrypts a snapshot into an opaque, self-contained string.
pub(crate) fn seal(snapshot: &BackupSnapshot, passphrase: &str) -> StorageResult<String> {
    let plaintext = serde_json::to_vec(snapshot)
        .map_err(|err| StorageError::backup(format!("snapshot serialization failed: {err}")))?;
    let record = crypto::encrypt(&plaintext, passphrase)
        .map_err(|err| StorageError::backup(format!("envelope encryption failed: {err}")))?;
    serde_json::to_string(&record)
        .map_err(|err| StorageError::backup(format!("envelope serialization failed: {err}")))
}

/// Decrypts and fully validates a backup produced by [`seal`].
pub(crate) fn open(data: &str, passphrase: &str) -> StorageResult<BackupSnapshot> {
    let record: EncryptedRecord = serde_json::from_str(data).map_err(|err| {
        StorageError::restore(format!("backup data is not a valid envelope: {err}"))
    })?;
    let plaintext = crypto::decrypt(&record, passphrase)
        .map_err(|err| StorageError::from_crypto(Operation::Restore, err))?;
    let snapshot: BackupSnapshot = serde_json::from_slice(&plaintext)
        .map_err(|err| StorageError::restore(format!("snapshot deserialization failed: {err}")))?;
    snapshot.validate()?;
    Ok(snapshot)
}
