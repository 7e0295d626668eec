//! Mobile keystore backend.
//!
//! Records are encrypted under the store passphrase like everywhere else,
//! then the serialized [`EncryptedRecord`] is handed to a platform
//! [`DeviceKeystore`] for at-rest protection under a device-bound key. The
//! keystore is a seam: host applications inject the platform implementation
//! (Android Keystore, iOS Keychain), while [`SoftwareKeystore`] provides a
//! pure-software stand-in for tests and for platforms without hardware
//! backing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::access_log::{AccessLog, AccessLogEntry, ItemType, LogOperation};
use crate::backup::{self, BackupSnapshot};
use crate::crypto::{self, EncryptedRecord, IV_SIZE};
use crate::error::{Operation, StorageError, StorageResult};

use super::{audited, memory::ephemeral_passphrase, SecureStorage};

const KEY_PREFIX: &str = "key:";
const CREDENTIAL_PREFIX: &str = "cred:";

/// Failures surfaced by a device keystore.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// The keystore is missing, locked, or otherwise unreachable.
    #[error("keystore unavailable: {0}")]
    Unavailable(String),

    /// The platform refused the operation (user denial, policy).
    #[error("keystore access denied: {0}")]
    AccessDenied(String),

    /// A sealed blob failed to authenticate on unseal.
    #[error("sealed data failed to authenticate")]
    SealBroken,
}

/// Platform seam for device-bound blob storage.
///
/// Implementations seal values under a key that never leaves the device and
/// persist them by alias. Methods are synchronous: platform keystore APIs
/// are blocking calls and the per-blob payloads are small.
pub trait DeviceKeystore: Send + Sync {
    /// Seals and persists `value` under `alias`, replacing any prior value.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform rejects the write.
    fn put(&self, alias: &str, value: &[u8]) -> Result<(), KeystoreError>;

    /// Unseals and returns the value stored under `alias`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform rejects the read or the sealed
    /// blob fails to authenticate.
    fn get(&self, alias: &str) -> Result<Option<Vec<u8>>, KeystoreError>;

    /// Removes `alias`. Removing an absent alias is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform rejects the removal.
    fn remove(&self, alias: &str) -> Result<(), KeystoreError>;

    /// Returns every alias currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform rejects the enumeration.
    fn aliases(&self) -> Result<Vec<String>, KeystoreError>;
}

/// Software [`DeviceKeystore`] sealing blobs with an in-process AES-256-GCM
/// key.
///
/// The sealing key is generated at construction and never exported, which
/// mimics a hardware keystore's key-bound-to-device property within a single
/// process lifetime.
pub struct SoftwareKeystore {
    cipher: Aes256Gcm,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl SoftwareKeystore {
    #[must_use]
    pub fn new() -> Self {
        let key = crypto::generate_encryption_key();
        Self {
            cipher: Aes256Gcm::new_from_slice(&key).expect("key length is always 32"),
            blobs: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for SoftwareKeystore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceKeystore for SoftwareKeystore {
    fn put(&self, alias: &str, value: &[u8]) -> Result<(), KeystoreError> {
        let mut nonce = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut nonce);
        // Alias rides along as associated data so a blob cannot be replayed
        // under a different alias.
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: value,
                    aad: alias.as_bytes(),
                },
            )
            .map_err(|_| KeystoreError::Unavailable("seal failed".to_string()))?;

        let mut blob = Vec::with_capacity(IV_SIZE + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        self.lock().insert(alias.to_string(), blob);
        Ok(())
    }

    fn get(&self, alias: &str) -> Result<Option<Vec<u8>>, KeystoreError> {
        let blob = match self.lock().get(alias) {
            Some(blob) => blob.clone(),
            None => return Ok(None),
        };
        if blob.len() < IV_SIZE {
            return Err(KeystoreError::SealBroken);
        }
        let (nonce, sealed) = blob.split_at(IV_SIZE);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: alias.as_bytes(),
                },
            )
            .map(Some)
            .map_err(|_| KeystoreError::SealBroken)
    }

    fn remove(&self, alias: &str) -> Result<(), KeystoreError> {
        self.lock().remove(alias);
        Ok(())
    }

    fn aliases(&self) -> Result<Vec<String>, KeystoreError> {
        Ok(self.lock().keys().cloned().collect())
    }
}

/// Storage backend layered over a platform [`DeviceKeystore`].
pub struct KeystoreStorage {
    keystore: Arc<dyn DeviceKeystore>,
    // The passphrase doubles as the store-wide guard: item operations take
    // it shared, bulk operations take it exclusive.
    passphrase: RwLock<SecretString>,
    log: AccessLog,
}

impl KeystoreStorage {
    /// Creates a store over `keystore`. Without a passphrase the store runs
    /// under a random ephemeral one, suitable when the keystore itself is
    /// the durable secret.
    #[must_use]
    pub fn new(keystore: Arc<dyn DeviceKeystore>, passphrase: Option<SecretString>) -> Self {
        Self {
            keystore,
            passphrase: RwLock::new(passphrase.unwrap_or_else(ephemeral_passphrase)),
            log: AccessLog::new(),
        }
    }

    fn put_record(&self, op: Operation, alias: &str, record: &EncryptedRecord) -> StorageResult<()> {
        let bytes = serde_json::to_vec(record).map_err(|err| {
            StorageError::platform(op, format!("record serialization failed: {err}"))
        })?;
        self.keystore
            .put(alias, &bytes)
            .map_err(|err| keystore_error(op, err))
    }

    fn get_record(&self, op: Operation, alias: &str) -> StorageResult<Option<EncryptedRecord>> {
        match self.keystore.get(alias).map_err(|err| keystore_error(op, err))? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|err| {
                StorageError::invalid_format(op, format!("stored record is malformed: {err}"))
            }),
            None => Ok(None),
        }
    }

    fn prefixed_aliases(&self, op: Operation, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .keystore
            .aliases()
            .map_err(|err| keystore_error(op, err))?
            .into_iter()
            .filter(|alias| alias.starts_with(prefix))
            .collect())
    }

    /// Loads every record under `prefix`, keyed by bare id.
    fn load_all(
        &self,
        op: Operation,
        prefix: &str,
    ) -> StorageResult<Vec<(String, EncryptedRecord)>> {
        let mut records = Vec::new();
        for alias in self.prefixed_aliases(op, prefix)? {
            if let Some(record) = self.get_record(op, &alias)? {
                records.push((alias[prefix.len()..].to_string(), record));
            }
        }
        Ok(records)
    }

    async fn store(&self, prefix: &str, id: &str, plaintext: &[u8]) -> StorageResult<()> {
        let passphrase = self.passphrase.read().await;
        let record = crypto::encrypt(plaintext, passphrase.expose_secret())
            .map_err(|err| StorageError::from_crypto(Operation::Write, err))?;
        self.put_record(Operation::Write, &format!("{prefix}{id}"), &record)
    }

    async fn retrieve(&self, prefix: &str, id: &str) -> StorageResult<Option<Vec<u8>>> {
        let passphrase = self.passphrase.read().await;
        self.get_record(Operation::Read, &format!("{prefix}{id}"))?
            .map(|record| {
                crypto::decrypt(&record, passphrase.expose_secret())
                    .map_err(|err| StorageError::from_crypto(Operation::Read, err))
            })
            .transpose()
    }

    fn remove_all(&self, op: Operation) -> StorageResult<()> {
        for prefix in [KEY_PREFIX, CREDENTIAL_PREFIX] {
            for alias in self.prefixed_aliases(op, prefix)? {
                self.keystore
                    .remove(&alias)
                    .map_err(|err| keystore_error(op, err))?;
            }
        }
        Ok(())
    }

    /// Loads every record under both prefixes, keyed by full alias.
    fn load_all_aliased(&self, op: Operation) -> StorageResult<Vec<(String, EncryptedRecord)>> {
        let mut records = Vec::new();
        for prefix in [KEY_PREFIX, CREDENTIAL_PREFIX] {
            for (id, record) in self.load_all(op, prefix)? {
                records.push((format!("{prefix}{id}"), record));
            }
        }
        Ok(records)
    }

    /// Replaces the entire sealed record set with `replacement`.
    ///
    /// The keystore has no transactions, so a midway `put` failure is
    /// compensated by writing `previous` back before the error is returned;
    /// readers never observe a mixed record set unless the keystore also
    /// rejects the compensating writes.
    fn replace_all(
        &self,
        op: Operation,
        replacement: &[(String, EncryptedRecord)],
        previous: &[(String, EncryptedRecord)],
    ) -> StorageResult<()> {
        let result = self.remove_all(op).and_then(|()| {
            for (alias, record) in replacement {
                self.put_record(op, alias, record)?;
            }
            Ok(())
        });
        if result.is_err() {
            let _ = self.remove_all(op);
            for (alias, record) in previous {
                let _ = self.put_record(op, alias, record);
            }
        }
        result
    }
}

fn keystore_error(op: Operation, err: KeystoreError) -> StorageError {
    match err {
        KeystoreError::AccessDenied(context) => StorageError::permission(op, context),
        other => StorageError::platform(op, other.to_string()),
    }
}

#[async_trait]
impl SecureStorage for KeystoreStorage {
    async fn store_key(&self, key_id: &str, material: &[u8]) -> StorageResult<()> {
        let result = self.store(KEY_PREFIX, key_id, material).await;
        audited(&self.log, LogOperation::Store, ItemType::Key, key_id, result)
    }

    async fn retrieve_key(&self, key_id: &str) -> StorageResult<Option<Vec<u8>>> {
        let result = self.retrieve(KEY_PREFIX, key_id).await;
        audited(&self.log, LogOperation::Retrieve, ItemType::Key, key_id, result)
    }

    async fn delete_key(&self, key_id: &str) -> StorageResult<()> {
        let _guard = self.passphrase.read().await;
        let result = self
            .keystore
            .remove(&format!("{KEY_PREFIX}{key_id}"))
            .map_err(|err| keystore_error(Operation::Delete, err));
        audited(&self.log, LogOperation::Delete, ItemType::Key, key_id, result)
    }

    async fn list_keys(&self) -> StorageResult<Vec<String>> {
        let _guard = self.passphrase.read().await;
        let result = self.prefixed_aliases(Operation::List, KEY_PREFIX).map(|aliases| {
            aliases
                .into_iter()
                .map(|alias| alias[KEY_PREFIX.len()..].to_string())
                .collect()
        });
        audited(&self.log, LogOperation::List, ItemType::Key, "*", result)
    }

    async fn store_credential(
        &self,
        credential_id: &str,
        credential: &serde_json::Value,
    ) -> StorageResult<()> {
        let result = match serde_json::to_vec(credential) {
            Ok(bytes) => self.store(CREDENTIAL_PREFIX, credential_id, &bytes).await,
            Err(err) => Err(StorageError::invalid_format(
                Operation::Write,
                format!("credential serialization failed: {err}"),
            )),
        };
        audited(
            &self.log,
            LogOperation::Store,
            ItemType::Credential,
            credential_id,
            result,
        )
    }

    async fn retrieve_credential(
        &self,
        credential_id: &str,
    ) -> StorageResult<Option<serde_json::Value>> {
        let result = match self.retrieve(CREDENTIAL_PREFIX, credential_id).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).map(Some).map_err(|err| {
                StorageError::invalid_format(
                    Operation::Read,
                    format!("credential deserialization failed: {err}"),
                )
            }),
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        };
        audited(
            &self.log,
            LogOperation::Retrieve,
            ItemType::Credential,
            credential_id,
            result,
        )
    }

    async fn delete_credential(&self, credential_id: &str) -> StorageResult<()> {
        let _guard = self.passphrase.read().await;
        let result = self
            .keystore
            .remove(&format!("{CREDENTIAL_PREFIX}{credential_id}"))
            .map_err(|err| keystore_error(Operation::Delete, err));
        audited(
            &self.log,
            LogOperation::Delete,
            ItemType::Credential,
            credential_id,
            result,
        )
    }

    async fn list_credentials(&self) -> StorageResult<Vec<serde_json::Value>> {
        let result = async {
            let passphrase = self.passphrase.read().await;
            let mut credentials = Vec::new();
            for (_, record) in self.load_all(Operation::List, CREDENTIAL_PREFIX)? {
                let bytes = crypto::decrypt(&record, passphrase.expose_secret())
                    .map_err(|err| StorageError::from_crypto(Operation::List, err))?;
                credentials.push(serde_json::from_slice(&bytes).map_err(|err| {
                    StorageError::invalid_format(
                        Operation::List,
                        format!("credential deserialization failed: {err}"),
                    )
                })?);
            }
            Ok(credentials)
        }
        .await;
        audited(&self.log, LogOperation::List, ItemType::Credential, "*", result)
    }

    async fn export_backup(&self, passphrase: &SecretString) -> StorageResult<String> {
        let current = self.passphrase.write().await;
        let result = (|| {
            let mut keys = Vec::new();
            for (id, record) in self.load_all(Operation::Backup, KEY_PREFIX)? {
                let material = crypto::decrypt(&record, current.expose_secret())
                    .map_err(|err| StorageError::from_crypto(Operation::Backup, err))?;
                keys.push((id, material));
            }
            let mut credentials = Vec::new();
            for (id, record) in self.load_all(Operation::Backup, CREDENTIAL_PREFIX)? {
                let bytes = crypto::decrypt(&record, current.expose_secret())
                    .map_err(|err| StorageError::from_crypto(Operation::Backup, err))?;
                let credential = serde_json::from_slice(&bytes).map_err(|err| {
                    StorageError::backup(format!("credential deserialization failed: {err}"))
                })?;
                credentials.push((id, credential));
            }
            backup::seal(&BackupSnapshot::new(keys, credentials), passphrase.expose_secret())
        })();
        audited(&self.log, LogOperation::Backup, ItemType::Backup, "*", result)
    }

    async fn import_backup(&self, data: &str, passphrase: &SecretString) -> StorageResult<()> {
        let current = self.passphrase.write().await;
        let result = (|| {
            let snapshot = backup::open(data, passphrase.expose_secret())?;

            // Encrypt the full replacement set before destroying anything.
            let mut staged = Vec::new();
            for entry in &snapshot.keys {
                let record = crypto::encrypt(&entry.material, current.expose_secret())
                    .map_err(|err| StorageError::from_crypto(Operation::Restore, err))?;
                staged.push((format!("{KEY_PREFIX}{}", entry.key_id), record));
            }
            for entry in &snapshot.credentials {
                let bytes = serde_json::to_vec(&entry.credential).map_err(|err| {
                    StorageError::restore(format!("credential serialization failed: {err}"))
                })?;
                let record = crypto::encrypt(&bytes, current.expose_secret())
                    .map_err(|err| StorageError::from_crypto(Operation::Restore, err))?;
                staged.push((format!("{CREDENTIAL_PREFIX}{}", entry.credential_id), record));
            }

            let previous = self.load_all_aliased(Operation::Restore)?;
            self.replace_all(Operation::Restore, &staged, &previous)
        })();
        audited(&self.log, LogOperation::Restore, ItemType::Backup, "*", result)
    }

    async fn rotate_encryption_key(
        &self,
        old_passphrase: &SecretString,
        new_passphrase: &SecretString,
    ) -> StorageResult<()> {
        let mut current = self.passphrase.write().await;
        let result = (|| {
            let records = self.load_all_aliased(Operation::Rotate)?;

            let rotated = crypto::reencrypt_records(
                &records,
                old_passphrase.expose_secret(),
                new_passphrase.expose_secret(),
            )
            .map_err(|err| StorageError::from_crypto(Operation::Rotate, err))?;

            self.replace_all(Operation::Rotate, &rotated, &records)?;
            *current = new_passphrase.clone();
            Ok(())
        })();
        audited(&self.log, LogOperation::Rotate, ItemType::Backup, "*", result)
    }

    fn get_access_log(&self) -> Vec<AccessLogEntry> {
        self.log.snapshot()
    }

    async fn clear(&self) -> StorageResult<()> {
        let _guard = self.passphrase.write().await;
        let result = self.remove_all(Operation::Clear);
        audited(&self.log, LogOperation::Clear, ItemType::Backup, "*", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn passphrase(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    fn storage() -> KeystoreStorage {
        KeystoreStorage::new(Arc::new(SoftwareKeystore::new()), None)
    }

    /// Keystore whose n-th `put` fails once; later writes succeed again,
    /// the way a transiently unavailable platform keystore behaves.
    struct FailingPutKeystore {
        inner: SoftwareKeystore,
        fail_on: usize,
        puts: AtomicUsize,
    }

    impl FailingPutKeystore {
        fn new(fail_on: usize) -> Self {
            Self {
                inner: SoftwareKeystore::new(),
                fail_on,
                puts: AtomicUsize::new(0),
            }
        }
    }

    impl DeviceKeystore for FailingPutKeystore {
        fn put(&self, alias: &str, value: &[u8]) -> Result<(), KeystoreError> {
            let count = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
            if count == self.fail_on {
                return Err(KeystoreError::Unavailable("keystore is busy".to_string()));
            }
            self.inner.put(alias, value)
        }

        fn get(&self, alias: &str) -> Result<Option<Vec<u8>>, KeystoreError> {
            self.inner.get(alias)
        }

        fn remove(&self, alias: &str) -> Result<(), KeystoreError> {
            self.inner.remove(alias)
        }

        fn aliases(&self) -> Result<Vec<String>, KeystoreError> {
            self.inner.aliases()
        }
    }

    #[test]
    fn test_software_keystore_seals_per_alias() {
        let keystore = SoftwareKeystore::new();
        keystore.put("a", b"secret").unwrap();
        assert_eq!(keystore.get("a").unwrap(), Some(b"secret".to_vec()));
        assert_eq!(keystore.get("b").unwrap(), None);

        // A blob moved to a different alias must not unseal.
        let blob = keystore.lock().get("a").cloned().unwrap();
        keystore.lock().insert("b".to_string(), blob);
        assert!(matches!(keystore.get("b"), Err(KeystoreError::SealBroken)));
    }

    #[tokio::test]
    async fn test_key_round_trip() {
        let store = storage();
        store.store_key("k1", &[7, 8, 9]).await.unwrap();
        assert_eq!(store.retrieve_key("k1").await.unwrap(), Some(vec![7, 8, 9]));
        assert_eq!(store.list_keys().await.unwrap(), vec!["k1".to_string()]);

        store.delete_key("k1").await.unwrap();
        assert_eq!(store.retrieve_key("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_and_credentials_do_not_collide() {
        let store = storage();
        store.store_key("same-id", b"material").await.unwrap();
        store
            .store_credential("same-id", &json!({"id": "same-id"}))
            .await
            .unwrap();

        assert_eq!(store.list_keys().await.unwrap().len(), 1);
        assert_eq!(store.list_credentials().await.unwrap().len(), 1);

        store.delete_key("same-id").await.unwrap();
        assert_eq!(
            store.retrieve_credential("same-id").await.unwrap(),
            Some(json!({"id": "same-id"}))
        );
    }

    #[tokio::test]
    async fn test_backup_restores_into_other_keystore() {
        let store = storage();
        store.store_key("k1", b"material").await.unwrap();
        store.store_credential("c1", &json!({"id": "c1"})).await.unwrap();
        let envelope = store.export_backup(&passphrase("Backup!Pass1")).await.unwrap();

        let other = storage();
        other
            .import_backup(&envelope, &passphrase("Backup!Pass1"))
            .await
            .unwrap();
        assert_eq!(other.retrieve_key("k1").await.unwrap(), Some(b"material".to_vec()));
    }

    #[tokio::test]
    async fn test_backup_with_wrong_passphrase_fails_closed() {
        let store = storage();
        store.store_key("k1", b"material").await.unwrap();
        let envelope = store.export_backup(&passphrase("Backup!Pass1")).await.unwrap();

        let other = storage();
        let err = other
            .import_backup(&envelope, &passphrase("Wrong!Pass99"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::DecryptionFailed {
                op: Operation::Restore
            }
        ));
        assert!(other.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rotation_round_trip() {
        let store = KeystoreStorage::new(
            Arc::new(SoftwareKeystore::new()),
            Some(passphrase("old!Pass1")),
        );
        store.store_key("k1", &[1, 2, 3]).await.unwrap();

        store
            .rotate_encryption_key(&passphrase("old!Pass1"), &passphrase("new!Pass2"))
            .await
            .unwrap();
        assert_eq!(store.retrieve_key("k1").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_rotation_put_failure_restores_previous_records() {
        // Puts 1-2 store the keys, put 3 writes the first rotated record,
        // put 4 fails midway through the apply phase.
        let store = KeystoreStorage::new(
            Arc::new(FailingPutKeystore::new(4)),
            Some(passphrase("old!Pass1")),
        );
        store.store_key("a", &[1]).await.unwrap();
        store.store_key("b", &[2]).await.unwrap();

        let err = store
            .rotate_encryption_key(&passphrase("old!Pass1"), &passphrase("new!Pass2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PlatformError { .. }));

        // Every record still decrypts under the old passphrase; no mixed
        // old/new state is visible.
        assert_eq!(store.retrieve_key("a").await.unwrap(), Some(vec![1]));
        assert_eq!(store.retrieve_key("b").await.unwrap(), Some(vec![2]));

        // The keystore recovered, so a retried rotation goes through.
        store
            .rotate_encryption_key(&passphrase("old!Pass1"), &passphrase("new!Pass2"))
            .await
            .unwrap();
        assert_eq!(store.retrieve_key("a").await.unwrap(), Some(vec![1]));
    }

    #[tokio::test]
    async fn test_import_put_failure_restores_previous_records() {
        let source = storage();
        source.store_key("k1", b"one").await.unwrap();
        source.store_key("k2", b"two").await.unwrap();
        let envelope = source.export_backup(&passphrase("Backup!Pass1")).await.unwrap();

        // Put 1 stores the pre-existing key, put 2 writes the first staged
        // record, put 3 fails midway through the replacement.
        let target = KeystoreStorage::new(Arc::new(FailingPutKeystore::new(3)), None);
        target.store_key("existing", b"kept").await.unwrap();

        let err = target
            .import_backup(&envelope, &passphrase("Backup!Pass1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PlatformError { .. }));

        assert_eq!(target.list_keys().await.unwrap(), vec!["existing".to_string()]);
        assert_eq!(
            target.retrieve_key("existing").await.unwrap(),
            Some(b"kept".to_vec())
        );
    }

    #[tokio::test]
    async fn test_clear_wipes_everything() {
        let store = storage();
        store.store_key("k1", b"x").await.unwrap();
        store.store_credential("c1", &json!({})).await.unwrap();
        store.clear().await.unwrap();
        assert!(store.list_keys().await.unwrap().is_empty());
        assert!(store.list_credentials().await.unwrap().is_empty());
    }
}
