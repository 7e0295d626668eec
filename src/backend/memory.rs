//! In-memory storage backend.
//!
//! Records live on the process heap and vanish with the instance. Without a
//! caller-supplied passphrase the backend runs under a random ephemeral one,
//! which matches the medium: nothing stored here can outlive the process
//! anyway.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::RwLock;

use crate::access_log::{AccessLog, AccessLogEntry, ItemType, LogOperation};
use crate::backup::{self, BackupSnapshot};
use crate::crypto::{self, EncryptedRecord};
use crate::error::{Operation, StorageError, StorageResult};

use super::{audited, SecureStorage};

struct MemoryInner {
    passphrase: SecretString,
    keys: HashMap<String, EncryptedRecord>,
    credentials: HashMap<String, EncryptedRecord>,
}

impl MemoryInner {
    fn entry_count(&self) -> usize {
        self.keys.len() + self.credentials.len()
    }
}

/// Heap-backed storage, optionally capacity-limited.
pub struct MemoryStorage {
    inner: RwLock<MemoryInner>,
    log: AccessLog,
    max_entries: Option<usize>,
}

impl MemoryStorage {
    /// Creates a store encrypted under a random ephemeral passphrase.
    #[must_use]
    pub fn new() -> Self {
        Self::with_passphrase(ephemeral_passphrase())
    }

    /// Creates a store encrypted under the given passphrase.
    #[must_use]
    pub fn with_passphrase(passphrase: SecretString) -> Self {
        Self {
            inner: RwLock::new(MemoryInner {
                passphrase,
                keys: HashMap::new(),
                credentials: HashMap::new(),
            }),
            log: AccessLog::new(),
            max_entries: None,
        }
    }

    /// Caps the total number of stored keys plus credentials.
    ///
    /// Exceeding the cap fails new stores with
    /// [`StorageError::StorageFull`]; overwrites of existing ids still
    /// succeed.
    #[must_use]
    pub const fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    fn check_capacity(&self, inner: &MemoryInner, item_id: &str, occupied: bool) -> StorageResult<()> {
        match self.max_entries {
            Some(max) if !occupied && inner.entry_count() >= max => Err(
                StorageError::storage_full(
                    Operation::Write,
                    format!("memory store is at its {max}-entry capacity (rejecting {item_id:?})"),
                ),
            ),
            _ => Ok(()),
        }
    }

    async fn store(&self, item_type: ItemType, id: &str, plaintext: &[u8]) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let map = match item_type {
            ItemType::Key => &inner.keys,
            _ => &inner.credentials,
        };
        self.check_capacity(&inner, id, map.contains_key(id))?;

        let record = crypto::encrypt(plaintext, inner.passphrase.expose_secret())
            .map_err(|err| StorageError::from_crypto(Operation::Write, err))?;
        let map = match item_type {
            ItemType::Key => &mut inner.keys,
            _ => &mut inner.credentials,
        };
        map.insert(id.to_string(), record);
        Ok(())
    }

    async fn retrieve(&self, item_type: ItemType, id: &str) -> StorageResult<Option<Vec<u8>>> {
        let inner = self.inner.read().await;
        let map = match item_type {
            ItemType::Key => &inner.keys,
            _ => &inner.credentials,
        };
        map.get(id)
            .map(|record| {
                crypto::decrypt(record, inner.passphrase.expose_secret())
                    .map_err(|err| StorageError::from_crypto(Operation::Read, err))
            })
            .transpose()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Hex rendering of 32 random bytes; never logged or exposed.
pub(crate) fn ephemeral_passphrase() -> SecretString {
    SecretString::from(hex::encode(crypto::generate_encryption_key()))
}

#[async_trait]
impl SecureStorage for MemoryStorage {
    async fn store_key(&self, key_id: &str, material: &[u8]) -> StorageResult<()> {
        let result = self.store(ItemType::Key, key_id, material).await;
        audited(&self.log, LogOperation::Store, ItemType::Key, key_id, result)
    }

    async fn retrieve_key(&self, key_id: &str) -> StorageResult<Option<Vec<u8>>> {
        let result = self.retrieve(ItemType::Key, key_id).await;
        audited(&self.log, LogOperation::Retrieve, ItemType::Key, key_id, result)
    }

    async fn delete_key(&self, key_id: &str) -> StorageResult<()> {
        self.inner.write().await.keys.remove(key_id);
        audited(&self.log, LogOperation::Delete, ItemType::Key, key_id, Ok(()))
    }

    async fn list_keys(&self) -> StorageResult<Vec<String>> {
        let keys = self.inner.read().await.keys.keys().cloned().collect();
        audited(&self.log, LogOperation::List, ItemType::Key, "*", Ok(keys))
    }

    async fn store_credential(
        &self,
        credential_id: &str,
        credential: &serde_json::Value,
    ) -> StorageResult<()> {
        let result = match serde_json::to_vec(credential) {
            Ok(bytes) => self.store(ItemType::Credential, credential_id, &bytes).await,
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
        let result = match self.retrieve(ItemType::Credential, credential_id).await {
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
        self.inner.write().await.credentials.remove(credential_id);
        audited(
            &self.log,
            LogOperation::Delete,
            ItemType::Credential,
            credential_id,
            Ok(()),
        )
    }

    async fn list_credentials(&self) -> StorageResult<Vec<serde_json::Value>> {
        let result = async {
            let inner = self.inner.read().await;
            let mut credentials = Vec::with_capacity(inner.credentials.len());
            for record in inner.credentials.values() {
                let bytes = crypto::decrypt(record, inner.passphrase.expose_secret())
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
        // Exclusive guard: no writes may interleave with the snapshot.
        let inner = self.inner.write().await;
        let result = snapshot_inner(&inner)
            .and_then(|snapshot| backup::seal(&snapshot, passphrase.expose_secret()));
        audited(&self.log, LogOperation::Backup, ItemType::Backup, "*", result)
    }

    async fn import_backup(&self, data: &str, passphrase: &SecretString) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let result = backup::open(data, passphrase.expose_secret()).and_then(|snapshot| {
            // Build the replacement maps completely before touching state.
            let mut keys = HashMap::with_capacity(snapshot.keys.len());
            for entry in &snapshot.keys {
                let record = crypto::encrypt(&entry.material, inner.passphrase.expose_secret())
                    .map_err(|err| StorageError::from_crypto(Operation::Restore, err))?;
                keys.insert(entry.key_id.clone(), record);
            }
            let mut credentials = HashMap::with_capacity(snapshot.credentials.len());
            for entry in &snapshot.credentials {
                let bytes = serde_json::to_vec(&entry.credential).map_err(|err| {
                    StorageError::restore(format!("credential serialization failed: {err}"))
                })?;
                let record = crypto::encrypt(&bytes, inner.passphrase.expose_secret())
                    .map_err(|err| StorageError::from_crypto(Operation::Restore, err))?;
                credentials.insert(entry.credential_id.clone(), record);
            }
            inner.keys = keys;
            inner.credentials = credentials;
            Ok(())
        });
        audited(&self.log, LogOperation::Restore, ItemType::Backup, "*", result)
    }

    async fn rotate_encryption_key(
        &self,
        old_passphrase: &SecretString,
        new_passphrase: &SecretString,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let result = (|| {
            let keys: Vec<_> = inner
                .keys
                .iter()
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect();
            let credentials: Vec<_> = inner
                .credentials
                .iter()
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect();

            let rotated_keys = crypto::reencrypt_records(
                &keys,
                old_passphrase.expose_secret(),
                new_passphrase.expose_secret(),
            )
            .map_err(|err| StorageError::from_crypto(Operation::Rotate, err))?;
            let rotated_credentials = crypto::reencrypt_records(
                &credentials,
                old_passphrase.expose_secret(),
                new_passphrase.expose_secret(),
            )
            .map_err(|err| StorageError::from_crypto(Operation::Rotate, err))?;

            inner.keys = rotated_keys.into_iter().collect();
            inner.credentials = rotated_credentials.into_iter().collect();
            inner.passphrase = new_passphrase.clone();
            Ok(())
        })();
        audited(&self.log, LogOperation::Rotate, ItemType::Backup, "*", result)
    }

    fn get_access_log(&self) -> Vec<AccessLogEntry> {
        self.log.snapshot()
    }

    async fn clear(&self) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.keys.clear();
        inner.credentials.clear();
        audited(&self.log, LogOperation::Clear, ItemType::Backup, "*", Ok(()))
    }
}

/// Decrypts the full store contents into a plaintext snapshot.
fn snapshot_inner(inner: &MemoryInner) -> StorageResult<BackupSnapshot> {
    let mut keys = Vec::with_capacity(inner.keys.len());
    for (id, record) in &inner.keys {
        let material = crypto::decrypt(record, inner.passphrase.expose_secret())
            .map_err(|err| StorageError::from_crypto(Operation::Backup, err))?;
        keys.push((id.clone(), material));
    }
    let mut credentials = Vec::with_capacity(inner.credentials.len());
    for (id, record) in &inner.credentials {
        let bytes = crypto::decrypt(record, inner.passphrase.expose_secret())
            .map_err(|err| StorageError::from_crypto(Operation::Backup, err))?;
        let credential = serde_json::from_slice(&bytes).map_err(|err| {
            StorageError::backup(format!("credential deserialization failed: {err}"))
        })?;
        credentials.push((id.clone(), credential));
    }
    Ok(BackupSnapshot::new(keys, credentials))
}
