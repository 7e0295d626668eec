//! Embedded database backend.
//!
//! Persists [`EncryptedRecord`]s in a single-file redb database, the storage
//! a browser-embedded or desktop host provides. Bulk operations run inside
//! one write transaction, so a failed restore or rotation rolls back to the
//! previous committed state.
//!
//! redb transactions block on file I/O, so every operation runs on the
//! blocking thread pool. Item operations share a read lock on the store
//! state; bulk operations take it exclusively.

use std::fmt::Display;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use secrecy::{ExposeSecret, SecretString};

use crate::access_log::{AccessLog, AccessLogEntry, ItemType, LogOperation};
use crate::backup::{self, BackupSnapshot};
use crate::crypto::{self, EncryptedRecord};
use crate::error::{Operation, StorageError, StorageResult};

use super::{audited, SecureStorage};

type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

const KEYS: RecordTable = TableDefinition::new("keys");
const CREDENTIALS: RecordTable = TableDefinition::new("credentials");

struct EmbeddedInner {
    db: Database,
    passphrase: SecretString,
}

/// Storage backend over a single-file embedded database.
pub struct EmbeddedStorage {
    inner: Arc<RwLock<EmbeddedInner>>,
    log: AccessLog,
}

impl EmbeddedStorage {
    /// Opens (or creates) the database at `path`.
    ///
    /// Both tables are created up front so later reads never race table
    /// creation.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PlatformError`] if the database cannot be
    /// opened or initialized.
    pub fn open(path: impl AsRef<Path>, passphrase: SecretString) -> StorageResult<Self> {
        let db = Database::create(path).map_err(|err| db_error(Operation::Write, err))?;

        let txn = db
            .begin_write()
            .map_err(|err| db_error(Operation::Write, err))?;
        txn.open_table(KEYS)
            .map_err(|err| db_error(Operation::Write, err))?;
        txn.open_table(CREDENTIALS)
            .map_err(|err| db_error(Operation::Write, err))?;
        txn.commit().map_err(|err| db_error(Operation::Write, err))?;

        Ok(Self {
            inner: Arc::new(RwLock::new(EmbeddedInner { db, passphrase })),
            log: AccessLog::new(),
        })
    }

    /// Runs `f` on the blocking pool with shared access to the store state.
    async fn run_read<T, F>(&self, op: Operation, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&EmbeddedInner) -> StorageResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let inner = inner.read().unwrap_or_else(PoisonError::into_inner);
            f(&inner)
        })
        .await
        .map_err(|err| StorageError::platform(op, format!("blocking task failed: {err}")))?
    }

    /// Runs `f` on the blocking pool with exclusive access to the store state.
    async fn run_write<T, F>(&self, op: Operation, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut EmbeddedInner) -> StorageResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut inner = inner.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut inner)
        })
        .await
        .map_err(|err| StorageError::platform(op, format!("blocking task failed: {err}")))?
    }

    async fn store(&self, table: RecordTable, id: &str, plaintext: &[u8]) -> StorageResult<()> {
        let id = id.to_string();
        let plaintext = plaintext.to_vec();
        self.run_read(Operation::Write, move |inner| {
            let record = crypto::encrypt(&plaintext, inner.passphrase.expose_secret())
                .map_err(|err| StorageError::from_crypto(Operation::Write, err))?;
            let bytes = encode_record(Operation::Write, &record)?;

            let txn = inner
                .db
                .begin_write()
                .map_err(|err| db_error(Operation::Write, err))?;
            {
                let mut handle = txn
                    .open_table(table)
                    .map_err(|err| db_error(Operation::Write, err))?;
                handle
                    .insert(id.as_str(), bytes.as_slice())
                    .map_err(|err| db_error(Operation::Write, err))?;
            }
            txn.commit().map_err(|err| db_error(Operation::Write, err))
        })
        .await
    }

    async fn retrieve(&self, table: RecordTable, id: &str) -> StorageResult<Option<Vec<u8>>> {
        let id = id.to_string();
        self.run_read(Operation::Read, move |inner| {
            let txn = inner
                .db
                .begin_read()
                .map_err(|err| db_error(Operation::Read, err))?;
            let handle = txn
                .open_table(table)
                .map_err(|err| db_error(Operation::Read, err))?;

            let Some(guard) = handle
                .get(id.as_str())
                .map_err(|err| db_error(Operation::Read, err))?
            else {
                return Ok(None);
            };
            let record = decode_record(Operation::Read, guard.value())?;
            crypto::decrypt(&record, inner.passphrase.expose_secret())
                .map(Some)
                .map_err(|err| StorageError::from_crypto(Operation::Read, err))
        })
        .await
    }

    async fn delete(&self, table: RecordTable, id: &str) -> StorageResult<()> {
        let id = id.to_string();
        self.run_read(Operation::Delete, move |inner| {
            let txn = inner
                .db
                .begin_write()
                .map_err(|err| db_error(Operation::Delete, err))?;
            {
                let mut handle = txn
                    .open_table(table)
                    .map_err(|err| db_error(Operation::Delete, err))?;
                handle
                    .remove(id.as_str())
                    .map_err(|err| db_error(Operation::Delete, err))?;
            }
            txn.commit().map_err(|err| db_error(Operation::Delete, err))
        })
        .await
    }
}

fn db_error(op: Operation, err: impl Display) -> StorageError {
    StorageError::platform(op, err.to_string())
}

fn encode_record(op: Operation, record: &EncryptedRecord) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(record)
        .map_err(|err| StorageError::platform(op, format!("record serialization failed: {err}")))
}

fn decode_record(op: Operation, bytes: &[u8]) -> StorageResult<EncryptedRecord> {
    serde_json::from_slice(bytes)
        .map_err(|err| StorageError::invalid_format(op, format!("stored record is malformed: {err}")))
}

/// Reads all `(id, record)` pairs of one table inside `txn`.
fn read_table(
    op: Operation,
    txn: &redb::WriteTransaction,
    table: RecordTable,
) -> StorageResult<Vec<(String, EncryptedRecord)>> {
    let handle = txn.open_table(table).map_err(|err| db_error(op, err))?;
    let mut records = Vec::new();
    for entry in handle.iter().map_err(|err| db_error(op, err))? {
        let (id, value) = entry.map_err(|err| db_error(op, err))?;
        records.push((id.value().to_string(), decode_record(op, value.value())?));
    }
    Ok(records)
}

fn write_table(
    op: Operation,
    txn: &redb::WriteTransaction,
    table: RecordTable,
    records: &[(String, EncryptedRecord)],
) -> StorageResult<()> {
    let mut handle = txn.open_table(table).map_err(|err| db_error(op, err))?;
    for (id, record) in records {
        let bytes = encode_record(op, record)?;
        handle
            .insert(id.as_str(), bytes.as_slice())
            .map_err(|err| db_error(op, err))?;
    }
    Ok(())
}

fn clear_table(
    op: Operation,
    txn: &redb::WriteTransaction,
    table: RecordTable,
) -> StorageResult<()> {
    let mut handle = txn.open_table(table).map_err(|err| db_error(op, err))?;
    handle.retain(|_, _| false).map_err(|err| db_error(op, err))
}

#[async_trait]
impl SecureStorage for EmbeddedStorage {
    async fn store_key(&self, key_id: &str, material: &[u8]) -> StorageResult<()> {
        let result = self.store(KEYS, key_id, material).await;
        audited(&self.log, LogOperation::Store, ItemType::Key, key_id, result)
    }

    async fn retrieve_key(&self, key_id: &str) -> StorageResult<Option<Vec<u8>>> {
        let result = self.retrieve(KEYS, key_id).await;
        audited(&self.log, LogOperation::Retrieve, ItemType::Key, key_id, result)
    }

    async fn delete_key(&self, key_id: &str) -> StorageResult<()> {
        let result = self.delete(KEYS, key_id).await;
        audited(&self.log, LogOperation::Delete, ItemType::Key, key_id, result)
    }

    async fn list_keys(&self) -> StorageResult<Vec<String>> {
        let result = self
            .run_read(Operation::List, |inner| {
                let txn = inner
                    .db
                    .begin_read()
                    .map_err(|err| db_error(Operation::List, err))?;
                let handle = txn
                    .open_table(KEYS)
                    .map_err(|err| db_error(Operation::List, err))?;
                let mut ids = Vec::new();
                for entry in handle.iter().map_err(|err| db_error(Operation::List, err))? {
                    let (id, _) = entry.map_err(|err| db_error(Operation::List, err))?;
                    ids.push(id.value().to_string());
                }
                Ok(ids)
            })
            .await;
        audited(&self.log, LogOperation::List, ItemType::Key, "*", result)
    }

    async fn store_credential(
        &self,
        credential_id: &str,
        credential: &serde_json::Value,
    ) -> StorageResult<()> {
        let result = match serde_json::to_vec(credential) {
            Ok(bytes) => self.store(CREDENTIALS, credential_id, &bytes).await,
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
        let result = match self.retrieve(CREDENTIALS, credential_id).await {
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
        let result = self.delete(CREDENTIALS, credential_id).await;
        audited(
            &self.log,
            LogOperation::Delete,
            ItemType::Credential,
            credential_id,
            result,
        )
    }

    async fn list_credentials(&self) -> StorageResult<Vec<serde_json::Value>> {
        let result = self
            .run_read(Operation::List, |inner| {
                let txn = inner
                    .db
                    .begin_read()
                    .map_err(|err| db_error(Operation::List, err))?;
                let handle = txn
                    .open_table(CREDENTIALS)
                    .map_err(|err| db_error(Operation::List, err))?;

                let mut credentials = Vec::new();
                for entry in handle.iter().map_err(|err| db_error(Operation::List, err))? {
                    let (_, value) = entry.map_err(|err| db_error(Operation::List, err))?;
                    let record = decode_record(Operation::List, value.value())?;
                    let bytes = crypto::decrypt(&record, inner.passphrase.expose_secret())
                        .map_err(|err| StorageError::from_crypto(Operation::List, err))?;
                    credentials.push(serde_json::from_slice(&bytes).map_err(|err| {
                        StorageError::invalid_format(
                            Operation::List,
                            format!("credential deserialization failed: {err}"),
                        )
                    })?);
                }
                Ok(credentials)
            })
            .await;
        audited(&self.log, LogOperation::List, ItemType::Credential, "*", result)
    }

    async fn export_backup(&self, passphrase: &SecretString) -> StorageResult<String> {
        let passphrase = passphrase.clone();
        let result = self
            .run_write(Operation::Backup, move |inner| {
                let txn = inner
                    .db
                    .begin_write()
                    .map_err(|err| db_error(Operation::Backup, err))?;

                let mut keys = Vec::new();
                for (id, record) in read_table(Operation::Backup, &txn, KEYS)? {
                    let material = crypto::decrypt(&record, inner.passphrase.expose_secret())
                        .map_err(|err| StorageError::from_crypto(Operation::Backup, err))?;
                    keys.push((id, material));
                }
                let mut credentials = Vec::new();
                for (id, record) in read_table(Operation::Backup, &txn, CREDENTIALS)? {
                    let bytes = crypto::decrypt(&record, inner.passphrase.expose_secret())
                        .map_err(|err| StorageError::from_crypto(Operation::Backup, err))?;
                    let credential = serde_json::from_slice(&bytes).map_err(|err| {
                        StorageError::backup(format!("credential deserialization failed: {err}"))
                    })?;
                    credentials.push((id, credential));
                }
                txn.abort().map_err(|err| db_error(Operation::Backup, err))?;

                backup::seal(
                    &BackupSnapshot::new(keys, credentials),
                    passphrase.expose_secret(),
                )
            })
            .await;
        audited(&self.log, LogOperation::Backup, ItemType::Backup, "*", result)
    }

    async fn import_backup(&self, data: &str, passphrase: &SecretString) -> StorageResult<()> {
        let data = data.to_string();
        let passphrase = passphrase.clone();
        let result = self
            .run_write(Operation::Restore, move |inner| {
                let snapshot = backup::open(&data, passphrase.expose_secret())?;

                let mut keys = Vec::with_capacity(snapshot.keys.len());
                for entry in &snapshot.keys {
                    let record = crypto::encrypt(&entry.material, inner.passphrase.expose_secret())
                        .map_err(|err| StorageError::from_crypto(Operation::Restore, err))?;
                    keys.push((entry.key_id.clone(), record));
                }
                let mut credentials = Vec::with_capacity(snapshot.credentials.len());
                for entry in &snapshot.credentials {
                    let bytes = serde_json::to_vec(&entry.credential).map_err(|err| {
                        StorageError::restore(format!("credential serialization failed: {err}"))
                    })?;
                    let record = crypto::encrypt(&bytes, inner.passphrase.expose_secret())
                        .map_err(|err| StorageError::from_crypto(Operation::Restore, err))?;
                    credentials.push((entry.credential_id.clone(), record));
                }

                let txn = inner
                    .db
                    .begin_write()
                    .map_err(|err| db_error(Operation::Restore, err))?;
                clear_table(Operation::Restore, &txn, KEYS)?;
                clear_table(Operation::Restore, &txn, CREDENTIALS)?;
                write_table(Operation::Restore, &txn, KEYS, &keys)?;
                write_table(Operation::Restore, &txn, CREDENTIALS, &credentials)?;
                txn.commit().map_err(|err| db_error(Operation::Restore, err))
            })
            .await;
        audited(&self.log, LogOperation::Restore, ItemType::Backup, "*", result)
    }

    async fn rotate_encryption_key(
        &self,
        old_passphrase: &SecretString,
        new_passphrase: &SecretString,
    ) -> StorageResult<()> {
        let old_passphrase = old_passphrase.clone();
        let new_passphrase = new_passphrase.clone();
        let result = self
            .run_write(Operation::Rotate, move |inner| {
                let txn = inner
                    .db
                    .begin_write()
                    .map_err(|err| db_error(Operation::Rotate, err))?;

                let keys = read_table(Operation::Rotate, &txn, KEYS)?;
                let credentials = read_table(Operation::Rotate, &txn, CREDENTIALS)?;

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

                write_table(Operation::Rotate, &txn, KEYS, &rotated_keys)?;
                write_table(Operation::Rotate, &txn, CREDENTIALS, &rotated_credentials)?;
                txn.commit().map_err(|err| db_error(Operation::Rotate, err))?;

                inner.passphrase = new_passphrase.clone();
                Ok(())
            })
            .await;
        audited(&self.log, LogOperation::Rotate, ItemType::Backup, "*", result)
    }

    fn get_access_log(&self) -> Vec<AccessLogEntry> {
        self.log.snapshot()
    }

    async fn clear(&self) -> StorageResult<()> {
        let result = self
            .run_write(Operation::Clear, |inner| {
                let txn = inner
                    .db
                    .begin_write()
                    .map_err(|err| db_error(Operation::Clear, err))?;
                clear_table(Operation::Clear, &txn, KEYS)?;
                clear_table(Operation::Clear, &txn, CREDENTIALS)?;
                txn.commit().map_err(|err| db_error(Operation::Clear, err))
            })
            .await;
        audited(&self.log, LogOperation::Clear, ItemType::Backup, "*", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn passphrase(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.redb");

        {
            let store = EmbeddedStorage::open(&path, passphrase("disk!Pass1")).unwrap();
            store.store_key("k1", &[4, 5, 6]).await.unwrap();
            store.store_credential("c1", &json!({"id": "c1"})).await.unwrap();
        }

        let store = EmbeddedStorage::open(&path, passphrase("disk!Pass1")).unwrap();
        assert_eq!(store.retrieve_key("k1").await.unwrap(), Some(vec![4, 5, 6]));
        assert_eq!(
            store.retrieve_credential("c1").await.unwrap(),
            Some(json!({"id": "c1"}))
        );
    }

    #[tokio::test]
    async fn test_wrong_passphrase_after_reopen_fails_closed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.redb");

        {
            let store = EmbeddedStorage::open(&path, passphrase("disk!Pass1")).unwrap();
            store.store_key("k1", b"material").await.unwrap();
        }

        let store = EmbeddedStorage::open(&path, passphrase("other!Pass2")).unwrap();
        let err = store.retrieve_key("k1").await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::DecryptionFailed {
                op: Operation::Read
            }
        ));
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let dir = tempdir().unwrap();
        let store =
            EmbeddedStorage::open(dir.path().join("store.redb"), passphrase("disk!Pass1")).unwrap();

        store.store_key("k1", b"a").await.unwrap();
        store.store_key("k2", b"b").await.unwrap();
        store.delete_key("k1").await.unwrap();

        assert_eq!(store.list_keys().await.unwrap(), vec!["k2".to_string()]);
        // Deleting an absent id succeeds.
        store.delete_key("k1").await.unwrap();
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let dir = tempdir().unwrap();
        let source =
            EmbeddedStorage::open(dir.path().join("a.redb"), passphrase("disk!Pass1")).unwrap();
        source.store_key("k1", b"material").await.unwrap();
        let envelope = source.export_backup(&passphrase("Backup!Pass1")).await.unwrap();

        let target =
            EmbeddedStorage::open(dir.path().join("b.redb"), passphrase("other!Pass2")).unwrap();
        target.store_key("stale", b"gone").await.unwrap();
        target
            .import_backup(&envelope, &passphrase("Backup!Pass1"))
            .await
            .unwrap();

        assert_eq!(target.retrieve_key("k1").await.unwrap(), Some(b"material".to_vec()));
        assert_eq!(target.retrieve_key("stale").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rotation_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.redb");

        {
            let store = EmbeddedStorage::open(&path, passphrase("old!Pass1")).unwrap();
            store.store_key("k1", &[1, 2, 3]).await.unwrap();
            store
                .rotate_encryption_key(&passphrase("old!Pass1"), &passphrase("new!Pass2"))
                .await
                .unwrap();
        }

        let store = EmbeddedStorage::open(&path, passphrase("new!Pass2")).unwrap();
        assert_eq!(store.retrieve_key("k1").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_failed_rotation_leaves_old_passphrase_working() {
        let dir = tempdir().unwrap();
        let store =
            EmbeddedStorage::open(dir.path().join("store.redb"), passphrase("old!Pass1")).unwrap();
        store.store_key("k1", &[1, 2, 3]).await.unwrap();

        let err = store
            .rotate_encryption_key(&passphrase("wrong!Pass9"), &passphrase("new!Pass2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DecryptionFailed { .. }));
        assert_eq!(store.retrieve_key("k1").await.unwrap(), Some(vec![1, 2, 3]));
    }
}
