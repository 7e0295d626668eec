//! External relational database backend.
//!
//! Persists [`EncryptedRecord`]s as JSON rows in a SQLite database with an
//! explicit connection lifecycle: the backend can be disconnected and
//! reconnected, and every operation on a disconnected store fails with a
//! platform error instead of touching disk. Bulk operations run inside a
//! SQL transaction, so a failed restore or rotation rolls back cleanly.
//!
//! SQLite calls are blocking, so each operation runs on the blocking
//! thread pool and takes the connection mutex there; a long transaction
//! never stalls an executor worker. The mutex also serializes every
//! operation, which gives bulk operations their exclusivity for free.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use secrecy::{ExposeSecret, SecretString};

use crate::access_log::{AccessLog, AccessLogEntry, ItemType, LogOperation};
use crate::backup::{self, BackupSnapshot};
use crate::crypto::{self, EncryptedRecord};
use crate::error::{Operation, StorageError, StorageResult};

use super::{audited, SecureStorage};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS keys (
    id     TEXT PRIMARY KEY,
    record TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS credentials (
    id     TEXT PRIMARY KEY,
    record TEXT NOT NULL
);
";

struct SqlInner {
    conn: Option<Connection>,
    passphrase: SecretString,
}

impl SqlInner {
    fn conn(&mut self, op: Operation) -> StorageResult<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| StorageError::platform(op, "database is not connected"))
    }
}

/// Storage backend over an external SQLite database.
pub struct SqlStorage {
    inner: Arc<Mutex<SqlInner>>,
    path: PathBuf,
    log: AccessLog,
}

impl SqlStorage {
    /// Opens the database at `path` and creates the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PlatformError`] if the database cannot be
    /// opened or the schema cannot be created.
    pub fn connect(path: impl AsRef<Path>, passphrase: SecretString) -> StorageResult<Self> {
        let conn = open_connection(path.as_ref())?;
        Ok(Self {
            inner: Arc::new(Mutex::new(SqlInner {
                conn: Some(conn),
                passphrase,
            })),
            path: path.as_ref().to_path_buf(),
            log: AccessLog::new(),
        })
    }

    /// Closes the connection. Subsequent operations fail with
    /// [`StorageError::PlatformError`] until [`Self::reconnect`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PlatformError`] if the blocking task fails.
    pub async fn disconnect(&self) -> StorageResult<()> {
        self.run_blocking(Operation::Write, |inner| {
            inner.conn = None;
            Ok(())
        })
        .await
    }

    /// Re-opens the connection to the original path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PlatformError`] if the database cannot be
    /// opened.
    pub async fn reconnect(&self) -> StorageResult<()> {
        let path = self.path.clone();
        self.run_blocking(Operation::Write, move |inner| {
            inner.conn = Some(open_connection(&path)?);
            Ok(())
        })
        .await
    }

    /// Checks that the connection is open and the database answers queries.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PlatformError`] if the store is disconnected
    /// or the check query fails.
    pub async fn health_check(&self) -> StorageResult<()> {
        self.run_blocking(Operation::Read, |inner| {
            let conn = inner.conn(Operation::Read)?;
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|err| sql_error(Operation::Read, &err))
        })
        .await
    }

    /// Runs `f` with the locked connection state on the blocking pool.
    async fn run_blocking<T, F>(&self, op: Operation, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqlInner) -> StorageResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut inner)
        })
        .await
        .map_err(|err| StorageError::platform(op, format!("blocking task failed: {err}")))?
    }

    async fn store(&self, table: &'static str, id: &str, plaintext: &[u8]) -> StorageResult<()> {
        let id = id.to_string();
        let plaintext = plaintext.to_vec();
        self.run_blocking(Operation::Write, move |inner| {
            let record = crypto::encrypt(&plaintext, inner.passphrase.expose_secret())
                .map_err(|err| StorageError::from_crypto(Operation::Write, err))?;
            let json = encode_record(Operation::Write, &record)?;

            let conn = inner.conn(Operation::Write)?;
            conn.execute(
                &format!("INSERT OR REPLACE INTO {table} (id, record) VALUES (?1, ?2)"),
                params![id, json],
            )
            .map_err(|err| sql_error(Operation::Write, &err))?;
            Ok(())
        })
        .await
    }

    async fn retrieve(&self, table: &'static str, id: &str) -> StorageResult<Option<Vec<u8>>> {
        let id = id.to_string();
        self.run_blocking(Operation::Read, move |inner| {
            let passphrase = inner.passphrase.clone();
            let conn = inner.conn(Operation::Read)?;
            let json: Option<String> = conn
                .query_row(
                    &format!("SELECT record FROM {table} WHERE id = ?1"),
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| sql_error(Operation::Read, &err))?;

            let Some(json) = json else {
                return Ok(None);
            };
            let record = decode_record(Operation::Read, &json)?;
            crypto::decrypt(&record, passphrase.expose_secret())
                .map(Some)
                .map_err(|err| StorageError::from_crypto(Operation::Read, err))
        })
        .await
    }

    async fn delete(&self, table: &'static str, id: &str) -> StorageResult<()> {
        let id = id.to_string();
        self.run_blocking(Operation::Delete, move |inner| {
            let conn = inner.conn(Operation::Delete)?;
            conn.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])
                .map_err(|err| sql_error(Operation::Delete, &err))?;
            Ok(())
        })
        .await
    }
}

fn open_connection(path: &Path) -> StorageResult<Connection> {
    let conn = Connection::open(path)
        .map_err(|err| StorageError::platform(Operation::Write, err.to_string()))?;
    conn.execute_batch(SCHEMA)
        .map_err(|err| StorageError::platform(Operation::Write, err.to_string()))?;
    Ok(conn)
}

fn sql_error(op: Operation, err: &rusqlite::Error) -> StorageError {
    match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DiskFull) => StorageError::storage_full(op, err.to_string()),
        Some(rusqlite::ErrorCode::PermissionDenied | rusqlite::ErrorCode::ReadOnly) => {
            StorageError::permission(op, err.to_string())
        }
        _ => StorageError::platform(op, err.to_string()),
    }
}

fn encode_record(op: Operation, record: &EncryptedRecord) -> StorageResult<String> {
    serde_json::to_string(record)
        .map_err(|err| StorageError::platform(op, format!("record serialization failed: {err}")))
}

fn decode_record(op: Operation, json: &str) -> StorageResult<EncryptedRecord> {
    serde_json::from_str(json)
        .map_err(|err| StorageError::invalid_format(op, format!("stored record is malformed: {err}")))
}

fn read_table(
    op: Operation,
    conn: &Connection,
    table: &str,
) -> StorageResult<Vec<(String, EncryptedRecord)>> {
    let mut stmt = conn
        .prepare(&format!("SELECT id, record FROM {table}"))
        .map_err(|err| sql_error(op, &err))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|err| sql_error(op, &err))?;

    let mut records = Vec::new();
    for row in rows {
        let (id, json) = row.map_err(|err| sql_error(op, &err))?;
        records.push((id, decode_record(op, &json)?));
    }
    Ok(records)
}

fn write_records(
    op: Operation,
    txn: &rusqlite::Transaction<'_>,
    table: &str,
    records: &[(String, EncryptedRecord)],
) -> StorageResult<()> {
    for (id, record) in records {
        let json = encode_record(op, record)?;
        txn.execute(
            &format!("INSERT OR REPLACE INTO {table} (id, record) VALUES (?1, ?2)"),
            params![id, json],
        )
        .map_err(|err| sql_error(op, &err))?;
    }
    Ok(())
}

#[async_trait]
impl SecureStorage for SqlStorage {
    async fn store_key(&self, key_id: &str, material: &[u8]) -> StorageResult<()> {
        let result = self.store("keys", key_id, material).await;
        audited(&self.log, LogOperation::Store, ItemType::Key, key_id, result)
    }

    async fn retrieve_key(&self, key_id: &str) -> StorageResult<Option<Vec<u8>>> {
        let result = self.retrieve("keys", key_id).await;
        audited(&self.log, LogOperation::Retrieve, ItemType::Key, key_id, result)
    }

    async fn delete_key(&self, key_id: &str) -> StorageResult<()> {
        let result = self.delete("keys", key_id).await;
        audited(&self.log, LogOperation::Delete, ItemType::Key, key_id, result)
    }

    async fn list_keys(&self) -> StorageResult<Vec<String>> {
        let result = self
            .run_blocking(Operation::List, |inner| {
                let conn = inner.conn(Operation::List)?;
                let mut stmt = conn
                    .prepare("SELECT id FROM keys")
                    .map_err(|err| sql_error(Operation::List, &err))?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(|err| sql_error(Operation::List, &err))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| sql_error(Operation::List, &err))?;
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
            Ok(bytes) => self.store("credentials", credential_id, &bytes).await,
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
        let result = match self.retrieve("credentials", credential_id).await {
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
        let result = self.delete("credentials", credential_id).await;
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
            .run_blocking(Operation::List, |inner| {
                let passphrase = inner.passphrase.clone();
                let conn = inner.conn(Operation::List)?;
                let mut credentials = Vec::new();
                for (_, record) in read_table(Operation::List, conn, "credentials")? {
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
            })
            .await;
        audited(&self.log, LogOperation::List, ItemType::Credential, "*", result)
    }

    async fn export_backup(&self, passphrase: &SecretString) -> StorageResult<String> {
        let passphrase = passphrase.clone();
        let result = self
            .run_blocking(Operation::Backup, move |inner| {
                let store_passphrase = inner.passphrase.clone();
                let conn = inner.conn(Operation::Backup)?;

                let mut keys = Vec::new();
                for (id, record) in read_table(Operation::Backup, conn, "keys")? {
                    let material = crypto::decrypt(&record, store_passphrase.expose_secret())
                        .map_err(|err| StorageError::from_crypto(Operation::Backup, err))?;
                    keys.push((id, material));
                }
                let mut credentials = Vec::new();
                for (id, record) in read_table(Operation::Backup, conn, "credentials")? {
                    let bytes = crypto::decrypt(&record, store_passphrase.expose_secret())
                        .map_err(|err| StorageError::from_crypto(Operation::Backup, err))?;
                    let credential = serde_json::from_slice(&bytes).map_err(|err| {
                        StorageError::backup(format!("credential deserialization failed: {err}"))
                    })?;
                    credentials.push((id, credential));
                }
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
            .run_blocking(Operation::Restore, move |inner| {
                let store_passphrase = inner.passphrase.clone();
                let snapshot = backup::open(&data, passphrase.expose_secret())?;

                let mut keys = Vec::with_capacity(snapshot.keys.len());
                for entry in &snapshot.keys {
                    let record = crypto::encrypt(&entry.material, store_passphrase.expose_secret())
                        .map_err(|err| StorageError::from_crypto(Operation::Restore, err))?;
                    keys.push((entry.key_id.clone(), record));
                }
                let mut credentials = Vec::with_capacity(snapshot.credentials.len());
                for entry in &snapshot.credentials {
                    let bytes = serde_json::to_vec(&entry.credential).map_err(|err| {
                        StorageError::restore(format!("credential serialization failed: {err}"))
                    })?;
                    let record = crypto::encrypt(&bytes, store_passphrase.expose_secret())
                        .map_err(|err| StorageError::from_crypto(Operation::Restore, err))?;
                    credentials.push((entry.credential_id.clone(), record));
                }

                let conn = inner.conn(Operation::Restore)?;
                let txn = conn
                    .transaction()
                    .map_err(|err| sql_error(Operation::Restore, &err))?;
                txn.execute("DELETE FROM keys", [])
                    .map_err(|err| sql_error(Operation::Restore, &err))?;
                txn.execute("DELETE FROM credentials", [])
                    .map_err(|err| sql_error(Operation::Restore, &err))?;
                write_records(Operation::Restore, &txn, "keys", &keys)?;
                write_records(Operation::Restore, &txn, "credentials", &credentials)?;
                txn.commit()
                    .map_err(|err| sql_error(Operation::Restore, &err))
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
            .run_blocking(Operation::Rotate, move |inner| {
                let conn = inner.conn(Operation::Rotate)?;

                let keys = read_table(Operation::Rotate, conn, "keys")?;
                let credentials = read_table(Operation::Rotate, conn, "credentials")?;

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

                let txn = conn
                    .transaction()
                    .map_err(|err| sql_error(Operation::Rotate, &err))?;
                write_records(Operation::Rotate, &txn, "keys", &rotated_keys)?;
                write_records(Operation::Rotate, &txn, "credentials", &rotated_credentials)?;
                txn.commit()
                    .map_err(|err| sql_error(Operation::Rotate, &err))?;

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
            .run_blocking(Operation::Clear, |inner| {
                let conn = inner.conn(Operation::Clear)?;
                let txn = conn
                    .transaction()
                    .map_err(|err| sql_error(Operation::Clear, &err))?;
                txn.execute("DELETE FROM keys", [])
                    .map_err(|err| sql_error(Operation::Clear, &err))?;
                txn.execute("DELETE FROM credentials", [])
                    .map_err(|err| sql_error(Operation::Clear, &err))?;
                txn.commit()
                    .map_err(|err| sql_error(Operation::Clear, &err))
            })
            .await;
        audited(&self.log, LogOperation::Clear, ItemType::Backup, "*", result)
    }
}
