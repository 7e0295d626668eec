//! Storage backend contract and concrete implementations.
//!
//! Every backend satisfies the same [`SecureStorage`] contract; they differ
//! only in where the [`EncryptedRecord`](crate::crypto::EncryptedRecord)s
//! live and in backend-local failure modes:
//!
//! - [`MemoryStorage`] — process heap, optionally capacity-limited
//! - [`EmbeddedStorage`] — disk-backed embedded database (redb)
//! - [`KeystoreStorage`] — records sealed by a platform [`DeviceKeystore`]
//! - [`SqlStorage`] — external relational database with explicit
//!   connect/disconnect and transactional bulk operations
//!
//! A backend never persists plaintext; decryption failure surfaces as a
//! typed error, never as unauthenticated bytes.

use async_trait::async_trait;
use secrecy::SecretString;

use crate::access_log::{AccessLog, AccessLogEntry, ItemType, LogOperation};
use crate::crypto::KeyFormat;
use crate::error::{Operation, StorageError, StorageResult};

pub mod embedded;
pub mod keystore;
pub mod memory;
pub mod sql;

pub use embedded::EmbeddedStorage;
pub use keystore::{DeviceKeystore, KeystoreStorage, SoftwareKeystore};
pub use memory::MemoryStorage;
pub use sql::SqlStorage;

/// The uniform contract every storage backend implements.
///
/// Per-item operations on distinct identifiers are independent; the bulk
/// operations (`export_backup`, `import_backup`, `rotate_encryption_key`,
/// `clear`) hold an exclusive guard over the entire store for their
/// duration and leave the pre-operation state intact on failure.
#[async_trait]
pub trait SecureStorage: Send + Sync {
    /// Encrypts and persists key material, overwriting any prior record
    /// with the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption or persistence fails.
    async fn store_key(&self, key_id: &str, material: &[u8]) -> StorageResult<()>;

    /// Returns the decrypted key material, or `None` if the id is unknown.
    ///
    /// Never returns partially decrypted or unauthenticated bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or authenticated.
    async fn retrieve_key(&self, key_id: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Deletes a key. Idempotent: deleting an absent id is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium rejects the delete.
    async fn delete_key(&self, key_id: &str) -> StorageResult<()>;

    /// Returns all known key ids. Order is unspecified.
    ///
    /// # Errors
    ///
    /// Returns an error if the enumeration fails.
    async fn list_keys(&self) -> StorageResult<Vec<String>>;

    /// Encrypts and persists a credential document, overwriting any prior
    /// record with the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption or persistence fails.
    async fn store_credential(
        &self,
        credential_id: &str,
        credential: &serde_json::Value,
    ) -> StorageResult<()>;

    /// Returns the decrypted credential, or `None` if the id is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or authenticated.
    async fn retrieve_credential(
        &self,
        credential_id: &str,
    ) -> StorageResult<Option<serde_json::Value>>;

    /// Deletes a credential. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium rejects the delete.
    async fn delete_credential(&self, credential_id: &str) -> StorageResult<()>;

    /// Returns all stored credential documents. Order is unspecified.
    ///
    /// # Errors
    ///
    /// Returns an error if enumeration or decryption fails.
    async fn list_credentials(&self) -> StorageResult<Vec<serde_json::Value>>;

    /// Exports the entire key and credential set as one opaque,
    /// passphrase-protected envelope string.
    ///
    /// # Errors
    ///
    /// Returns an error if any record cannot be decrypted or the envelope
    /// cannot be produced.
    async fn export_backup(&self, passphrase: &SecretString) -> StorageResult<String>;

    /// Decrypts and validates a backup envelope, then atomically replaces
    /// the entire store contents with the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error without modifying the store if the envelope fails
    /// to authenticate or the snapshot is malformed.
    async fn import_backup(&self, data: &str, passphrase: &SecretString) -> StorageResult<()>;

    /// Re-encrypts every stored record under a key derived from
    /// `new_passphrase`. All-or-nothing: a single record that fails to
    /// decrypt under `old_passphrase` aborts the rotation with no record
    /// modified.
    ///
    /// # Errors
    ///
    /// Returns an error if any decryption, re-encryption, or persistence
    /// step fails.
    async fn rotate_encryption_key(
        &self,
        old_passphrase: &SecretString,
        new_passphrase: &SecretString,
    ) -> StorageResult<()>;

    /// Returns the full, read-only audit trail, oldest entry first.
    fn get_access_log(&self) -> Vec<AccessLogEntry>;

    /// Destroys all keys and credentials. The `clear` entry itself is still
    /// appended to the access log.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium rejects the wipe.
    async fn clear(&self) -> StorageResult<()>;

    /// Exports a single key in an external representation.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ItemNotFound`] for an unknown id.
    async fn export_key(&self, key_id: &str, format: KeyFormat) -> StorageResult<String> {
        match self.retrieve_key(key_id).await? {
            Some(material) => Ok(format.encode(&material)),
            None => Err(StorageError::not_found(Operation::Read, key_id)),
        }
    }

    /// Imports a single key from an external representation.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidFormat`] if `key` is not valid in
    /// `format`.
    async fn import_key(&self, key_id: &str, key: &str, format: KeyFormat) -> StorageResult<()> {
        let material = format
            .decode(key)
            .map_err(|err| StorageError::from_crypto(Operation::Write, err))?;
        self.store_key(key_id, &material).await
    }

    /// Exports stored key material as a recovery phrase in an external
    /// representation.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidFormat`] if the stored material is
    /// not a valid UTF-8 phrase, or [`StorageError::ItemNotFound`] for an
    /// unknown id.
    async fn export_recovery_phrase(
        &self,
        key_id: &str,
        format: KeyFormat,
    ) -> StorageResult<String> {
        match self.retrieve_key(key_id).await? {
            Some(material) => {
                if std::str::from_utf8(&material).is_err() {
                    return Err(StorageError::invalid_format(
                        Operation::Read,
                        "stored material is not a UTF-8 recovery phrase",
                    ));
                }
                Ok(format.encode(&material))
            }
            None => Err(StorageError::not_found(Operation::Read, key_id)),
        }
    }

    /// Imports a recovery phrase from an external representation and stores
    /// it as key material.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidFormat`] if `phrase` does not decode
    /// to a UTF-8 phrase in `format`.
    async fn import_recovery_phrase(
        &self,
        key_id: &str,
        phrase: &str,
        format: KeyFormat,
    ) -> StorageResult<()> {
        let material = format
            .decode(phrase)
            .map_err(|err| StorageError::from_crypto(Operation::Write, err))?;
        if std::str::from_utf8(&material).is_err() {
            return Err(StorageError::invalid_format(
                Operation::Write,
                "recovery phrase is not valid UTF-8",
            ));
        }
        self.store_key(key_id, &material).await
    }
}

/// Appends the matching access-log entry for `result` and passes it through.
pub(crate) fn audited<T>(
    log: &AccessLog,
    operation: LogOperation,
    item_type: ItemType,
    item_id: &str,
    result: StorageResult<T>,
) -> StorageResult<T> {
    match &result {
        Ok(_) => log.record_ok(operation, item_type, item_id),
        Err(err) => {
            tracing::warn!(%operation, item_id, error = %err, "storage operation failed");
            log.record_err(operation, item_type, item_id, err);
        }
    }
    result
}
