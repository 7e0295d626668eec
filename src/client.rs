//! Frontend facade over the storage backends.
//!
//! A [`StorageClient`] is opened from a [`StorageBackendConfig`] and hides
//! which backend is doing the work; every method delegates to the selected
//! [`SecureStorage`] implementation.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use crate::access_log::AccessLogEntry;
use crate::backend::{
    DeviceKeystore, EmbeddedStorage, KeystoreStorage, MemoryStorage, SecureStorage,
    SoftwareKeystore, SqlStorage,
};
use crate::crypto::{self, KeyFormat};
use crate::error::{Operation, StorageError, StorageResult};

/// Selects and configures a storage backend.
///
/// Passphrases are held as [`SecretString`] and never appear in the `Debug`
/// rendering.
pub enum StorageBackendConfig {
    /// Ephemeral in-process storage. Without a passphrase a random one is
    /// generated for the lifetime of the instance.
    Memory {
        /// Encryption passphrase, or `None` for a random ephemeral one.
        passphrase: Option<SecretString>,
        /// Optional cap on stored keys plus credentials.
        max_entries: Option<usize>,
    },

    /// In-process storage whose passphrase must satisfy the strength policy
    /// (at least 8 characters with upper case, lower case, a digit, and a
    /// special character).
    Secure {
        /// Encryption passphrase; rejected at open if too weak.
        passphrase: SecretString,
    },

    /// Single-file embedded database, the storage a browser or desktop host
    /// provides.
    Browser {
        /// Database file path.
        path: PathBuf,
        /// Encryption passphrase.
        passphrase: SecretString,
    },

    /// Device keystore storage. Uses a software keystore unless one is
    /// injected via [`StorageClient::open_with_keystore`].
    Native {
        /// Encryption passphrase, or `None` for a random ephemeral one.
        passphrase: Option<SecretString>,
    },

    /// External relational database with an explicit connection lifecycle.
    ExternalDatabase {
        /// Database file path.
        path: PathBuf,
        /// Encryption passphrase.
        passphrase: SecretString,
    },
}

impl fmt::Debug for StorageBackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory { max_entries, .. } => f
                .debug_struct("Memory")
                .field("max_entries", max_entries)
                .finish_non_exhaustive(),
            Self::Secure { .. } => f.debug_struct("Secure").finish_non_exhaustive(),
            Self::Browser { path, .. } => f
                .debug_struct("Browser")
                .field("path", path)
                .finish_non_exhaustive(),
            Self::Native { .. } => f.debug_struct("Native").finish_non_exhaustive(),
            Self::ExternalDatabase { path, .. } => f
                .debug_struct("ExternalDatabase")
                .field("path", path)
                .finish_non_exhaustive(),
        }
    }
}

/// Backend-agnostic handle to secure storage.
pub struct StorageClient {
    backend: Box<dyn SecureStorage>,
}

impl std::fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageClient").finish_non_exhaustive()
    }
}

impl StorageClient {
    /// Opens a client for the configured backend.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidFormat`] if a `Secure` passphrase
    /// fails the strength policy, or a backend error if the store cannot
    /// be opened.
    pub fn open(config: StorageBackendConfig) -> StorageResult<Self> {
        Self::build(config, None)
    }

    /// Opens a client, backing `Native` storage with the given platform
    /// keystore.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Self::open`].
    pub fn open_with_keystore(
        config: StorageBackendConfig,
        keystore: Arc<dyn DeviceKeystore>,
    ) -> StorageResult<Self> {
        Self::build(config, Some(keystore))
    }

    /// Wraps an already-constructed backend.
    #[must_use]
    pub fn from_backend(backend: Box<dyn SecureStorage>) -> Self {
        Self { backend }
    }

    fn build(
        config: StorageBackendConfig,
        keystore: Option<Arc<dyn DeviceKeystore>>,
    ) -> StorageResult<Self> {
        tracing::debug!(config = ?config, "opening storage backend");
        let backend: Box<dyn SecureStorage> = match config {
            StorageBackendConfig::Memory {
                passphrase,
                max_entries,
            } => {
                let mut storage = match passphrase {
                    Some(passphrase) => MemoryStorage::with_passphrase(passphrase),
                    None => MemoryStorage::new(),
                };
                if let Some(max) = max_entries {
                    storage = storage.with_max_entries(max);
                }
                Box::new(storage)
            }
            StorageBackendConfig::Secure { passphrase } => {
                if !crypto::validate_passphrase(passphrase.expose_secret()) {
                    return Err(StorageError::invalid_format(
                        Operation::Write,
                        "passphrase does not meet the strength policy",
                    ));
                }
                Box::new(MemoryStorage::with_passphrase(passphrase))
            }
            StorageBackendConfig::Browser { path, passphrase } => {
                Box::new(EmbeddedStorage::open(path, passphrase)?)
            }
            StorageBackendConfig::Native { passphrase } => {
                let keystore =
                    keystore.unwrap_or_else(|| Arc::new(SoftwareKeystore::new()) as Arc<_>);
                Box::new(KeystoreStorage::new(keystore, passphrase))
            }
            StorageBackendConfig::ExternalDatabase { path, passphrase } => {
                Box::new(SqlStorage::connect(path, passphrase)?)
            }
        };
        Ok(Self { backend })
    }

    /// Encrypts and stores key material under `key_id`.
    ///
    /// # Errors
    ///
    /// Propagates the backend error.
    pub async fn store_key(&self, key_id: &str, material: &[u8]) -> StorageResult<()> {
        self.backend.store_key(key_id, material).await
    }

    /// Returns the decrypted key material, or `None` for an unknown id.
    ///
    /// # Errors
    ///
    /// Propagates the backend error.
    pub async fn retrieve_key(&self, key_id: &str) -> StorageResult<Option<Vec<u8>>> {
        self.backend.retrieve_key(key_id).await
    }

    /// Deletes a key; deleting an absent id succeeds.
    ///
    /// # Errors
    ///
    /// Propagates the backend error.
    pub async fn delete_key(&self, key_id: &str) -> StorageResult<()> {
        self.backend.delete_key(key_id).await
    }

    /// Returns all stored key ids.
    ///
    /// # Errors
    ///
    /// Propagates the backend error.
    pub async fn list_keys(&self) -> StorageResult<Vec<String>> {
        self.backend.list_keys().await
    }

    /// Encrypts and stores a credential document under `credential_id`.
    ///
    /// # Errors
    ///
    /// Propagates the backend error.
    pub async fn store_credential(
        &self,
        credential_id: &str,
        credential: &serde_json::Value,
    ) -> StorageResult<()> {
        self.backend.store_credential(credential_id, credential).await
    }

    /// Returns the decrypted credential, or `None` for an unknown id.
    ///
    /// # Errors
    ///
    /// Propagates the backend error.
    pub async fn retrieve_credential(
        &self,
        credential_id: &str,
    ) -> StorageResult<Option<serde_json::Value>> {
        self.backend.retrieve_credential(credential_id).await
    }

    /// Deletes a credential; deleting an absent id succeeds.
    ///
    /// # Errors
    ///
    /// Propagates the backend error.
    pub async fn delete_credential(&self, credential_id: &str) -> StorageResult<()> {
        self.backend.delete_credential(credential_id).await
    }

    /// Returns all stored credential documents.
    ///
    /// # Errors
    ///
    /// Propagates the backend error.
    pub async fn list_credentials(&self) -> StorageResult<Vec<serde_json::Value>> {
        self.backend.list_credentials().await
    }

    /// Exports all contents as a passphrase-protected envelope.
    ///
    /// # Errors
    ///
    /// Propagates the backend error.
    pub async fn export_backup(&self, passphrase: &SecretString) -> StorageResult<String> {
        self.backend.export_backup(passphrase).await
    }

    /// Replaces all contents with a backup envelope's snapshot.
    ///
    /// # Errors
    ///
    /// Propagates the backend error; the store is unchanged on failure.
    pub async fn import_backup(&self, data: &str, passphrase: &SecretString) -> StorageResult<()> {
        self.backend.import_backup(data, passphrase).await
    }

    /// Re-encrypts every record under a new passphrase, all-or-nothing.
    ///
    /// # Errors
    ///
    /// Propagates the backend error; no record is modified on failure.
    pub async fn rotate_encryption_key(
        &self,
        old_passphrase: &SecretString,
        new_passphrase: &SecretString,
    ) -> StorageResult<()> {
        self.backend
            .rotate_encryption_key(old_passphrase, new_passphrase)
            .await
    }

    /// Returns the audit trail, oldest entry first.
    #[must_use]
    pub fn get_access_log(&self) -> Vec<AccessLogEntry> {
        self.backend.get_access_log()
    }

    /// Destroys all stored keys and credentials.
    ///
    /// # Errors
    ///
    /// Propagates the backend error.
    pub async fn clear(&self) -> StorageResult<()> {
        self.backend.clear().await
    }

    /// Exports a single key in the given external representation.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ItemNotFound`] for an unknown id.
    pub async fn export_key(&self, key_id: &str, format: KeyFormat) -> StorageResult<String> {
        self.backend.export_key(key_id, format).await
    }

    /// Imports a single key from the given external representation.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidFormat`] for undecodable input.
    pub async fn import_key(
        &self,
        key_id: &str,
        key: &str,
        format: KeyFormat,
    ) -> StorageResult<()> {
        self.backend.import_key(key_id, key, format).await
    }

    /// Exports stored key material as a recovery phrase.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidFormat`] if the material is not a
    /// UTF-8 phrase, or [`StorageError::ItemNotFound`] for an unknown id.
    pub async fn export_recovery_phrase(
        &self,
        key_id: &str,
        format: KeyFormat,
    ) -> StorageResult<String> {
        self.backend.export_recovery_phrase(key_id, format).await
    }

    /// Imports a recovery phrase and stores it as key material.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidFormat`] for undecodable or
    /// non-UTF-8 input.
    pub async fn import_recovery_phrase(
        &self,
        key_id: &str,
        phrase: &str,
        format: KeyFormat,
    ) -> StorageResult<()> {
        self.backend
            .import_recovery_phrase(key_id, phrase, format)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passphrase(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[tokio::test]
    async fn test_memory_client_round_trip() {
        let client = StorageClient::open(StorageBackendConfig::Memory {
            passphrase: None,
            max_entries: None,
        })
        .unwrap();
        client.store_key("k1", &[1, 2, 3]).await.unwrap();
        assert_eq!(client.retrieve_key("k1").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_secure_rejects_weak_passphrase() {
        let err = StorageClient::open(StorageBackendConfig::Secure {
            passphrase: passphrase("weak"),
        })
        .unwrap_err();
        assert!(matches!(err, StorageError::InvalidFormat { .. }));

        StorageClient::open(StorageBackendConfig::Secure {
            passphrase: passphrase("Strong!Pass1"),
        })
        .unwrap();
    }

    #[test]
    fn test_debug_redacts_passphrases() {
        let config = StorageBackendConfig::Secure {
            passphrase: passphrase("Strong!Pass1"),
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("Strong!Pass1"));
    }

    #[tokio::test]
    async fn test_export_key_formats() {
        let client = StorageClient::open(StorageBackendConfig::Memory {
            passphrase: None,
            max_entries: None,
        })
        .unwrap();
        client.store_key("k1", &[0xde, 0xad]).await.unwrap();

        assert_eq!(
            client.export_key("k1", KeyFormat::Hex).await.unwrap(),
            "dead"
        );
        let err = client.export_key("absent", KeyFormat::Hex).await.unwrap_err();
        assert!(matches!(err, StorageError::ItemNotFound { .. }));
    }

    #[tokio::test]
    async fn test_recovery_phrase_requires_utf8() {
        let client = StorageClient::open(StorageBackendConfig::Memory {
            passphrase: None,
            max_entries: None,
        })
        .unwrap();

        client
            .import_recovery_phrase("phrase", &hex::encode("abandon ability able"), KeyFormat::Hex)
            .await
            .unwrap();
        assert_eq!(
            client
                .export_recovery_phrase("phrase", KeyFormat::Hex)
                .await
                .unwrap(),
            hex::encode("abandon ability able")
        );

        // Raw bytes that are not UTF-8 are fine as a key but not a phrase.
        client.store_key("binary", &[0xff, 0xfe]).await.unwrap();
        let err = client
            .export_recovery_phrase("binary", KeyFormat::Hex)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidFormat { .. }));
    }
}
