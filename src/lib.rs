//! Backend-agnostic secure storage for identity credentials and key
//! material.
//!
//! Every payload is encrypted before it reaches a backend: AES-256-GCM
//! under a key stretched from the owning passphrase with
//! PBKDF2-HMAC-SHA256. Four backends share one [`SecureStorage`] contract
//! (in-memory, embedded database, device keystore, external SQL database),
//! and a [`StorageClient`] opened from a [`StorageBackendConfig`] hides
//! which one is in use. Each backend keeps an append-only access log and
//! supports passphrase-protected backups and atomic encryption-key
//! rotation.

#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::must_use_candidate)]

pub mod access_log;
pub mod backend;
mod backup;
pub mod client;
pub mod crypto;
pub mod error;

pub use access_log::{AccessLogEntry, ItemType, LogOperation};
pub use backend::{
    DeviceKeystore, EmbeddedStorage, KeystoreStorage, MemoryStorage, SecureStorage,
    SoftwareKeystore, SqlStorage,
};
pub use client::{StorageBackendConfig, StorageClient};
pub use crypto::{EncryptedRecord, KeyFormat};
pub use error::{Operation, StorageError, StorageResult};
