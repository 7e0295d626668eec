//! Append-only audit ledger.
//!
//! Every backend operation appends exactly one entry, success or failure.
//! Entries are never mutated or removed for the lifetime of a backend
//! instance; a fresh instance starts with an empty ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// The operation an access-log entry records.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogOperation {
    /// A key or credential was written.
    Store,
    /// A key or credential was read.
    Retrieve,
    /// A key or credential was deleted.
    Delete,
    /// Keys or credentials were enumerated.
    List,
    /// The whole store was destroyed.
    Clear,
    /// A backup envelope was exported.
    Backup,
    /// A backup envelope was imported.
    Restore,
    /// The encryption passphrase was rotated.
    Rotate,
}

/// The kind of item an access-log entry refers to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ItemType {
    /// Private key material or a recovery phrase.
    Key,
    /// A verifiable-credential document.
    Credential,
    /// A passphrase-protected backup envelope.
    Backup,
}

/// One immutable entry in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEntry {
    /// When the operation completed.
    pub timestamp: DateTime<Utc>,
    /// The operation performed.
    pub operation: LogOperation,
    /// The kind of item operated on.
    pub item_type: ItemType,
    /// The item identifier, or `"*"` for collection-wide operations.
    pub item_id: String,
    /// Whether the operation succeeded.
    pub success: bool,
    /// The error rendering for failed operations. Never contains plaintext
    /// key material or passphrases.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Append-only in-memory ledger shared by a backend's operations.
#[derive(Default)]
pub struct AccessLog {
    entries: Mutex<Vec<AccessLogEntry>>,
}

impl AccessLog {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a successful operation.
    pub fn record_ok(&self, operation: LogOperation, item_type: ItemType, item_id: &str) {
        self.push(operation, item_type, item_id, None);
    }

    /// Appends a failed operation with its error rendering.
    pub fn record_err(
        &self,
        operation: LogOperation,
        item_type: ItemType,
        item_id: &str,
        error: &crate::error::StorageError,
    ) {
        self.push(operation, item_type, item_id, Some(error.to_string()));
    }

    fn push(
        &self,
        operation: LogOperation,
        item_type: ItemType,
        item_id: &str,
        error: Option<String>,
    ) {
        let entry = AccessLogEntry {
            timestamp: Utc::now(),
            operation,
            item_type,
            item_id: item_id.to_string(),
            success: error.is_none(),
            error,
        };
        // A poisoned ledger mutex must not take storage operations down with
        // it; recover the inner state and keep appending.
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.push(entry);
    }

    /// Returns a copy of the full trail, oldest entry first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AccessLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Returns the number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
