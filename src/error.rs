//! Error taxonomy shared by every storage backend.
//!
//! Backend-native failures (redb, rusqlite, a device keystore refusing an
//! operation) are wrapped into this taxonomy before they cross the subsystem
//! boundary, and every error names the operation that failed so callers can
//! pattern-match instead of parsing messages.

use strum::Display;
use thiserror::Error;

use crate::crypto::CryptoError;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// The storage operation an error occurred in.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    /// Retrieving or exporting an item.
    Read,
    /// Storing or importing an item.
    Write,
    /// Deleting an item.
    Delete,
    /// Enumerating items.
    List,
    /// Destroying the whole store.
    Clear,
    /// Exporting a backup envelope.
    Backup,
    /// Importing a backup envelope.
    Restore,
    /// Rotating the encryption passphrase.
    Rotate,
}

/// Errors raised by the secure storage subsystem.
///
/// `DecryptionFailed` deliberately carries no detail beyond the operation:
/// a wrong passphrase and tampered ciphertext are indistinguishable to the
/// caller, so the error cannot be used as a decryption oracle.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Encrypting a payload failed.
    #[error("encryption failed during {op}: {context}")]
    EncryptionFailed {
        /// The failing operation.
        op: Operation,
        /// Context describing what was being encrypted.
        context: String,
    },

    /// Authentication of a ciphertext failed (wrong passphrase or tampering).
    #[error("decryption failed during {op}")]
    DecryptionFailed {
        /// The failing operation.
        op: Operation,
    },

    /// The requested item does not exist.
    #[error("item not found during {op}: {item_id}")]
    ItemNotFound {
        /// The failing operation.
        op: Operation,
        /// The identifier that was not found.
        item_id: String,
    },

    /// Input or persisted data is not in the expected format.
    #[error("invalid format during {op}: {context}")]
    InvalidFormat {
        /// The failing operation.
        op: Operation,
        /// Description of the format problem.
        context: String,
    },

    /// The backing medium ran out of capacity.
    #[error("storage full during {op}: {context}")]
    StorageFull {
        /// The failing operation.
        op: Operation,
        /// Description of the capacity limit hit.
        context: String,
    },

    /// Producing a backup envelope failed.
    #[error("backup failed: {context}")]
    BackupFailed {
        /// Description of the failure.
        context: String,
    },

    /// Applying a backup envelope failed; the store is unchanged.
    #[error("restore failed: {context}")]
    RestoreFailed {
        /// Description of the failure.
        context: String,
    },

    /// A backend-specific platform failure (database, keystore, I/O).
    #[error("platform error during {op}: {context}")]
    PlatformError {
        /// The failing operation.
        op: Operation,
        /// Wrapped description of the platform failure.
        context: String,
    },

    /// The platform refused the operation.
    #[error("permission denied during {op}: {context}")]
    PermissionDenied {
        /// The failing operation.
        op: Operation,
        /// Description of the refusal.
        context: String,
    },
}

impl StorageError {
    /// Returns the operation this error occurred in.
    #[must_use]
    pub const fn operation(&self) -> Operation {
        match self {
            Self::EncryptionFailed { op, .. }
            | Self::DecryptionFailed { op }
            | Self::ItemNotFound { op, .. }
            | Self::InvalidFormat { op, .. }
            | Self::StorageFull { op, .. }
            | Self::PlatformError { op, .. }
            | Self::PermissionDenied { op, .. } => *op,
            Self::BackupFailed { .. } => Operation::Backup,
            Self::RestoreFailed { .. } => Operation::Restore,
        }
    }

    /// Creates an encryption failure.
    pub fn encryption<S: Into<String>>(op: Operation, context: S) -> Self {
        Self::EncryptionFailed {
            op,
            context: context.into(),
        }
    }

    /// Creates a decryption failure.
    #[must_use]
    pub const fn decryption(op: Operation) -> Self {
        Self::DecryptionFailed { op }
    }

    /// Creates an item-not-found error.
    pub fn not_found<S: Into<String>>(op: Operation, item_id: S) -> Self {
        Self::ItemNotFound {
            op,
            item_id: item_id.into(),
        }
    }

    /// Creates an invalid-format error.
    pub fn invalid_format<S: Into<String>>(op: Operation, context: S) -> Self {
        Self::InvalidFormat {
            op,
            context: context.into(),
        }
    }

    /// Creates a storage-full error.
    pub fn storage_full<S: Into<String>>(op: Operation, context: S) -> Self {
        Self::StorageFull {
            op,
            context: context.into(),
        }
    }

    /// Creates a backup failure.
    pub fn backup<S: Into<String>>(context: S) -> Self {
        Self::BackupFailed {
            context: context.into(),
        }
    }

    /// Creates a restore failure.
    pub fn restore<S: Into<String>>(context: S) -> Self {
        Self::RestoreFailed {
            context: context.into(),
        }
    }

    /// Wraps a backend-specific platform failure.
    pub fn platform<S: Into<String>>(op: Operation, context: S) -> Self {
        Self::PlatformError {
            op,
            context: context.into(),
        }
    }

    /// Creates a permission-denied error.
    pub fn permission<S: Into<String>>(op: Operation, context: S) -> Self {
        Self::PermissionDenied {
            op,
            context: context.into(),
        }
    }

    /// Attaches an operation to a [`CryptoError`] raised on its behalf.
    pub(crate) fn from_crypto(op: Operation, err: CryptoError) -> Self {
        match err {
            CryptoError::EncryptionFailed(context) => Self::EncryptionFailed { op, context },
            CryptoError::DecryptionFailed => Self::DecryptionFailed { op },
            CryptoError::InvalidFormat(context) => Self::InvalidFormat { op, context },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_operation() {
        let err = StorageError::decryption(Operation::Rotate);
        assert_eq!(format!("{err}"), "decryption failed during rotate");

        let err = StorageError::not_found(Operation::Read, "k1");
        assert!(format!("{err}").contains("k1"));
        assert_eq!(err.operation(), Operation::Read);
    }

    #[test]
    fn test_backup_variants_imply_operation() {
        assert_eq!(
            StorageError::backup("boom").operation(),
            Operation::Backup
        );
        assert_eq!(
            StorageError::restore("boom").operation(),
            Operation::Restore
        );
    }

    #[test]
    fn test_decryption_error_carries_no_cause() {
        // Wrong passphrase and tampered ciphertext must render identically.
        let a = format!("{}", StorageError::decryption(Operation::Read));
        let b = format!("{}", StorageError::decryption(Operation::Read));
        assert_eq!(a, b);
    }
}
