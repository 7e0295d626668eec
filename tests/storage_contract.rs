//! Contract tests run against every storage backend through the client
//! facade: whatever backend a config selects, the observable behavior must
//! be identical.

use secrecy::SecretString;
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use idkit_secure_store::{
    KeyFormat, LogOperation, StorageBackendConfig, StorageClient, StorageError,
};

fn passphrase(value: &str) -> SecretString {
    SecretString::from(value.to_string())
}

/// One client per backend kind, with the temp directory kept alive
/// alongside the disk-backed ones.
fn all_backends() -> (Vec<(&'static str, StorageClient)>, TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let clients = vec![
        (
            "memory",
            StorageClient::open(StorageBackendConfig::Memory {
                passphrase: None,
                max_entries: None,
            })
            .expect("memory backend"),
        ),
        (
            "secure",
            StorageClient::open(StorageBackendConfig::Secure {
                passphrase: passphrase("Strong!Pass1"),
            })
            .expect("secure backend"),
        ),
        (
            "browser",
            StorageClient::open(StorageBackendConfig::Browser {
                path: dir.path().join(format!("{}.redb", Uuid::new_v4())),
                passphrase: passphrase("disk!Pass1"),
            })
            .expect("browser backend"),
        ),
        (
            "native",
            StorageClient::open(StorageBackendConfig::Native { passphrase: None })
                .expect("native backend"),
        ),
        (
            "external-database",
            StorageClient::open(StorageBackendConfig::ExternalDatabase {
                path: dir.path().join(format!("{}.sqlite", Uuid::new_v4())),
                passphrase: passphrase("sql!Pass1"),
            })
            .expect("external database backend"),
        ),
    ];
    (clients, dir)
}

#[tokio::test]
async fn test_key_lifecycle_on_every_backend() {
    let (clients, _dir) = all_backends();
    for (name, client) in &clients {
        client.store_key("k1", &[1, 2, 3]).await.unwrap();
        assert_eq!(
            client.retrieve_key("k1").await.unwrap(),
            Some(vec![1, 2, 3]),
            "retrieve after store on {name}"
        );

        client.delete_key("k1").await.unwrap();
        assert_eq!(
            client.retrieve_key("k1").await.unwrap(),
            None,
            "retrieve after delete on {name}"
        );
    }
}

#[tokio::test]
async fn test_credential_listing_on_every_backend() {
    let (clients, _dir) = all_backends();
    let credential = json!({"id": "c1", "type": "EmailCredential", "claims": {"email": "a@b.c"}});
    for (name, client) in &clients {
        client.store_credential("c1", &credential).await.unwrap();

        let listed = client.list_credentials().await.unwrap();
        assert_eq!(listed.len(), 1, "credential count on {name}");
        assert_eq!(listed[0]["id"], "c1", "credential id on {name}");
    }
}

#[tokio::test]
async fn test_rotation_on_every_backend() {
    let dir = tempfile::tempdir().unwrap();
    let old = passphrase("old!Pass1");
    let new = passphrase("new!Pass2");

    let clients = vec![
        (
            "memory",
            StorageClient::open(StorageBackendConfig::Memory {
                passphrase: Some(old.clone()),
                max_entries: None,
            })
            .unwrap(),
        ),
        (
            "browser",
            StorageClient::open(StorageBackendConfig::Browser {
                path: dir.path().join("rotate.redb"),
                passphrase: old.clone(),
            })
            .unwrap(),
        ),
        (
            "native",
            StorageClient::open(StorageBackendConfig::Native {
                passphrase: Some(old.clone()),
            })
            .unwrap(),
        ),
        (
            "external-database",
            StorageClient::open(StorageBackendConfig::ExternalDatabase {
                path: dir.path().join("rotate.sqlite"),
                passphrase: old.clone(),
            })
            .unwrap(),
        ),
    ];

    for (name, client) in &clients {
        client.store_key("k1", &[1, 2, 3]).await.unwrap();
        client.store_credential("c1", &json!({"id": "c1"})).await.unwrap();

        client.rotate_encryption_key(&old, &new).await.unwrap();

        assert_eq!(
            client.retrieve_key("k1").await.unwrap(),
            Some(vec![1, 2, 3]),
            "key plaintext after rotation on {name}"
        );
        assert_eq!(
            client.retrieve_credential("c1").await.unwrap(),
            Some(json!({"id": "c1"})),
            "credential plaintext after rotation on {name}"
        );

        // The old passphrase no longer decrypts anything.
        let err = client.rotate_encryption_key(&old, &new).await.unwrap_err();
        assert!(
            matches!(err, StorageError::DecryptionFailed { .. }),
            "old passphrase rejected after rotation on {name}"
        );
    }
}

#[tokio::test]
async fn test_backup_reproduces_exact_contents_on_fresh_instance() {
    let (sources, _dir) = all_backends();
    let backup_pass = passphrase("Backup!Pass1");

    for (name, source) in &sources {
        source.store_key("k1", &[1, 2, 3]).await.unwrap();
        source.store_key("k2", b"second").await.unwrap();
        source.store_credential("c1", &json!({"id": "c1"})).await.unwrap();

        let envelope = source.export_backup(&backup_pass).await.unwrap();

        let fresh = StorageClient::open(StorageBackendConfig::Memory {
            passphrase: None,
            max_entries: None,
        })
        .unwrap();
        fresh.import_backup(&envelope, &backup_pass).await.unwrap();

        let mut keys = fresh.list_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["k1".to_string(), "k2".to_string()], "key ids from {name}");
        assert_eq!(fresh.retrieve_key("k1").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(fresh.retrieve_key("k2").await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(
            fresh.retrieve_credential("c1").await.unwrap(),
            Some(json!({"id": "c1"})),
            "credential from {name}"
        );
    }
}

#[tokio::test]
async fn test_backup_envelope_is_opaque_and_passphrase_bound() {
    let (clients, _dir) = all_backends();
    for (name, client) in &clients {
        client.store_key("k1", b"secret material").await.unwrap();
        let envelope = client.export_backup(&passphrase("Backup!Pass1")).await.unwrap();

        assert!(
            !envelope.contains("secret material"),
            "plaintext leaked into envelope from {name}"
        );

        let fresh = StorageClient::open(StorageBackendConfig::Memory {
            passphrase: None,
            max_entries: None,
        })
        .unwrap();
        let err = fresh
            .import_backup(&envelope, &passphrase("Wrong!Pass99"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StorageError::DecryptionFailed { .. }),
            "wrong-passphrase import from {name}"
        );
        assert!(fresh.list_keys().await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_access_log_is_append_only_on_every_backend() {
    let (clients, _dir) = all_backends();
    for (name, client) in &clients {
        client.store_key("k1", b"x").await.unwrap();
        client.retrieve_key("k1").await.unwrap();
        client.delete_key("k1").await.unwrap();

        let log = client.get_access_log();
        assert_eq!(log.len(), 3, "log length on {name}");
        assert_eq!(log[0].operation, LogOperation::Store);
        assert_eq!(log[1].operation, LogOperation::Retrieve);
        assert_eq!(log[2].operation, LogOperation::Delete);
        assert!(log.iter().all(|entry| entry.success));

        // Earlier entries are unchanged by later operations.
        let first = log[0].clone();
        client.store_key("k2", b"y").await.unwrap();
        let log = client.get_access_log();
        assert_eq!(log.len(), 4, "log length after another store on {name}");
        assert_eq!(log[0].timestamp, first.timestamp);
        assert_eq!(log[0].item_id, first.item_id);
    }
}

#[tokio::test]
async fn test_failed_operations_are_logged_on_every_backend() {
    let (clients, _dir) = all_backends();
    for (name, client) in &clients {
        let err = client
            .import_backup("not an envelope", &passphrase("Backup!Pass1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RestoreFailed { .. }));

        let log = client.get_access_log();
        let entry = log.last().expect("restore entry");
        assert_eq!(entry.operation, LogOperation::Restore, "failed op logged on {name}");
        assert!(!entry.success);
        assert!(entry.error.is_some());
    }
}

#[tokio::test]
async fn test_clear_destroys_everything_on_every_backend() {
    let (clients, _dir) = all_backends();
    for (name, client) in &clients {
        client.store_key("k1", b"x").await.unwrap();
        client.store_credential("c1", &json!({})).await.unwrap();
        client.clear().await.unwrap();

        assert!(client.list_keys().await.unwrap().is_empty(), "keys on {name}");
        assert!(
            client.list_credentials().await.unwrap().is_empty(),
            "credentials on {name}"
        );
    }
}

#[tokio::test]
async fn test_key_import_export_round_trip() {
    let (clients, _dir) = all_backends();
    for (name, client) in &clients {
        client
            .import_key("k1", "deadbeef", KeyFormat::Hex)
            .await
            .unwrap();
        let exported = client.export_key("k1", KeyFormat::Base64).await.unwrap();
        client.import_key("k2", &exported, KeyFormat::Base64).await.unwrap();

        assert_eq!(
            client.export_key("k2", KeyFormat::Hex).await.unwrap(),
            "deadbeef",
            "format round trip on {name}"
        );

        let err = client
            .import_key("bad", "not hex at all", KeyFormat::Hex)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidFormat { .. }));
    }
}

#[tokio::test]
async fn test_concurrent_item_operations_on_distinct_ids() {
    let client = std::sync::Arc::new(
        StorageClient::open(StorageBackendConfig::Memory {
            passphrase: None,
            max_entries: None,
        })
        .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..16u8 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("k{i}");
            client.store_key(&id, &[i]).await.unwrap();
            assert_eq!(client.retrieve_key(&id).await.unwrap(), Some(vec![i]));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(client.list_keys().await.unwrap().len(), 16);
}
