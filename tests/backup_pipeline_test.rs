//! End-to-end runs of the backup pipeline against fake tools and a
//! directory-backed object store.

mod helpers;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use codex_backup::backup::{
    BackupError, BackupOptions, BackupRecord, BackupRepository, BackupStatus, BackupType,
    BlobStore, CloudStorageGateway, ErrorKind, FilesystemBlobStore, Result, RetentionTier,
    StorageLocation, StoredObject,
};
use helpers::{ts, Harness};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing_test::traced_test;

#[tokio::test]
async fn test_encrypted_local_backup() {
    let harness = Harness::new();
    let manager = harness.encrypted_manager();

    let result = manager
        .create_backup(BackupOptions {
            encrypt: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    let backup = &result.backup;
    assert_eq!(backup.storage_locations, vec![StorageLocation::Local]);
    assert!(backup.is_encrypted);
    assert!(backup.is_compressed);
    assert!(backup.checksum_sha256.is_some());
    assert!(matches!(
        backup.status,
        BackupStatus::Completed | BackupStatus::Verified
    ));

    let local = backup.local_path.clone().unwrap();
    assert!(local.to_string_lossy().ends_with(".sql.gz.enc"));
    assert!(local.exists());
    assert!(!local.with_extension("").exists(), "plaintext dump left behind");

    let metadata = backup.encryption.as_ref().unwrap();
    assert_eq!(metadata.algorithm, "aes-256-gcm");
    assert_eq!(Some(&metadata.key_id), backup.encryption_key_id.as_ref());
    assert!(backup.stored_size_bytes > backup.size_bytes);

    let stored = harness.repository.get_backup(backup.id).await.unwrap().unwrap();
    assert_eq!(stored.status, backup.status);
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn test_new_year_backup_is_kept_for_seven_years() {
    let harness = Harness::at(ts(2024, 1, 1, 0, 30));
    let manager = harness.manager();

    let result = manager.create_backup(BackupOptions::default()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.backup.retention_tier, RetentionTier::Yearly);
    assert_eq!(
        result.backup.expires_at - result.backup.created_at,
        ChronoDuration::days(2555)
    );
}

#[tokio::test]
async fn test_replication_without_cloud_is_a_configuration_failure() {
    let harness = Harness::new();
    let manager = harness.manager();

    let result = manager
        .create_backup(BackupOptions {
            upload_to_cloud: true,
            cross_region_replication: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::Configuration));
    assert_eq!(harness.dump_tool.calls.load(Ordering::SeqCst), 0);

    let stored = harness.repository.get_backup(result.backup.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BackupStatus::Failed);
    assert!(stored.error_message.is_some());
}

#[tokio::test]
async fn test_replication_with_cloud_but_no_replica_is_rejected() {
    let harness = Harness::new();
    let manager = harness.manager().with_cloud_storage(harness.filesystem_cloud(false));

    let result = manager
        .create_backup(BackupOptions {
            upload_to_cloud: true,
            cross_region_replication: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::Configuration));
}

#[tokio::test]
async fn test_failed_dump_is_persisted_and_cleaned_up() {
    let harness = Harness::new();
    harness.dump_tool.fail.store(true, Ordering::SeqCst);
    let manager = harness.manager();

    let result = manager.create_backup(BackupOptions::default()).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ExternalTool));
    assert!(result.error.unwrap().contains("connection refused"));

    let stored = harness.repository.get_backup(result.backup.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BackupStatus::Failed);
    assert_eq!(stored.retry_count, 1);
    assert!(stored.storage_locations.is_empty());
    assert!(stored.local_path.is_none());

    let leftovers = std::fs::read_dir(&harness.config.backup_directory)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_upload_and_replicate() {
    let harness = Harness::new();
    let manager = harness
        .encrypted_manager()
        .with_cloud_storage(harness.filesystem_cloud(true));

    let result = manager
        .create_backup(BackupOptions {
            encrypt: true,
            upload_to_cloud: true,
            cross_region_replication: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    let backup = &result.backup;
    assert_eq!(backup.status, BackupStatus::Replicated);
    assert_eq!(
        backup.storage_locations,
        vec![
            StorageLocation::Local,
            StorageLocation::PrimaryRemote,
            StorageLocation::ReplicaRemote
        ]
    );
    assert!(backup.replicated_at.is_some());

    let primary = backup.primary_remote.as_ref().unwrap();
    let replica = backup.replica_remote.as_ref().unwrap();
    assert_eq!(
        primary.key,
        format!("daily/2024/06/12/backup-{}.sql.gz.enc", backup.id)
    );
    assert_eq!(primary.key, replica.key);
    assert_eq!(replica.bucket, "backups-replica");
    assert_eq!(replica.region, "eu-west-1");

    let root = harness.dir.path().join("object-store");
    assert!(root.join("backups-primary").join(&primary.key).exists());
    assert!(root.join("backups-replica").join(&replica.key).exists());
}

/// Stores uploads on disk but refuses cross-bucket copies.
#[derive(Debug)]
struct CopyRefusingStore(FilesystemBlobStore);

#[async_trait]
impl BlobStore for CopyRefusingStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        metadata: &BTreeMap<String, String>,
        server_side_encryption: bool,
    ) -> Result<Option<String>> {
        self.0
            .put_object(bucket, key, source, metadata, server_side_encryption)
            .await
    }

    async fn get_object(&self, bucket: &str, key: &str, destination: &Path) -> Result<u64> {
        self.0.get_object(bucket, key, destination).await
    }

    async fn copy_object(&self, _: &str, _: &str, dest_bucket: &str, _: &str) -> Result<Option<String>> {
        Err(BackupError::StorageError {
            message: format!("{dest_bucket} is unreachable"),
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.0.delete_object(bucket, key).await
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>> {
        self.0.head_object(bucket, key).await
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<StoredObject>> {
        self.0.list_objects(bucket, prefix).await
    }
}

#[tokio::test]
#[traced_test]
async fn test_replication_failure_does_not_fail_the_backup() {
    let harness = Harness::new();
    let config = harness.cloud_config(true);
    let primary = Arc::new(FilesystemBlobStore::new(&config.filesystem_root));
    let replica = Arc::new(CopyRefusingStore(FilesystemBlobStore::new(
        &config.filesystem_root,
    )));
    let gateway = Arc::new(CloudStorageGateway::new(config, primary, Some(replica)));
    let manager = harness.manager().with_cloud_storage(gateway);

    let result = manager
        .create_backup(BackupOptions {
            upload_to_cloud: true,
            cross_region_replication: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.backup.status, BackupStatus::Verified);
    assert!(result.backup.has_location(StorageLocation::PrimaryRemote));
    assert!(!result.backup.has_location(StorageLocation::ReplicaRemote));
    assert!(result.backup.replica_remote.is_none());
    assert!(result.backup.replicated_at.is_none());
    assert!(logs_contain("Cross-region replication failed"));
}

#[tokio::test]
async fn test_delete_removes_every_copy() {
    let harness = Harness::new();
    let manager = harness
        .manager()
        .with_cloud_storage(harness.filesystem_cloud(true));

    let backup = manager
        .create_backup(BackupOptions {
            upload_to_cloud: true,
            cross_region_replication: true,
            ..Default::default()
        })
        .await
        .unwrap()
        .backup;
    let local = backup.local_path.clone().unwrap();
    let key = backup.primary_remote.clone().unwrap().key;
    let root = harness.dir.path().join("object-store");

    assert!(manager.delete_backup(backup.id).await.unwrap());
    assert!(!local.exists());
    assert!(!root.join("backups-primary").join(&key).exists());
    assert!(!root.join("backups-replica").join(&key).exists());

    let stored = harness.repository.get_backup(backup.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BackupStatus::Deleted);

    // a second delete finds nothing live
    assert!(!manager.delete_backup(backup.id).await.unwrap());
}

fn catalog_record(
    harness: &Harness,
    days_until_expiry: i64,
    status: BackupStatus,
    stored_size_bytes: u64,
) -> BackupRecord {
    let created_at = ts(2024, 3, 5, 2, 0);
    let now = ts(2024, 6, 12, 2, 0);
    let mut record = BackupRecord::new(
        BackupType::Full,
        &harness.config.connection.database,
        RetentionTier::Daily,
        now + ChronoDuration::days(days_until_expiry),
        created_at,
    );
    record.transition(BackupStatus::InProgress).unwrap();
    record.transition(status).unwrap();
    record.stored_size_bytes = stored_size_bytes;
    record
}

#[tokio::test]
async fn test_cleanup_deletes_exactly_the_expired_backups() {
    let harness = Harness::new();
    let manager = harness.manager();

    let expired = vec![
        catalog_record(&harness, -1, BackupStatus::Completed, 100),
        catalog_record(&harness, -10, BackupStatus::Completed, 200),
        catalog_record(&harness, -30, BackupStatus::Completed, 300),
    ];
    let mut others = vec![
        catalog_record(&harness, -5, BackupStatus::Failed, 1_000),
        catalog_record(&harness, -5, BackupStatus::Failed, 1_000),
    ];
    for days in [1, 2, 7, 30, 300] {
        others.push(catalog_record(&harness, days, BackupStatus::Completed, 5_000));
    }
    for record in expired.iter().chain(others.iter()) {
        harness.repository.insert_backup(record).await.unwrap();
    }

    let report = manager.cleanup_expired_backups().await.unwrap();

    assert_eq!(report.deleted, 3);
    assert_eq!(report.bytes_freed, 600);
    assert!(report.failures.is_empty());
    for record in &expired {
        let stored = harness.repository.get_backup(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::Deleted);
    }
    for record in &others {
        let stored = harness.repository.get_backup(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, record.status);
    }
}

#[tokio::test]
async fn test_statistics_after_a_backup() {
    let harness = Harness::new();
    let manager = harness.manager();
    let created = manager.create_backup(BackupOptions::default()).await.unwrap();
    assert!(created.success);

    let stats = manager.get_backup_statistics().await.unwrap();

    assert_eq!(stats.total_backups, 1);
    assert_eq!(stats.by_type.get("full"), Some(&1));
    assert_eq!(stats.by_tier.get("daily"), Some(&1));
    assert_eq!(stats.last_successful_backup, Some(created.backup.created_at));
    assert_eq!(stats.total_size_bytes, created.backup.stored_size_bytes);
    assert!(stats.alerts.is_empty(), "{:?}", stats.alerts);
}

#[tokio::test]
async fn test_statistics_flag_a_stale_catalog() {
    let harness = Harness::new();
    let manager = harness.manager();
    assert!(manager.create_backup(BackupOptions::default()).await.unwrap().success);

    harness.clock.set(ts(2024, 6, 14, 2, 0));
    let stats = manager.get_backup_statistics().await.unwrap();

    assert_eq!(stats.alerts.len(), 1);
    let rendered = serde_json::to_value(&stats.alerts[0]).unwrap();
    assert_eq!(rendered["hours_since_last"], 48);
}
