use super::artifact;
use super::encryption::{probe_encrypted_artifact, HEADER_LEN, TAG_LEN};
use super::recovery::remove_workspace;
use super::{
    BackupConfig, BackupError, BackupFilter, BackupOptions, BackupRecord, BackupRepository,
    BackupStatus, BackupType, BucketLocation, Clock, CloudStorageGateway, DumpTool, EncryptionEngine,
    EnhancedBackupResult, ObjectMetadata, Result, StorageLocation, StorageUsage, SystemClock,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Drives one backup from dump to persisted record, and owns deletion and
/// expiry of existing backups.
#[derive(Debug, Clone)]
pub struct BackupManager {
    config: BackupConfig,
    repository: Arc<dyn BackupRepository>,
    dump_tool: Arc<dyn DumpTool>,
    encryption: Option<EncryptionEngine>,
    cloud: Option<Arc<CloudStorageGateway>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub deleted: u32,
    pub bytes_freed: u64,
    pub failures: Vec<CleanupFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub backup_id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackupAlert {
    /// No successful backup, or the newest one is too old
    RetentionLag {
        hours_since_last: Option<i64>,
        threshold_hours: u32,
    },
    StorageUsage {
        total_bytes: u64,
        threshold_bytes: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStatistics {
    pub total_backups: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
    pub by_tier: BTreeMap<String, u64>,
    pub total_size_bytes: u64,
    pub last_successful_backup: Option<DateTime<Utc>>,
    pub replicated_backups: u64,
    pub rto_target_minutes: u32,
    pub rpo_target_minutes: u32,
    pub alerts: Vec<BackupAlert>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationStatusReport {
    pub cloud_enabled: bool,
    pub cross_region_enabled: bool,
    pub primary: Option<BucketLocation>,
    pub replica: Option<BucketLocation>,
    pub usage: Option<StorageUsage>,
    pub replicated_backups: u64,
    /// Uploaded to the primary bucket but missing from the replica
    pub unreplicated_backups: u64,
}

const ARTIFACT_EXTENSIONS: [&str; 8] = [
    "sql", "sql.gz", "sql.enc", "sql.gz.enc", "tar", "tar.gz", "tar.enc", "tar.gz.enc",
];

impl BackupManager {
    pub fn new(
        config: BackupConfig,
        repository: Arc<dyn BackupRepository>,
        dump_tool: Arc<dyn DumpTool>,
    ) -> Self {
        Self {
            config,
            repository,
            dump_tool,
            encryption: None,
            cloud: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_encryption(mut self, engine: EncryptionEngine) -> Self {
        self.encryption = Some(engine);
        self
    }

    pub fn with_cloud_storage(mut self, gateway: Arc<CloudStorageGateway>) -> Self {
        self.cloud = Some(gateway);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing backup manager");
        fs::create_dir_all(&self.config.backup_directory).await?;
        fs::create_dir_all(&self.config.wal_archive_directory).await?;
        self.repository.initialize().await?;
        info!("Backup manager initialized successfully");
        Ok(())
    }

    /// Run the full pipeline for a new backup.
    ///
    /// Pipeline failures come back as `success: false` with the record
    /// persisted as `Failed`; `Err` means the record itself could not be stored.
    #[instrument(skip(self, options), fields(backup_type = %options.backup_type))]
    pub async fn create_backup(&self, options: BackupOptions) -> Result<EnhancedBackupResult> {
        let started = Instant::now();
        let created_at = self.clock.now();
        let policy = self.config.retention;
        let tier = options
            .retention_tier
            .unwrap_or_else(|| policy.classify(created_at));

        let mut record = BackupRecord::new(
            options.backup_type,
            &self.config.connection.database,
            tier,
            policy.expiration_of(created_at, tier),
            created_at,
        );
        self.repository.insert_backup(&record).await?;

        info!(
            "Starting {} backup {} (tier {}, expires {})",
            record.backup_type, record.id, record.retention_tier, record.expires_at
        );

        let outcome = self.run_pipeline(&mut record, &options).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        record.duration_ms = Some(duration_ms);

        match outcome {
            Ok(()) => {
                record.completed_at = Some(self.clock.now());
                self.repository.update_backup(&record).await?;
                info!(
                    "Backup {} finished as {} ({} bytes stored, {:?})",
                    record.id, record.status, record.stored_size_bytes, record.storage_locations
                );
                Ok(EnhancedBackupResult {
                    success: true,
                    backup: record,
                    error: None,
                    error_kind: None,
                    duration_ms,
                })
            }
            Err(e) => {
                error!("Backup {} failed: {}", record.id, e);
                self.discard_artifacts(&mut record).await;
                if let Err(transition) = record.transition(BackupStatus::Failed) {
                    warn!("{}", transition);
                    record.status = BackupStatus::Failed;
                }
                record.error_message = Some(e.to_string());
                record.retry_count += 1;
                self.repository.update_backup(&record).await?;
                Ok(EnhancedBackupResult {
                    success: false,
                    backup: record,
                    error: Some(e.to_string()),
                    error_kind: Some(e.kind()),
                    duration_ms,
                })
            }
        }
    }

    async fn run_pipeline(&self, record: &mut BackupRecord, options: &BackupOptions) -> Result<()> {
        self.validate_options(options)?;

        record.transition(BackupStatus::InProgress)?;
        self.repository.update_backup(record).await?;

        fs::create_dir_all(&self.config.backup_directory).await?;
        let compress = options.compress.unwrap_or(self.config.compress_by_default);
        record.is_compressed = compress;
        let dump_path = self.artifact_path(record, record.plaintext_extension());

        match record.backup_type {
            BackupType::Snapshot => self.take_snapshot(record, &dump_path, compress).await?,
            _ => {
                self.dump_tool
                    .dump(&self.config.connection, &dump_path, compress)
                    .await?
            }
        }

        record.is_compressed = artifact::is_gzip(&dump_path).await?;
        record.size_bytes = artifact::file_size(&dump_path).await?;
        record.stored_size_bytes = record.size_bytes;
        record.checksum_sha256 = Some(artifact::sha256_file(&dump_path).await?);
        record.local_path = Some(dump_path.clone());
        debug!(
            "Dump for {} written: {} bytes, sha256 {:?}",
            record.id, record.size_bytes, record.checksum_sha256
        );

        if options.encrypt {
            let engine = self.encryption_engine()?;
            record.is_encrypted = true;
            let encrypted_path = self.artifact_path(record, record.extension());
            let summary = engine.encrypt_file(&dump_path, &encrypted_path).await?;
            fs::remove_file(&dump_path).await?;

            record.local_path = Some(encrypted_path);
            record.stored_size_bytes = summary.artifact_bytes;
            record.encryption_key_id = Some(summary.metadata.key_id.clone());
            record.encryption = Some(summary.metadata);
        }

        record.add_location(StorageLocation::Local);

        if options.upload_to_cloud {
            let cloud = self.cloud_gateway()?;
            let local_path = self.local_artifact(record)?;
            let metadata = ObjectMetadata {
                backup_id: record.id,
                retention_tier: record.retention_tier,
                uploaded_at: self.clock.now(),
                checksum_sha256: record.checksum_sha256.clone(),
                encrypted: record.is_encrypted,
                encryption_key_id: record.encryption_key_id.clone(),
            };
            let remote = cloud
                .upload(&local_path, record.created_at, record.extension(), &metadata)
                .await?;
            let primary_key = remote.key.clone();
            record.primary_remote = Some(remote);
            record.add_location(StorageLocation::PrimaryRemote);

            if options.cross_region_replication {
                match cloud.replicate(&primary_key).await {
                    Ok(replica) => {
                        record.replica_remote = Some(replica);
                        record.add_location(StorageLocation::ReplicaRemote);
                        record.replicated_at = Some(self.clock.now());
                        record.transition(BackupStatus::Replicated)?;
                    }
                    Err(e) => {
                        warn!(
                            "Cross-region replication failed for backup {}, continuing: {}",
                            record.id, e
                        );
                    }
                }
            }
        }

        if options.verify && record.status != BackupStatus::Replicated {
            self.self_check(record).await?;
            record.verified_at = Some(self.clock.now());
            record.transition(BackupStatus::Verified)?;
        }

        if record.status == BackupStatus::InProgress {
            record.transition(BackupStatus::Completed)?;
        }
        Ok(())
    }

    fn validate_options(&self, options: &BackupOptions) -> Result<()> {
        if options.encrypt && self.encryption.is_none() {
            return Err(BackupError::config(
                "Encryption requested but no master encryption key is configured",
            ));
        }
        let cloud_enabled = self.cloud.as_ref().is_some_and(|c| c.config().enabled);
        if options.upload_to_cloud && !cloud_enabled {
            return Err(BackupError::config(
                "Cloud upload requested but cloud storage is not enabled",
            ));
        }
        if options.cross_region_replication {
            let replication_ready = self
                .cloud
                .as_ref()
                .is_some_and(|c| c.config().enabled && c.config().replication_configured());
            if !replication_ready {
                return Err(BackupError::config(
                    "Cross-region replication requested but it is not enabled",
                ));
            }
            if !options.upload_to_cloud {
                return Err(BackupError::config(
                    "Cross-region replication requires cloud upload",
                ));
            }
        }
        Ok(())
    }

    /// Physical base backup through the dump tool's `basebackup`, moved from
    /// its staging directory to `output`.
    async fn take_snapshot(&self, record: &BackupRecord, output: &Path, compress: bool) -> Result<()> {
        let staging = self
            .config
            .backup_directory
            .join("snapshot")
            .join(record.id.to_string());
        fs::create_dir_all(&staging).await?;

        let result = async {
            self.dump_tool
                .basebackup(&self.config.connection, &staging, compress)
                .await?;
            let archive = staging.join(if compress { "base.tar.gz" } else { "base.tar" });
            if !fs::try_exists(&archive).await? {
                return Err(BackupError::BackupFailed {
                    message: format!("Base backup left no {} behind", archive.display()),
                });
            }
            fs::rename(&archive, output).await?;
            Ok(())
        }
        .await;
        remove_workspace(&staging).await;
        result
    }

    /// Non-empty artifact; encrypted artifacts must carry a readable header,
    /// compressed plaintext must decompress, through decryption if need be.
    async fn self_check(&self, record: &BackupRecord) -> Result<()> {
        let path = self.local_artifact(record)?;
        let size = artifact::file_size(&path).await?;
        if size == 0 || record.size_bytes == 0 {
            return Err(BackupError::IntegrityError {
                message: format!("Backup artifact {} is empty", path.display()),
            });
        }

        if record.is_encrypted {
            if size <= (HEADER_LEN + TAG_LEN) as u64 {
                return Err(BackupError::IntegrityError {
                    message: "Encrypted artifact holds no ciphertext".to_string(),
                });
            }
            probe_encrypted_artifact(&path).await?;
            if record.is_compressed {
                self.probe_encrypted_payload(record, &path).await?;
            }
        } else if record.is_compressed {
            artifact::probe_decompression(&path).await?;
        }
        Ok(())
    }

    async fn probe_encrypted_payload(&self, record: &BackupRecord, path: &Path) -> Result<()> {
        let engine = self.encryption_engine()?;
        let scratch = self
            .config
            .backup_directory
            .join("self-check")
            .join(record.id.to_string());
        fs::create_dir_all(&scratch).await?;

        let plaintext = scratch.join(format!("{}.{}", record.filename, record.plaintext_extension()));
        let result = async {
            engine.decrypt_file(path, &plaintext).await?;
            artifact::probe_decompression(&plaintext).await
        }
        .await;
        remove_workspace(&scratch).await;
        result.map(|expanded| debug!("Encrypted payload of {} expands to {} bytes", record.id, expanded))
    }

    pub async fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        self.repository.get_backup(id).await
    }

    pub async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>> {
        self.repository.list_backups(filter).await
    }

    /// Remove the artifact everywhere it was stored and mark the record `Deleted`.
    /// Returns `false` when there is no such (live) backup.
    #[instrument(skip(self))]
    pub async fn delete_backup(&self, id: Uuid) -> Result<bool> {
        let Some(mut record) = self.repository.get_backup(id).await? else {
            debug!("Backup {} not found, nothing to delete", id);
            return Ok(false);
        };
        if record.status == BackupStatus::Deleted {
            debug!("Backup {} already deleted", id);
            return Ok(false);
        }

        if let Some(path) = &record.local_path {
            remove_if_present(path).await?;
        }

        if let Some(remote) = &record.primary_remote {
            match &self.cloud {
                Some(cloud) => {
                    cloud
                        .delete(&remote.key, record.replica_remote.is_some())
                        .await?;
                }
                None => {
                    warn!(
                        "Backup {} has a remote copy at {}/{} but cloud storage is not configured, leaving it in place",
                        id, remote.bucket, remote.key
                    );
                    if let Some(replica) = &record.replica_remote {
                        warn!(
                            "Backup {} replica at {}/{} is left in place as well",
                            id, replica.bucket, replica.key
                        );
                    }
                }
            }
        }

        record.transition(BackupStatus::Deleted)?;
        self.repository.update_backup(&record).await?;
        info!("Deleted backup {}", id);
        Ok(true)
    }

    pub async fn cleanup_expired_backups(&self) -> Result<CleanupReport> {
        let now = self.clock.now();
        let expired = self.repository.find_expired(now).await?;
        info!("Starting backup cleanup: {} expired backups", expired.len());

        let mut report = CleanupReport::default();
        for backup in expired {
            match self.delete_backup(backup.id).await {
                Ok(true) => {
                    report.deleted += 1;
                    report.bytes_freed += backup.stored_size_bytes;
                    info!("Deleted expired backup: {}", backup.id);
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to delete expired backup {}: {}", backup.id, e);
                    report.failures.push(CleanupFailure {
                        backup_id: backup.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Cleanup completed: {} backups deleted, {} bytes freed",
            report.deleted, report.bytes_freed
        );
        Ok(report)
    }

    pub async fn get_backup_statistics(&self) -> Result<BackupStatistics> {
        let records = self
            .repository
            .list_backups(&BackupFilter {
                include_deleted: true,
                ..Default::default()
            })
            .await?;

        let mut by_type = BTreeMap::new();
        let mut by_status = BTreeMap::new();
        let mut by_tier = BTreeMap::new();
        let mut total_size_bytes = 0;
        let mut last_successful_backup: Option<DateTime<Utc>> = None;
        let mut replicated_backups = 0;

        for record in &records {
            *by_type.entry(record.backup_type.to_string()).or_insert(0) += 1;
            *by_status.entry(record.status.to_string()).or_insert(0) += 1;
            *by_tier.entry(record.retention_tier.to_string()).or_insert(0) += 1;

            if record.status.is_success() {
                total_size_bytes += record.stored_size_bytes;
                last_successful_backup = last_successful_backup.max(Some(record.created_at));
                if record.has_location(StorageLocation::ReplicaRemote) {
                    replicated_backups += 1;
                }
            }
        }

        let mut alerts = Vec::new();
        let hours_since_last =
            last_successful_backup.map(|t| (self.clock.now() - t).num_hours());
        if hours_since_last.map_or(true, |h| h > self.config.max_backup_age_hours as i64) {
            warn!("Backup retention lag: last success {:?} hours ago", hours_since_last);
            alerts.push(BackupAlert::RetentionLag {
                hours_since_last,
                threshold_hours: self.config.max_backup_age_hours,
            });
        }
        if total_size_bytes > self.config.storage_warning_bytes {
            warn!("Backup storage usage {} bytes exceeds threshold", total_size_bytes);
            alerts.push(BackupAlert::StorageUsage {
                total_bytes: total_size_bytes,
                threshold_bytes: self.config.storage_warning_bytes,
            });
        }

        Ok(BackupStatistics {
            total_backups: records.len() as u64,
            by_type,
            by_status,
            by_tier,
            total_size_bytes,
            last_successful_backup,
            replicated_backups,
            rto_target_minutes: self.config.rto_minutes,
            rpo_target_minutes: self.config.rpo_minutes,
            alerts,
        })
    }

    pub async fn replication_status(&self) -> Result<ReplicationStatusReport> {
        let records = self.repository.list_backups(&BackupFilter::default()).await?;
        let uploaded: Vec<&BackupRecord> = records
            .iter()
            .filter(|r| r.status.is_success() && r.has_location(StorageLocation::PrimaryRemote))
            .collect();
        let replicated_backups = uploaded
            .iter()
            .filter(|r| r.has_location(StorageLocation::ReplicaRemote))
            .count() as u64;

        let (cloud_enabled, cross_region_enabled, primary, replica, usage) = match &self.cloud {
            Some(cloud) => {
                let config = cloud.config();
                let usage = if config.enabled {
                    match cloud.usage().await {
                        Ok(usage) => Some(usage),
                        Err(e) => {
                            warn!("Could not read storage usage: {}", e);
                            None
                        }
                    }
                } else {
                    None
                };
                (
                    config.enabled,
                    config.replication_configured(),
                    Some(config.primary.clone()),
                    config.replica.clone(),
                    usage,
                )
            }
            None => (false, false, None, None, None),
        };

        Ok(ReplicationStatusReport {
            cloud_enabled,
            cross_region_enabled,
            primary,
            replica,
            usage,
            replicated_backups,
            unreplicated_backups: uploaded.len() as u64 - replicated_backups,
        })
    }

    fn artifact_path(&self, record: &BackupRecord, extension: &str) -> PathBuf {
        self.config
            .backup_directory
            .join(format!("{}.{}", record.filename, extension))
    }

    fn local_artifact(&self, record: &BackupRecord) -> Result<PathBuf> {
        record.local_path.clone().ok_or_else(|| BackupError::IntegrityError {
            message: format!("Backup {} has no local artifact", record.id),
        })
    }

    fn encryption_engine(&self) -> Result<&EncryptionEngine> {
        self.encryption
            .as_ref()
            .ok_or_else(|| BackupError::config("Encryption is not configured"))
    }

    fn cloud_gateway(&self) -> Result<&Arc<CloudStorageGateway>> {
        self.cloud
            .as_ref()
            .ok_or_else(|| BackupError::config("Cloud storage is not configured"))
    }

    /// Undo whatever a failed run left behind, locally and remotely.
    async fn discard_artifacts(&self, record: &mut BackupRecord) {
        for extension in ARTIFACT_EXTENSIONS {
            let path = self.artifact_path(record, extension);
            if let Err(e) = remove_if_present(&path).await {
                warn!("Failed to remove partial artifact {}: {}", path.display(), e);
            }
        }

        if let (Some(remote), Some(cloud)) = (&record.primary_remote, &self.cloud) {
            if let Err(e) = cloud
                .delete(&remote.key, record.replica_remote.is_some())
                .await
            {
                warn!("Failed to remove remote copy {}: {}", remote.key, e);
            }
        }

        record.local_path = None;
        record.primary_remote = None;
        record.replica_remote = None;
        record.storage_locations.clear();
    }
}

async fn remove_if_present(path: &std::path::Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
