use super::artifact;
use super::{
    BackupConfig, BackupError, BackupRecord, BackupRepository, BackupType, Clock,
    CloudStorageGateway, DatabaseInspector, EncryptionEngine, ErrorKind, RestoreTool, Result,
    SystemClock, WalArchiver,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Backup types a point-in-time recovery can start from. Only physical
/// snapshots can seed a data directory that WAL replays onto.
pub const PITR_BASE_TYPES: [BackupType; 1] = [BackupType::Snapshot];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOptions {
    /// Required for a full restore; for point-in-time recovery it pins the base backup
    pub backup_id: Option<Uuid>,
    pub target_database: Option<String>,
    pub point_in_time: Option<DateTime<Utc>>,

    /// Data directory for point-in-time recovery
    pub target_directory: Option<PathBuf>,

    /// Run `CREATE DATABASE` for the target before loading it
    pub create_target: bool,
    pub verify_after_restore: bool,
    pub from_replica: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            backup_id: None,
            target_database: None,
            point_in_time: None,
            target_directory: None,
            create_target: true,
            verify_after_restore: true,
            from_replica: false,
        }
    }
}

impl RestoreOptions {
    pub fn full(backup_id: Uuid) -> Self {
        Self {
            backup_id: Some(backup_id),
            ..Default::default()
        }
    }

    pub fn point_in_time(target_time: DateTime<Utc>) -> Self {
        Self {
            point_in_time: Some(target_time),
            ..Default::default()
        }
    }
}

/// Where a recovery landed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RecoveryTarget {
    Database(String),
    DataDirectory(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub backup_id: Option<Uuid>,
    pub target: Option<RecoveryTarget>,
    pub restored_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub tables_restored: usize,
    pub wal_replayed: usize,
    pub errors: Vec<String>,
    pub error_kind: Option<ErrorKind>,
}

struct Restored {
    target: RecoveryTarget,
    tables_restored: usize,
    wal_replayed: usize,
}

/// Full and point-in-time restores of recorded backups.
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    config: BackupConfig,
    repository: Arc<dyn BackupRepository>,
    restore_tool: Arc<dyn RestoreTool>,
    inspector: Option<Arc<dyn DatabaseInspector>>,
    encryption: Option<EncryptionEngine>,
    cloud: Option<Arc<CloudStorageGateway>>,
    wal_archiver: WalArchiver,
    clock: Arc<dyn Clock>,
}

impl RecoveryEngine {
    pub fn new(
        config: BackupConfig,
        repository: Arc<dyn BackupRepository>,
        restore_tool: Arc<dyn RestoreTool>,
    ) -> Self {
        let wal_archiver = WalArchiver::new(config.wal_archive_directory.clone());
        Self {
            config,
            repository,
            restore_tool,
            inspector: None,
            encryption: None,
            cloud: None,
            wal_archiver,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn DatabaseInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn with_encryption(mut self, engine: EncryptionEngine) -> Self {
        self.encryption = Some(engine);
        self
    }

    pub fn with_cloud_storage(mut self, gateway: Arc<CloudStorageGateway>) -> Self {
        self.cloud = Some(gateway);
        self
    }

    pub fn with_wal_archiver(mut self, archiver: WalArchiver) -> Self {
        self.wal_archiver = archiver;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn inspector(&self) -> Option<&Arc<dyn DatabaseInspector>> {
        self.inspector.as_ref()
    }

    /// Restore a backup, or recover to a point in time when
    /// `options.point_in_time` is set.
    ///
    /// A missing record or an absent PITR base is an `Err`. Failures while
    /// restoring come back as `success: false` with the reason in `errors`.
    #[instrument(skip(self, options), fields(backup_id = ?options.backup_id, point_in_time = ?options.point_in_time))]
    pub async fn restore(&self, options: RestoreOptions) -> Result<RecoveryResult> {
        let started = Instant::now();
        let record = self.select_backup(&options).await?;
        info!(
            "Starting {} from backup {} ({})",
            if options.point_in_time.is_some() {
                "point-in-time recovery"
            } else {
                "full restore"
            },
            record.id,
            record.filename
        );

        let execution = match options.point_in_time {
            Some(target_time) => self.recover_to_point_in_time(&record, target_time, &options).await,
            None => self.restore_full(&record, &options).await,
        };

        let mut errors = Vec::new();
        let result = match execution {
            Ok(restored) => {
                if options.verify_after_restore {
                    if let Err(e) = self.post_restore_check(&restored.target).await {
                        warn!("Post-restore check for backup {} failed: {}", record.id, e);
                        errors.push(format!("Post-restore check failed: {e}"));
                    }
                }
                RecoveryResult {
                    success: true,
                    backup_id: Some(record.id),
                    target: Some(restored.target),
                    restored_at: self.clock.now(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    tables_restored: restored.tables_restored,
                    wal_replayed: restored.wal_replayed,
                    errors,
                    error_kind: None,
                }
            }
            Err(e) => {
                error!("Recovery from backup {} failed: {}", record.id, e);
                errors.push(e.to_string());
                RecoveryResult {
                    success: false,
                    backup_id: Some(record.id),
                    target: None,
                    restored_at: self.clock.now(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    tables_restored: 0,
                    wal_replayed: 0,
                    errors,
                    error_kind: Some(e.kind()),
                }
            }
        };

        info!(
            "Recovery finished: success={}, {} tables, {} WAL segments, {}ms",
            result.success, result.tables_restored, result.wal_replayed, result.duration_ms
        );
        Ok(result)
    }

    /// `restore` bounded by `timeout`. The in-flight restore is dropped, and
    /// with it any running external tool, when the deadline passes.
    pub async fn restore_with_timeout(
        &self,
        options: RestoreOptions,
        timeout: Duration,
    ) -> Result<RecoveryResult> {
        let backup_id = options.backup_id;
        match tokio::time::timeout(timeout, self.restore(options)).await {
            Ok(result) => result,
            Err(_) => {
                let error = BackupError::Timeout {
                    seconds: timeout.as_secs(),
                };
                warn!("Recovery abandoned: {}", error);
                Ok(RecoveryResult {
                    success: false,
                    backup_id,
                    target: None,
                    restored_at: self.clock.now(),
                    duration_ms: timeout.as_millis() as u64,
                    tables_restored: 0,
                    wal_replayed: 0,
                    errors: vec![error.to_string()],
                    error_kind: Some(error.kind()),
                })
            }
        }
    }

    async fn select_backup(&self, options: &RestoreOptions) -> Result<BackupRecord> {
        match (options.point_in_time, options.backup_id) {
            (None, None) => Err(BackupError::config(
                "A backup id is required for a full restore",
            )),
            (None, Some(id)) => {
                let record = self.load(id).await?;
                if !record.status.is_success() {
                    return Err(BackupError::RecoveryFailed {
                        message: format!("Backup {} is {} and cannot be restored", id, record.status),
                    });
                }
                Ok(record)
            }
            (Some(target_time), Some(id)) => {
                let record = self.load(id).await?;
                let eligible = record.status.is_success()
                    && record.created_at <= target_time
                    && PITR_BASE_TYPES.contains(&record.backup_type);
                if eligible {
                    Ok(record)
                } else {
                    Err(BackupError::NoSuitableBackup {
                        target: target_time,
                    })
                }
            }
            (Some(target_time), None) => self
                .repository
                .latest_successful_before(target_time, &PITR_BASE_TYPES)
                .await?
                .ok_or(BackupError::NoSuitableBackup {
                    target: target_time,
                }),
        }
    }

    async fn load(&self, id: Uuid) -> Result<BackupRecord> {
        self.repository
            .get_backup(id)
            .await?
            .ok_or_else(|| BackupError::not_found(format!("backup {id}")))
    }

    async fn restore_full(&self, record: &BackupRecord, options: &RestoreOptions) -> Result<Restored> {
        let target_database = options
            .target_database
            .clone()
            .unwrap_or_else(|| self.fresh_database_name(record));
        let workspace = self.workspace("restore");
        fs::create_dir_all(&workspace).await?;

        let result = self
            .load_into_database(record, &workspace, &target_database, options)
            .await;
        remove_workspace(&workspace).await;
        result
    }

    async fn load_into_database(
        &self,
        record: &BackupRecord,
        workspace: &Path,
        target_database: &str,
        options: &RestoreOptions,
    ) -> Result<Restored> {
        let plaintext = self
            .materialize_plaintext(record, workspace, options.from_replica)
            .await?;
        verify_checksum(record, &plaintext).await?;

        let markers = artifact::scan_markers(&plaintext).await?;

        let connection = &self.config.connection;
        if options.create_target {
            self.restore_tool
                .create_database(connection, target_database)
                .await?;
        }
        self.restore_tool
            .restore(connection, &plaintext, target_database)
            .await?;

        Ok(Restored {
            target: RecoveryTarget::Database(target_database.to_string()),
            tables_restored: markers.tables,
            wal_replayed: 0,
        })
    }

    async fn recover_to_point_in_time(
        &self,
        base: &BackupRecord,
        target_time: DateTime<Utc>,
        options: &RestoreOptions,
    ) -> Result<Restored> {
        let data_directory = options.target_directory.clone().unwrap_or_else(|| {
            self.config
                .backup_directory
                .join("pitr")
                .join(format!("{}-{}", target_time.format("%Y%m%dT%H%M%SZ"), Uuid::new_v4().simple()))
        });
        if fs::try_exists(data_directory.join("PG_VERSION")).await? {
            return Err(BackupError::RecoveryFailed {
                message: format!(
                    "{} already holds a data directory",
                    data_directory.display()
                ),
            });
        }

        let preexisting = fs::try_exists(&data_directory).await?;

        let workspace = self.workspace("pitr-base");
        fs::create_dir_all(&workspace).await?;
        let restored = self
            .restore_base(base, &workspace, &data_directory, options.from_replica)
            .await;
        remove_workspace(&workspace).await;
        if let Err(e) = restored {
            if !preexisting {
                remove_workspace(&data_directory).await;
            }
            return Err(e);
        }

        let segments = self
            .wal_archiver
            .segments_for_window(base.created_at, target_time)
            .await?;
        let wal_replayed = self
            .restore_tool
            .replay_wal(&data_directory, &segments, target_time)
            .await?;
        info!(
            "Staged {} WAL segments for recovery to {} on base {}",
            wal_replayed, target_time, base.id
        );

        Ok(Restored {
            target: RecoveryTarget::DataDirectory(data_directory),
            tables_restored: 0,
            wal_replayed,
        })
    }

    /// Unpack the base backup's archive into `data_directory`.
    async fn restore_base(
        &self,
        base: &BackupRecord,
        workspace: &Path,
        data_directory: &Path,
        from_replica: bool,
    ) -> Result<()> {
        let archive = self
            .materialize_plaintext(base, workspace, from_replica)
            .await
            .map_err(|e| BackupError::RecoveryFailed {
                message: format!("Base backup {} is unavailable: {}", base.id, e),
            })?;
        verify_checksum(base, &archive).await?;
        if !artifact::is_tar_archive(&archive).await? {
            return Err(BackupError::RecoveryFailed {
                message: format!("Base backup {} is not a physical archive", base.id),
            });
        }

        debug!(
            "Unpacking base backup {} into {}",
            base.id,
            data_directory.display()
        );
        artifact::unpack_archive(&archive, data_directory).await
    }

    /// Put the plaintext artifact of `record` inside `workspace`, downloading
    /// and decrypting as needed. Local plaintext is used in place.
    pub async fn materialize_plaintext(
        &self,
        record: &BackupRecord,
        workspace: &Path,
        from_replica: bool,
    ) -> Result<PathBuf> {
        let stored = self.locate_artifact(record, workspace, from_replica).await?;
        if !record.is_encrypted {
            return Ok(stored);
        }

        let engine = self.encryption.as_ref().ok_or_else(|| {
            BackupError::config(format!(
                "Backup {} is encrypted but no master encryption key is configured",
                record.id
            ))
        })?;
        if let Some(key_id) = &record.encryption_key_id {
            if key_id != engine.key_id() {
                return Err(BackupError::EncryptionError {
                    message: format!(
                        "Backup {} was encrypted with key {} but the configured key is {}",
                        record.id,
                        key_id,
                        engine.key_id()
                    ),
                });
            }
        }

        let plaintext = workspace.join(format!(
            "{}.{}",
            record.filename,
            record.plaintext_extension()
        ));
        engine.decrypt_file(&stored, &plaintext).await?;
        Ok(plaintext)
    }

    async fn locate_artifact(
        &self,
        record: &BackupRecord,
        workspace: &Path,
        from_replica: bool,
    ) -> Result<PathBuf> {
        if !from_replica {
            if let Some(path) = &record.local_path {
                if fs::try_exists(path).await? {
                    return Ok(path.clone());
                }
                debug!("Local artifact {} is gone, trying remote", path.display());
            }
        }

        let remote = if from_replica {
            record.replica_remote.as_ref()
        } else {
            record.primary_remote.as_ref()
        }
        .ok_or_else(|| {
            BackupError::not_found(format!(
                "{} artifact for backup {}",
                if from_replica { "replica" } else { "stored" },
                record.id
            ))
        })?;
        let cloud = self
            .cloud
            .as_ref()
            .ok_or_else(|| BackupError::config("Cloud storage is not configured"))?;

        let destination = workspace.join(format!("{}.{}", record.filename, record.extension()));
        cloud.download(&remote.key, &destination, from_replica).await?;
        Ok(destination)
    }

    async fn post_restore_check(&self, target: &RecoveryTarget) -> Result<()> {
        match target {
            RecoveryTarget::Database(name) => {
                let Some(inspector) = &self.inspector else {
                    debug!("No database inspector configured, skipping post-restore check");
                    return Ok(());
                };
                let counts = inspector
                    .table_row_counts(&self.config.connection.with_database(name))
                    .await?;
                if counts.is_empty() {
                    return Err(BackupError::RecoveryFailed {
                        message: format!("Restored database {name} has no tables"),
                    });
                }
                let rows: i64 = counts.iter().map(|c| c.rows).sum();
                debug!("Restored database {} has {} tables, {} rows", name, counts.len(), rows);
                Ok(())
            }
            RecoveryTarget::DataDirectory(dir) => {
                for required in ["PG_VERSION", "recovery.signal"] {
                    if !fs::try_exists(dir.join(required)).await? {
                        return Err(BackupError::RecoveryFailed {
                            message: format!("{} is missing from {}", required, dir.display()),
                        });
                    }
                }
                Ok(())
            }
        }
    }

    /// Drop a database created by a restore. Errors are the caller's to log.
    pub async fn drop_database(&self, name: &str) -> Result<()> {
        self.restore_tool
            .drop_database(&self.config.connection, name)
            .await
    }

    /// A unique scratch directory under the backup directory.
    pub fn workspace(&self, purpose: &str) -> PathBuf {
        self.config
            .backup_directory
            .join(purpose)
            .join(Uuid::new_v4().to_string())
    }

    fn fresh_database_name(&self, record: &BackupRecord) -> String {
        format!(
            "restore_{}_{}",
            &record.id.simple().to_string()[..8],
            self.clock.now().format("%Y%m%d%H%M%S")
        )
    }
}

/// The plaintext must hash to the checksum recorded at backup time.
async fn verify_checksum(record: &BackupRecord, plaintext: &Path) -> Result<()> {
    let Some(expected) = &record.checksum_sha256 else {
        return Ok(());
    };
    let actual = artifact::sha256_file(plaintext).await?;
    if &actual != expected {
        return Err(BackupError::IntegrityError {
            message: format!(
                "Checksum mismatch for backup {}: expected {}, got {}",
                record.id, expected, actual
            ),
        });
    }
    Ok(())
}

pub(crate) async fn remove_workspace(workspace: &Path) {
    if let Err(e) = fs::remove_dir_all(workspace).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove workspace {}: {}", workspace.display(), e);
        }
    }
}
