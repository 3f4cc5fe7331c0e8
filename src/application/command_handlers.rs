use crate::application::DependencyContainer;
use crate::backup::{
    BackupFilter, BackupOptions, BackupStatus, BackupType, DrillScenario, RestoreOptions,
    RetentionTier, VerifyOptions, WalArchiver,
};
use crate::setup::SetupManager;
use crate::Config;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

// Command handling kept out of main.rs; output goes to stdout, progress to the log

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to render output: {}", e))?;
    println!("{rendered}");
    Ok(())
}

/// Options for `backup create`, before config defaults are applied
#[derive(Debug, Clone, Default)]
pub struct CreateBackupArgs {
    pub backup_type: Option<BackupType>,
    pub encrypt: Option<bool>,
    pub upload: Option<bool>,
    pub replicate: Option<bool>,
    pub compress: Option<bool>,
    pub verify: Option<bool>,
    pub retention_tier: Option<RetentionTier>,
}

impl CreateBackupArgs {
    /// Fill unset flags from the scheduled-backup defaults
    pub fn resolve(&self, config: &Config) -> BackupOptions {
        let defaults = config.scheduled_backup_options();
        let upload_to_cloud = self.upload.unwrap_or(defaults.upload_to_cloud);
        BackupOptions {
            backup_type: self.backup_type.unwrap_or(defaults.backup_type),
            compress: self.compress.or(defaults.compress),
            encrypt: self.encrypt.unwrap_or(defaults.encrypt),
            upload_to_cloud,
            cross_region_replication: self
                .replicate
                .unwrap_or(defaults.cross_region_replication && upload_to_cloud),
            verify: self.verify.unwrap_or(defaults.verify),
            retention_tier: self.retention_tier,
        }
    }
}

pub struct BackupCommandHandler {
    container: Arc<DependencyContainer>,
}

impl BackupCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn create_backup(&self, args: &CreateBackupArgs) -> Result<()> {
        let options = args.resolve(&self.container.config);
        let result = self.container.backup_manager.create_backup(options).await?;

        if result.success {
            info!(
                "✅ Backup {} finished as {} in {} ms",
                result.backup.id, result.backup.status, result.duration_ms
            );
            print_json(&result.backup)
        } else {
            error!(
                "❌ Backup {} failed: {}",
                result.backup.id,
                result.error.as_deref().unwrap_or("unknown error")
            );
            print_json(&result)?;
            Err(anyhow::anyhow!("Backup {} failed", result.backup.id))
        }
    }

    pub async fn list_backups(
        &self,
        backup_type: Option<BackupType>,
        status: Option<BackupStatus>,
        retention_tier: Option<RetentionTier>,
        include_deleted: bool,
        limit: Option<usize>,
    ) -> Result<()> {
        let filter = BackupFilter {
            backup_type,
            status,
            retention_tier,
            include_deleted,
            limit,
        };
        let backups = self.container.backup_manager.list_backups(&filter).await?;

        if backups.is_empty() {
            info!("No backups found");
            return Ok(());
        }
        for backup in &backups {
            println!(
                "{}  {:<12} {:<11} {:<8} {:>12} bytes  {}  expires {}",
                backup.id,
                backup.status,
                backup.backup_type,
                backup.retention_tier,
                backup.stored_size_bytes,
                backup.created_at.format("%Y-%m-%d %H:%M:%S"),
                backup.expires_at.format("%Y-%m-%d"),
            );
        }
        info!("📊 {} backups listed", backups.len());
        Ok(())
    }

    pub async fn show_backup(&self, id: Uuid) -> Result<()> {
        match self.container.backup_manager.get_backup(id).await? {
            Some(backup) => print_json(&backup),
            None => Err(anyhow::anyhow!("Backup {} not found", id)),
        }
    }

    pub async fn delete_backup(&self, id: Uuid) -> Result<()> {
        if self.container.backup_manager.delete_backup(id).await? {
            info!("🗑️  Backup {} deleted", id);
        } else {
            warn!("Backup {} not found or already deleted", id);
        }
        Ok(())
    }

    pub async fn verify(&self, id: Option<Uuid>, options: VerifyOptions) -> Result<()> {
        let reports = match id {
            Some(id) => vec![self.container.verifier.verify_backup(id, &options).await?],
            None => self.container.verifier.verify_all(&options).await?,
        };

        let invalid: Vec<_> = reports.iter().filter(|r| !r.is_valid).collect();
        for report in &reports {
            if report.is_valid {
                info!("✅ Backup {} verified", report.backup_id);
            } else {
                error!(
                    "❌ Backup {} failed verification: {}",
                    report.backup_id,
                    report.errors.join("; ")
                );
            }
        }
        print_json(&reports)?;

        if invalid.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "{} of {} backups failed verification",
                invalid.len(),
                reports.len()
            ))
        }
    }

    pub async fn cleanup(&self) -> Result<()> {
        let report = self.container.backup_manager.cleanup_expired_backups().await?;
        info!(
            "🧹 Cleanup removed {} backups and freed {} bytes",
            report.deleted, report.bytes_freed
        );
        for failure in &report.failures {
            warn!("Could not delete {}: {}", failure.backup_id, failure.error);
        }
        print_json(&report)
    }

    pub async fn statistics(&self) -> Result<()> {
        let stats = self.container.backup_manager.get_backup_statistics().await?;
        for alert in &stats.alerts {
            warn!("⚠️  {:?}", alert);
        }
        print_json(&stats)
    }

    pub async fn replication_status(&self) -> Result<()> {
        let status = self.container.backup_manager.replication_status().await?;
        print_json(&status)
    }
}

/// Arguments for `restore`
#[derive(Debug, Clone, Default)]
pub struct RestoreArgs {
    pub backup_id: Option<Uuid>,
    pub target_database: Option<String>,
    pub point_in_time: Option<DateTime<Utc>>,
    pub target_directory: Option<PathBuf>,
    pub no_create: bool,
    pub skip_verify: bool,
    pub from_replica: bool,
    pub timeout_seconds: Option<u64>,
}

pub struct RecoveryCommandHandler {
    container: Arc<DependencyContainer>,
}

impl RecoveryCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn restore(&self, args: &RestoreArgs) -> Result<()> {
        let options = RestoreOptions {
            backup_id: args.backup_id,
            target_database: args.target_database.clone(),
            point_in_time: args.point_in_time,
            target_directory: args.target_directory.clone(),
            create_target: !args.no_create,
            verify_after_restore: !args.skip_verify,
            from_replica: args.from_replica,
        };

        let engine = &self.container.recovery_engine;
        let result = match args.timeout_seconds {
            Some(secs) => {
                engine
                    .restore_with_timeout(options, Duration::from_secs(secs))
                    .await?
            }
            None => engine.restore(options).await?,
        };

        print_json(&result)?;
        if result.success {
            info!(
                "✅ Restore finished in {} ms ({} tables, {} WAL segments)",
                result.duration_ms, result.tables_restored, result.wal_replayed
            );
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "Restore failed: {}",
                result.errors.join("; ")
            ))
        }
    }
}

pub struct DrillCommandHandler {
    container: Arc<DependencyContainer>,
}

impl DrillCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn run_drills(&self) -> Result<()> {
        let report = self.container.disaster_recovery.run_drills().await?;
        info!(
            "🧪 Recovery drills: {} passed, {} failed",
            report.passed, report.failed
        );
        for recommendation in &report.recommendations {
            info!("💡 {}", recommendation);
        }
        print_json(&report)?;
        if report.failed > 0 {
            return Err(anyhow::anyhow!("{} recovery drills failed", report.failed));
        }
        Ok(())
    }

    /// Schedule one drill and run it straight away
    pub async fn run_test(&self, scenario: DrillScenario, backup_id: Option<Uuid>) -> Result<()> {
        let dr = &self.container.disaster_recovery;
        let scheduled = dr.schedule_recovery_test(scenario, backup_id).await?;
        let test = dr.run_recovery_test(scheduled.id).await?;
        print_json(&test)?;
        match &test.error_message {
            None => {
                info!("✅ Recovery test {} passed", test.id);
                Ok(())
            }
            Some(message) => Err(anyhow::anyhow!(
                "Recovery test {} failed: {}",
                test.id,
                message
            )),
        }
    }

    pub async fn list_tests(&self, limit: usize) -> Result<()> {
        let report = self.container.disaster_recovery.report(limit).await?;
        print_json(&report)
    }
}

/// `archive_command` entry point; needs only the archive directory
pub async fn archive_wal_segment(config: &Config, source: &Path, name: &str) -> Result<()> {
    let archiver = WalArchiver::new(config.backup.wal_archive_directory.clone());
    archiver
        .initialize()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to prepare WAL archive: {}", e))?;
    let segment = archiver
        .archive_segment(source, name)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to archive {}: {}", name, e))?;
    info!(
        "Archived WAL segment {} ({} bytes)",
        segment.name, segment.size_bytes
    );
    Ok(())
}

pub struct HealthCommandHandler {
    config: Config,
}

impl HealthCommandHandler {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run_health_check(&self, detailed: bool) -> Result<()> {
        let setup = SetupManager::new(self.config.clone());
        let report = setup.run_health_checks().await;
        if detailed {
            print_json(&report)?;
        }
        if report.is_healthy() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "Some health checks failed. Please address the issues above."
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_args_fall_back_to_config() {
        let mut config = Config::default();
        config.backup.encrypt = true;
        config.cloud.enabled = true;
        config.cloud.cross_region_replication = true;

        let options = CreateBackupArgs::default().resolve(&config);
        assert!(options.encrypt);
        assert!(options.upload_to_cloud);
        assert!(options.cross_region_replication);
        assert_eq!(options.backup_type, BackupType::Full);

        let args = CreateBackupArgs {
            upload: Some(false),
            backup_type: Some(BackupType::Snapshot),
            ..Default::default()
        };
        let options = args.resolve(&config);
        assert!(!options.upload_to_cloud);
        assert!(!options.cross_region_replication);
        assert_eq!(options.backup_type, BackupType::Snapshot);
    }
}
