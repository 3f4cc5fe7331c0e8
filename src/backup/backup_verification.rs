use super::artifact::{self, DumpMarkers};
use super::recovery::remove_workspace;
use super::{
    BackupError, BackupFilter, BackupRecord, BackupRepository, BackupStatus, Clock, RecoveryEngine,
    RestoreOptions, Result, SystemClock,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Which checks to run. Every check is on unless switched off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOptions {
    pub checksum: bool,
    pub integrity: bool,
    pub structure: bool,
    pub data: bool,
    pub test_recovery: bool,
    pub test_recovery_timeout_secs: u64,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            checksum: true,
            integrity: true,
            structure: true,
            data: true,
            test_recovery: true,
            test_recovery_timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub passed: bool,

    /// Nothing to compare against; counts as a pass
    pub skipped: bool,
    pub detail: Option<String>,
}

impl CheckOutcome {
    fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            skipped: false,
            detail: Some(detail.into()),
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            skipped: false,
            detail: Some(detail.into()),
        }
    }

    fn skip(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            skipped: true,
            detail: Some(detail.into()),
        }
    }
}

/// Per-check results; `None` means the check was not requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationChecks {
    pub checksum: Option<CheckOutcome>,
    pub integrity: Option<CheckOutcome>,
    pub structure: Option<CheckOutcome>,
    pub data: Option<CheckOutcome>,
    pub test_recovery: Option<CheckOutcome>,
}

impl VerificationChecks {
    fn named(&self) -> [(&'static str, Option<&CheckOutcome>); 5] {
        [
            ("checksum", self.checksum.as_ref()),
            ("integrity", self.integrity.as_ref()),
            ("structure", self.structure.as_ref()),
            ("data", self.data.as_ref()),
            ("test recovery", self.test_recovery.as_ref()),
        ]
    }

    pub fn all_passed(&self) -> bool {
        self.named()
            .iter()
            .all(|(_, outcome)| outcome.map_or(true, |o| o.passed))
    }

    /// Names of the failing checks, in check order.
    pub fn failed(&self) -> Vec<&'static str> {
        self.named()
            .iter()
            .filter(|(_, outcome)| outcome.is_some_and(|o| !o.passed))
            .map(|(name, _)| *name)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub backup_id: Uuid,
    pub is_valid: bool,
    pub checks: VerificationChecks,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationStats {
    pub total_verifications: u64,
    pub successful_verifications: u64,
    pub failed_verifications: u64,
    pub last_verification_time: Option<DateTime<Utc>>,
    pub average_verification_duration_ms: f64,
}

/// Checks a recorded backup and records the verdict on it.
#[derive(Debug, Clone)]
pub struct BackupVerifier {
    repository: Arc<dyn BackupRepository>,
    recovery: Arc<RecoveryEngine>,
    clock: Arc<dyn Clock>,
    verification_stats: Arc<RwLock<VerificationStats>>,
}

impl BackupVerifier {
    pub fn new(repository: Arc<dyn BackupRepository>, recovery: Arc<RecoveryEngine>) -> Self {
        Self {
            repository,
            recovery,
            clock: Arc::new(SystemClock),
            verification_stats: Arc::new(RwLock::new(VerificationStats::default())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run the requested checks against one backup.
    ///
    /// `is_valid` is the AND of the requested checks. The record is moved to
    /// `Verified` or `Failed` and `verified_at` is stamped, except for
    /// deleted or unfinished backups, which are reported invalid untouched.
    #[instrument(skip(self, options))]
    pub async fn verify_backup(&self, id: Uuid, options: &VerifyOptions) -> Result<VerificationReport> {
        let started = Instant::now();
        let mut record = self
            .repository
            .get_backup(id)
            .await?
            .ok_or_else(|| BackupError::not_found(format!("backup {id}")))?;

        info!("Starting verification for backup: {}", id);

        if matches!(
            record.status,
            BackupStatus::Deleted | BackupStatus::Pending | BackupStatus::InProgress
        ) {
            warn!("Backup {} is {}, not verifying", id, record.status);
            return Ok(VerificationReport {
                backup_id: id,
                is_valid: false,
                checks: VerificationChecks::default(),
                errors: vec![format!("Backup {} is {} and cannot be verified", id, record.status)],
                duration_ms: started.elapsed().as_millis() as u64,
                verified_at: self.clock.now(),
            });
        }

        let workspace = self.recovery.workspace("verification");
        fs::create_dir_all(&workspace).await?;
        let checks = self.run_checks(&record, options, &workspace).await;
        remove_workspace(&workspace).await;

        let errors: Vec<String> = checks
            .named()
            .iter()
            .filter_map(|(name, outcome)| match outcome {
                Some(o) if !o.passed => Some(format!(
                    "{} check failed: {}",
                    name,
                    o.detail.as_deref().unwrap_or("no detail")
                )),
                _ => None,
            })
            .collect();
        let is_valid = checks.all_passed();
        let verified_at = self.clock.now();

        record.verified_at = Some(verified_at);
        if is_valid {
            if record.status.can_transition_to(BackupStatus::Verified) {
                record.transition(BackupStatus::Verified)?;
            } else {
                warn!(
                    "Backup {} passed verification but stays {}",
                    id, record.status
                );
            }
        } else {
            record.mark_verification_failed(&errors.join("; "))?;
        }
        self.repository.update_backup(&record).await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        self.record_stats(is_valid, duration_ms, verified_at).await;

        if is_valid {
            info!("Backup {} verified in {}ms", id, duration_ms);
        } else {
            error!("Backup {} failed verification: {:?}", id, checks.failed());
        }

        Ok(VerificationReport {
            backup_id: id,
            is_valid,
            checks,
            errors,
            duration_ms,
            verified_at,
        })
    }

    /// Verify every backup in the success family. A backup that cannot be
    /// loaded is logged and skipped.
    pub async fn verify_all(&self, options: &VerifyOptions) -> Result<Vec<VerificationReport>> {
        let candidates: Vec<BackupRecord> = self
            .repository
            .list_backups(&BackupFilter::default())
            .await?
            .into_iter()
            .filter(|r| r.status.is_success())
            .collect();
        info!("Verifying {} backups", candidates.len());

        let mut reports = Vec::with_capacity(candidates.len());
        for backup in candidates {
            match self.verify_backup(backup.id, options).await {
                Ok(report) => reports.push(report),
                Err(e) => error!("Verification of backup {} errored: {}", backup.id, e),
            }
        }

        let valid = reports.iter().filter(|r| r.is_valid).count();
        info!(
            "Verification sweep completed: {}/{} valid",
            valid,
            reports.len()
        );
        Ok(reports)
    }

    pub async fn get_verification_stats(&self) -> VerificationStats {
        self.verification_stats.read().await.clone()
    }

    async fn run_checks(
        &self,
        record: &BackupRecord,
        options: &VerifyOptions,
        workspace: &Path,
    ) -> VerificationChecks {
        let mut checks = VerificationChecks::default();
        let needs_artifact = options.checksum || options.integrity || options.structure || options.data;

        if needs_artifact {
            match self
                .recovery
                .materialize_plaintext(record, workspace, false)
                .await
            {
                Ok(plaintext) => {
                    self.artifact_checks(record, options, &plaintext, &mut checks)
                        .await
                }
                Err(e) => {
                    debug!("Artifact of {} unavailable: {}", record.id, e);
                    let unavailable = CheckOutcome::fail(format!("artifact unavailable: {e}"));
                    let requested = |on: bool| on.then(|| unavailable.clone());
                    checks.checksum = requested(options.checksum);
                    checks.integrity = requested(options.integrity);
                    checks.structure = requested(options.structure);
                    checks.data = requested(options.data);
                }
            }
        }

        if options.test_recovery {
            let timeout = Duration::from_secs(options.test_recovery_timeout_secs);
            checks.test_recovery = Some(self.test_recovery(record, timeout).await);
        }
        checks
    }

    async fn artifact_checks(
        &self,
        record: &BackupRecord,
        options: &VerifyOptions,
        plaintext: &Path,
        checks: &mut VerificationChecks,
    ) {
        if options.checksum {
            checks.checksum = Some(match &record.checksum_sha256 {
                None => CheckOutcome::skip("no stored checksum"),
                Some(expected) => match artifact::sha256_file(plaintext).await {
                    Ok(actual) if &actual == expected => CheckOutcome::pass("sha256 matches"),
                    Ok(actual) => CheckOutcome::fail(format!(
                        "sha256 mismatch: expected {expected}, got {actual}"
                    )),
                    Err(e) => CheckOutcome::fail(e.to_string()),
                },
            });
        }

        if options.integrity {
            checks.integrity = Some(integrity_check(plaintext).await);
        }

        if (options.structure || options.data) && record.is_physical() {
            self.archive_checks(options, plaintext, checks).await;
        } else if options.structure || options.data {
            let markers: std::result::Result<DumpMarkers, String> = artifact::scan_markers(plaintext)
                .await
                .map_err(|e| e.to_string());

            if options.structure {
                checks.structure = Some(match &markers {
                    Ok(m) if m.has_schema() => CheckOutcome::pass(format!(
                        "{} tables, {} sequences, {} indexes",
                        m.tables, m.sequences, m.indexes
                    )),
                    Ok(_) => CheckOutcome::fail("no table definitions found"),
                    Err(e) => CheckOutcome::fail(e.clone()),
                });
            }
            if options.data {
                checks.data = Some(match &markers {
                    Ok(m) if m.has_data() => {
                        CheckOutcome::pass(format!("{} data statements", m.data_statements))
                    }
                    Ok(_) => CheckOutcome::fail("no COPY or INSERT statements found"),
                    Err(e) => CheckOutcome::fail(e.clone()),
                });
            }
        }
    }

    /// Snapshots carry a data directory instead of SQL statements.
    async fn archive_checks(
        &self,
        options: &VerifyOptions,
        archive: &Path,
        checks: &mut VerificationChecks,
    ) {
        let summary = artifact::scan_archive(archive)
            .await
            .map_err(|e| e.to_string());

        if options.structure {
            checks.structure = Some(match &summary {
                Ok(s) if s.has_pg_version => CheckOutcome::pass(format!("{} archive entries", s.entries)),
                Ok(_) => CheckOutcome::fail("archive holds no PG_VERSION"),
                Err(e) => CheckOutcome::fail(e.clone()),
            });
        }
        if options.data {
            checks.data = Some(match &summary {
                Ok(s) if s.relation_files > 0 => {
                    CheckOutcome::pass(format!("{} relation files", s.relation_files))
                }
                Ok(_) => CheckOutcome::fail("archive holds no relation files under base/"),
                Err(e) => CheckOutcome::fail(e.clone()),
            });
        }
    }

    /// Restore into a throwaway database, then drop it. Snapshots are
    /// unpacked into a throwaway data directory instead.
    async fn test_recovery(&self, record: &BackupRecord, timeout: Duration) -> CheckOutcome {
        if record.is_physical() {
            return self.test_snapshot_recovery(record, timeout).await;
        }

        let database = format!(
            "verify_{}_{}",
            &record.id.simple().to_string()[..8],
            self.clock.now().format("%Y%m%d%H%M%S")
        );
        let options = RestoreOptions {
            target_database: Some(database.clone()),
            ..RestoreOptions::full(record.id)
        };

        let outcome = match self.recovery.restore_with_timeout(options, timeout).await {
            Ok(result) if result.success => CheckOutcome::pass(format!(
                "restored {} tables in {}ms",
                result.tables_restored, result.duration_ms
            )),
            Ok(result) => CheckOutcome::fail(result.errors.join("; ")),
            Err(e) => CheckOutcome::fail(e.to_string()),
        };

        if let Err(e) = self.recovery.drop_database(&database).await {
            warn!("Failed to drop verification database {}: {}", database, e);
        }
        outcome
    }

    async fn test_snapshot_recovery(&self, record: &BackupRecord, timeout: Duration) -> CheckOutcome {
        let data_directory = self.recovery.workspace("verification-data");
        let options = RestoreOptions {
            target_directory: Some(data_directory.clone()),
            point_in_time: Some(record.created_at),
            ..RestoreOptions::full(record.id)
        };

        let outcome = match self.recovery.restore_with_timeout(options, timeout).await {
            Ok(result) if result.success && result.errors.is_empty() => {
                CheckOutcome::pass(format!("unpacked data directory in {}ms", result.duration_ms))
            }
            Ok(result) => CheckOutcome::fail(result.errors.join("; ")),
            Err(e) => CheckOutcome::fail(e.to_string()),
        };
        remove_workspace(&data_directory).await;
        outcome
    }

    async fn record_stats(&self, valid: bool, duration_ms: u64, at: DateTime<Utc>) {
        let mut stats = self.verification_stats.write().await;
        let previous = stats.total_verifications as f64;
        stats.total_verifications += 1;
        if valid {
            stats.successful_verifications += 1;
        } else {
            stats.failed_verifications += 1;
        }
        stats.last_verification_time = Some(at);
        stats.average_verification_duration_ms = (stats.average_verification_duration_ms
            * previous
            + duration_ms as f64)
            / stats.total_verifications as f64;
    }
}

async fn integrity_check(plaintext: &Path) -> CheckOutcome {
    let size = match artifact::file_size(plaintext).await {
        Ok(size) => size,
        Err(e) => return CheckOutcome::fail(e.to_string()),
    };
    if size == 0 {
        return CheckOutcome::fail("artifact is empty");
    }
    match artifact::is_gzip(plaintext).await {
        Ok(true) => match artifact::probe_decompression(plaintext).await {
            Ok(expanded) => CheckOutcome::pass(format!("{size} bytes, {expanded} decompressed")),
            Err(e) => CheckOutcome::fail(e.to_string()),
        },
        Ok(false) => CheckOutcome::pass(format!("{size} bytes")),
        Err(e) => CheckOutcome::fail(e.to_string()),
    }
}
