//! Cron-driven triggers for the backup engines.
//!
//! Four independent jobs call into the core: backup creation, the
//! verification sweep, disaster-recovery drills and expired-backup cleanup.
//! A job that is still running when its next tick fires is skipped, never
//! queued. Failed runs are logged and left for the next tick; there is no
//! retry loop here.

use crate::backup::{
    BackupManager, BackupOptions, BackupVerifier, DisasterRecoveryManager, VerifyOptions,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Cron expressions use the six-field form with seconds first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub enabled: bool,

    /// Default: daily at 02:00
    pub backup_cron: String,

    /// Default: daily at 04:00
    pub verification_cron: String,

    /// Default: Sundays at 05:00
    pub drill_cron: String,

    /// Default: daily at 03:30
    pub cleanup_cron: String,

    pub backup_options: BackupOptions,
    pub verify_options: VerifyOptions,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backup_cron: "0 0 2 * * *".to_string(),
            verification_cron: "0 0 4 * * *".to_string(),
            drill_cron: "0 0 5 * * Sun".to_string(),
            cleanup_cron: "0 30 3 * * *".to_string(),
            backup_options: BackupOptions::default(),
            verify_options: VerifyOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduledJob {
    Backup,
    Verification,
    Drill,
    Cleanup,
}

impl ScheduledJob {
    pub const ALL: [ScheduledJob; 4] = [Self::Backup, Self::Verification, Self::Drill, Self::Cleanup];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Verification => "verification",
            Self::Drill => "drill",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for ScheduledJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStatistics {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,

    /// Ticks dropped because the previous run was still going
    pub skipped_runs: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunResult {
    pub run_id: Uuid,
    pub job: ScheduledJob,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub success: bool,
    pub skipped: bool,
    pub summary: String,
}

/// Everything a job body needs, cheap to clone into each cron closure.
#[derive(Debug, Clone)]
struct JobContext {
    backup_manager: Arc<BackupManager>,
    verifier: Arc<BackupVerifier>,
    disaster_recovery: Arc<DisasterRecoveryManager>,
    backup_options: BackupOptions,
    verify_options: VerifyOptions,
    running: Arc<Mutex<HashSet<ScheduledJob>>>,
    statistics: Arc<RwLock<HashMap<ScheduledJob, JobStatistics>>>,
}

impl JobContext {
    async fn execute(&self, job: ScheduledJob) -> JobRunResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = std::time::Instant::now();

        if !self.running.lock().await.insert(job) {
            warn!("{} job is already running, skipping this execution", job);
            self.statistics
                .write()
                .await
                .entry(job)
                .or_default()
                .skipped_runs += 1;
            return JobRunResult {
                run_id,
                job,
                started_at,
                duration_seconds: 0.0,
                success: false,
                skipped: true,
                summary: "previous run still in progress".to_string(),
            };
        }

        let outcome = self.dispatch(job).await;
        self.running.lock().await.remove(&job);

        let duration_seconds = started.elapsed().as_secs_f64();
        {
            let mut statistics = self.statistics.write().await;
            let stats = statistics.entry(job).or_default();
            stats.total_runs += 1;
            stats.last_run = Some(started_at);
            match &outcome {
                Ok(_) => {
                    stats.successful_runs += 1;
                    stats.last_error = None;
                }
                Err(e) => {
                    stats.failed_runs += 1;
                    stats.last_error = Some(e.to_string());
                }
            }
        }

        match outcome {
            Ok(summary) => {
                info!(run_id = %run_id, job = %job, duration_seconds, "{}", summary);
                JobRunResult {
                    run_id,
                    job,
                    started_at,
                    duration_seconds,
                    success: true,
                    skipped: false,
                    summary,
                }
            }
            Err(e) => {
                error!(run_id = %run_id, job = %job, "Scheduled {} job failed: {}", job, e);
                JobRunResult {
                    run_id,
                    job,
                    started_at,
                    duration_seconds,
                    success: false,
                    skipped: false,
                    summary: e.to_string(),
                }
            }
        }
    }

    async fn dispatch(&self, job: ScheduledJob) -> Result<String> {
        match job {
            ScheduledJob::Backup => {
                let result = self
                    .backup_manager
                    .create_backup(self.backup_options.clone())
                    .await?;
                if result.success {
                    Ok(format!(
                        "Backup {} finished as {}",
                        result.backup.id, result.backup.status
                    ))
                } else {
                    Err(anyhow::anyhow!(
                        "Backup {} failed: {}",
                        result.backup.id,
                        result.error.unwrap_or_default()
                    ))
                }
            }
            ScheduledJob::Verification => {
                let reports = self.verifier.verify_all(&self.verify_options).await?;
                let valid = reports.iter().filter(|r| r.is_valid).count();
                Ok(format!("{}/{} backups verified", valid, reports.len()))
            }
            ScheduledJob::Drill => {
                let report = self.disaster_recovery.run_drills().await?;
                Ok(format!(
                    "Recovery drills: {} passed, {} failed",
                    report.passed, report.failed
                ))
            }
            ScheduledJob::Cleanup => {
                let report = self.backup_manager.cleanup_expired_backups().await?;
                Ok(format!(
                    "Cleanup: {} backups deleted, {} bytes freed",
                    report.deleted, report.bytes_freed
                ))
            }
        }
    }
}

/// Owns the cron scheduler and the four backup jobs.
///
/// ```rust,no_run
/// # use codex_backup::scheduler::{BackupScheduler, ScheduleConfig};
/// # async fn run(scheduler: BackupScheduler) -> anyhow::Result<()> {
/// scheduler.start().await?;
/// tokio::signal::ctrl_c().await?;
/// scheduler.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct BackupScheduler {
    scheduler: Arc<Mutex<JobScheduler>>,
    config: ScheduleConfig,
    context: JobContext,
    job_ids: Mutex<Vec<Uuid>>,
}

impl BackupScheduler {
    /// # Errors
    ///
    /// Returns an error if the internal job scheduler cannot be initialized
    pub async fn new(
        config: ScheduleConfig,
        backup_manager: Arc<BackupManager>,
        verifier: Arc<BackupVerifier>,
        disaster_recovery: Arc<DisasterRecoveryManager>,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize job scheduler: {}", e))?;

        let context = JobContext {
            backup_manager,
            verifier,
            disaster_recovery,
            backup_options: config.backup_options.clone(),
            verify_options: config.verify_options.clone(),
            running: Arc::new(Mutex::new(HashSet::new())),
            statistics: Arc::new(RwLock::new(HashMap::new())),
        };

        Ok(Self {
            scheduler: Arc::new(Mutex::new(scheduler)),
            config,
            context,
            job_ids: Mutex::new(Vec::new()),
        })
    }

    /// Register the four jobs and start ticking.
    ///
    /// # Errors
    ///
    /// Returns an error if a cron expression is invalid or the scheduler
    /// refuses a job.
    #[instrument(skip(self), fields(enabled = self.config.enabled))]
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            info!("Scheduler is disabled in configuration, not starting");
            return Ok(());
        }

        for job in ScheduledJob::ALL {
            let cron = self.cron_for(job).to_string();
            let context = self.context.clone();
            let cron_job = Job::new_async(cron.as_str(), move |_uuid, mut _l| {
                let context = context.clone();
                Box::pin(async move {
                    context.execute(job).await;
                })
            })
            .map_err(|e| anyhow::anyhow!("Invalid cron expression for {} job '{}': {}", job, cron, e))?;

            let job_id = self
                .scheduler
                .lock()
                .await
                .add(cron_job)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to add {} job to scheduler: {}", job, e))?;
            self.job_ids.lock().await.push(job_id);
            info!(job = %job, cron = %cron, job_id = %job_id, "Scheduled job registered");
        }

        self.scheduler
            .lock()
            .await
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start job scheduler: {}", e))?;

        info!("Backup scheduler started successfully");
        Ok(())
    }

    /// Run one job now, outside its schedule. Overlap rules still apply.
    pub async fn run_now(&self, job: ScheduledJob) -> JobRunResult {
        info!("Triggering manual {} run", job);
        self.context.execute(job).await
    }

    pub async fn statistics(&self) -> HashMap<ScheduledJob, JobStatistics> {
        self.context.statistics.read().await.clone()
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down backup scheduler");
        self.scheduler
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to shut down job scheduler: {}", e))?;
        self.job_ids.lock().await.clear();
        Ok(())
    }

    fn cron_for(&self, job: ScheduledJob) -> &str {
        match job {
            ScheduledJob::Backup => &self.config.backup_cron,
            ScheduledJob::Verification => &self.config.verification_cron,
            ScheduledJob::Drill => &self.config.drill_cron,
            ScheduledJob::Cleanup => &self.config.cleanup_cron,
        }
    }
}

impl fmt::Debug for BackupScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupScheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
