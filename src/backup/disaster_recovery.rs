use super::recovery::remove_workspace;
use super::{
    BackupConfig, BackupError, BackupRecord, BackupRepository, BackupType, Clock, ConstraintStatus,
    RecoveryEngine, RecoveryResult, RestoreOptions, Result, SystemClock, TableRowCount,
    PITR_BASE_TYPES,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DrillScenario {
    Full,
    Incremental,
    PointInTime,
}

impl DrillScenario {
    pub const ALL: [DrillScenario; 3] = [Self::Full, Self::Incremental, Self::PointInTime];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::PointInTime => "point_in_time",
        }
    }

    /// Backup types a drill of this kind restores from.
    fn source_types(&self) -> &'static [BackupType] {
        match self {
            Self::Full => &[BackupType::Full],
            Self::PointInTime => &PITR_BASE_TYPES,
            Self::Incremental => &[BackupType::Incremental],
        }
    }
}

impl fmt::Display for DrillScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DrillScenario {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            "point_in_time" | "pitr" => Ok(Self::PointInTime),
            other => Err(BackupError::config(format!("Unknown drill scenario: {other}"))),
        }
    }
}

/// A scalar query run against a drill's restored database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationQuery {
    pub name: String,
    pub sql: String,

    /// Required value of the first column; `None` only requires a row
    pub expected: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrillScenarioConfig {
    pub scenario: DrillScenario,
    pub rto_minutes: u32,
    pub rpo_minutes: u32,
    pub verification_queries: Vec<VerificationQuery>,
}

impl DrillScenarioConfig {
    /// One config per scenario with the configured objectives and a
    /// connectivity query.
    pub fn defaults(config: &BackupConfig) -> Vec<Self> {
        DrillScenario::ALL
            .into_iter()
            .map(|scenario| Self {
                scenario,
                rto_minutes: config.rto_minutes,
                rpo_minutes: config.rpo_minutes,
                verification_queries: vec![VerificationQuery {
                    name: "connectivity".to_string(),
                    sql: "SELECT 1".to_string(),
                    expected: Some("1".to_string()),
                }],
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecoveryTestStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

impl RecoveryTestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed)
    }
}

impl fmt::Display for RecoveryTestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryCheck {
    pub name: String,
    pub passed: bool,
    pub value: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryTestResults {
    pub tables: Vec<TableRowCount>,
    pub constraints: Vec<ConstraintStatus>,
    pub queries: Vec<QueryCheck>,
}

impl RecoveryTestResults {
    fn all_passed(&self) -> bool {
        self.constraints.iter().all(|c| c.valid) && self.queries.iter().all(|q| q.passed)
    }
}

/// One disaster-recovery drill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryTestRecord {
    pub id: Uuid,
    pub backup_id: Option<Uuid>,
    pub scenario: DrillScenario,
    pub status: RecoveryTestStatus,
    pub duration_ms: Option<u64>,
    pub integrity_check_passed: bool,
    pub checksum_verified: bool,
    pub results: RecoveryTestResults,
    pub rto_target_minutes: u32,
    pub rpo_target_minutes: u32,
    pub rto_met: Option<bool>,
    pub rpo_met: Option<bool>,

    /// Age of the restored backup when the drill started
    pub backup_age_minutes: Option<i64>,
    pub wal_replayed: usize,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RecoveryTestRecord {
    pub fn new(
        scenario: &DrillScenarioConfig,
        backup_id: Option<Uuid>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            backup_id,
            scenario: scenario.scenario,
            status: RecoveryTestStatus::Pending,
            duration_ms: None,
            integrity_check_passed: false,
            checksum_verified: false,
            results: RecoveryTestResults::default(),
            rto_target_minutes: scenario.rto_minutes,
            rpo_target_minutes: scenario.rpo_minutes,
            rto_met: None,
            rpo_met: None,
            backup_age_minutes: None,
            wal_replayed: 0,
            error_message: None,
            created_at,
            completed_at: None,
        }
    }

    fn fail(&mut self, message: String, at: DateTime<Utc>) {
        self.status = RecoveryTestStatus::Failed;
        self.error_message = Some(message);
        self.completed_at = Some(at);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrillReport {
    pub generated_at: DateTime<Utc>,
    pub tests: Vec<RecoveryTestRecord>,
    pub passed: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub mean_recovery_time_ms: Option<f64>,
    pub recommendations: Vec<String>,
}

impl DrillReport {
    pub fn from_tests(tests: Vec<RecoveryTestRecord>, generated_at: DateTime<Utc>) -> Self {
        let passed = tests
            .iter()
            .filter(|t| t.status == RecoveryTestStatus::Passed)
            .count();
        let failed = tests
            .iter()
            .filter(|t| t.status == RecoveryTestStatus::Failed)
            .count();
        let finished = passed + failed;
        let success_rate = if finished == 0 {
            0.0
        } else {
            passed as f64 / finished as f64
        };

        let durations: Vec<u64> = tests
            .iter()
            .filter(|t| t.integrity_check_passed)
            .filter_map(|t| t.duration_ms)
            .collect();
        let mean_recovery_time_ms = (!durations.is_empty())
            .then(|| durations.iter().sum::<u64>() as f64 / durations.len() as f64);

        let recommendations = recommendations(&tests);
        Self {
            generated_at,
            tests,
            passed,
            failed,
            success_rate,
            mean_recovery_time_ms,
            recommendations,
        }
    }
}

fn recommendations(tests: &[RecoveryTestRecord]) -> Vec<String> {
    let mut out = Vec::new();
    for test in tests {
        if test.backup_id.is_none() {
            out.push(format!(
                "No eligible backup for the {} drill; schedule backups of that type",
                test.scenario
            ));
            continue;
        }
        if test.status == RecoveryTestStatus::Failed && !test.integrity_check_passed {
            out.push(format!(
                "{} drill could not restore its backup ({}); verify the backup and the restore tooling",
                test.scenario,
                test.error_message.as_deref().unwrap_or("unknown error")
            ));
        }
        if test.rto_met == Some(false) {
            out.push(format!(
                "{} recovery time exceeds the {} minute target; investigate restore performance",
                test.scenario, test.rto_target_minutes
            ));
        }
        if test.rpo_met == Some(false) {
            out.push(format!(
                "Newest {} backup is {} minutes old, beyond the {} minute recovery point objective; back up more often",
                test.scenario,
                test.backup_age_minutes.unwrap_or_default(),
                test.rpo_target_minutes
            ));
        }
        if !test.results.all_passed() {
            out.push(format!(
                "{} drill verification queries or constraints failed; inspect the restored data",
                test.scenario
            ));
        }
    }
    if out.is_empty() && !tests.is_empty() {
        out.push("All recovery drills met their objectives".to_string());
    }
    out
}

/// Schedules and runs recovery drills and scores them against RTO and RPO.
#[derive(Debug, Clone)]
pub struct DisasterRecoveryManager {
    config: BackupConfig,
    repository: Arc<dyn BackupRepository>,
    recovery: Arc<RecoveryEngine>,
    scenarios: Vec<DrillScenarioConfig>,
    clock: Arc<dyn Clock>,
}

impl DisasterRecoveryManager {
    pub fn new(
        config: BackupConfig,
        repository: Arc<dyn BackupRepository>,
        recovery: Arc<RecoveryEngine>,
    ) -> Self {
        let scenarios = DrillScenarioConfig::defaults(&config);
        Self {
            config,
            repository,
            recovery,
            scenarios,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_scenarios(mut self, scenarios: Vec<DrillScenarioConfig>) -> Self {
        self.scenarios = scenarios;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run every configured scenario once and report on the lot.
    #[instrument(skip(self))]
    pub async fn run_drills(&self) -> Result<DrillReport> {
        info!("Starting disaster recovery drills: {} scenarios", self.scenarios.len());

        let mut tests = Vec::with_capacity(self.scenarios.len());
        for scenario in &self.scenarios {
            let backup = self.select_backup(scenario.scenario).await?;
            let mut test =
                RecoveryTestRecord::new(scenario, backup.as_ref().map(|b| b.id), self.clock.now());
            self.repository.insert_recovery_test(&test).await?;
            self.execute(&mut test, scenario, backup).await?;
            tests.push(test);
        }

        let report = DrillReport::from_tests(tests, self.clock.now());
        info!(
            "Disaster recovery drills completed: {} passed, {} failed",
            report.passed, report.failed
        );
        for recommendation in &report.recommendations {
            info!("Recommendation: {}", recommendation);
        }
        Ok(report)
    }

    /// Record a drill to run later. Without a backup id the newest eligible
    /// backup is picked when the drill runs.
    pub async fn schedule_recovery_test(
        &self,
        scenario: DrillScenario,
        backup_id: Option<Uuid>,
    ) -> Result<RecoveryTestRecord> {
        if let Some(id) = backup_id {
            if self.repository.get_backup(id).await?.is_none() {
                return Err(BackupError::not_found(format!("backup {id}")));
            }
        }
        let config = self.scenario_config(scenario);
        let test = RecoveryTestRecord::new(&config, backup_id, self.clock.now());
        self.repository.insert_recovery_test(&test).await?;
        info!("Scheduled {} recovery test {}", scenario, test.id);
        Ok(test)
    }

    /// Execute a scheduled drill.
    #[instrument(skip(self))]
    pub async fn run_recovery_test(&self, test_id: Uuid) -> Result<RecoveryTestRecord> {
        let mut test = self
            .repository
            .get_recovery_test(test_id)
            .await?
            .ok_or_else(|| BackupError::not_found(format!("recovery test {test_id}")))?;
        if test.status != RecoveryTestStatus::Pending {
            return Err(BackupError::config(format!(
                "Recovery test {} is {} and cannot be run again",
                test_id, test.status
            )));
        }

        let config = self.scenario_config(test.scenario);
        let backup = match test.backup_id {
            Some(id) => self
                .repository
                .get_backup(id)
                .await?
                .filter(|b| b.status.is_success()),
            None => self.select_backup(test.scenario).await?,
        };
        if test.backup_id.is_none() {
            test.backup_id = backup.as_ref().map(|b| b.id);
        }
        self.execute(&mut test, &config, backup).await?;
        Ok(test)
    }

    pub async fn list_recovery_tests(&self, limit: usize) -> Result<Vec<RecoveryTestRecord>> {
        self.repository.list_recovery_tests(limit).await
    }

    pub async fn get_recovery_test(&self, id: Uuid) -> Result<Option<RecoveryTestRecord>> {
        self.repository.get_recovery_test(id).await
    }

    /// Report over the most recent drills.
    pub async fn report(&self, limit: usize) -> Result<DrillReport> {
        let tests = self.repository.list_recovery_tests(limit).await?;
        Ok(DrillReport::from_tests(tests, self.clock.now()))
    }

    fn scenario_config(&self, scenario: DrillScenario) -> DrillScenarioConfig {
        self.scenarios
            .iter()
            .find(|c| c.scenario == scenario)
            .cloned()
            .unwrap_or_else(|| DrillScenarioConfig {
                scenario,
                rto_minutes: self.config.rto_minutes,
                rpo_minutes: self.config.rpo_minutes,
                verification_queries: Vec::new(),
            })
    }

    async fn select_backup(&self, scenario: DrillScenario) -> Result<Option<BackupRecord>> {
        self.repository
            .latest_successful_before(self.clock.now(), scenario.source_types())
            .await
    }

    async fn execute(
        &self,
        test: &mut RecoveryTestRecord,
        scenario: &DrillScenarioConfig,
        backup: Option<BackupRecord>,
    ) -> Result<()> {
        let Some(backup) = backup else {
            warn!("No eligible backup for {} drill {}", scenario.scenario, test.id);
            test.fail(
                format!("No eligible backup for the {} drill", scenario.scenario),
                self.clock.now(),
            );
            self.repository.update_recovery_test(test).await?;
            return Ok(());
        };

        test.status = RecoveryTestStatus::Running;
        self.repository.update_recovery_test(test).await?;

        let drill_started_at = self.clock.now();
        let age_minutes = (drill_started_at - backup.created_at).num_minutes();
        test.backup_age_minutes = Some(age_minutes);
        test.rpo_met = Some(age_minutes <= scenario.rpo_minutes as i64);

        info!(
            "Running {} drill {} against backup {} ({} minutes old)",
            scenario.scenario, test.id, backup.id, age_minutes
        );

        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.test_recovery_timeout_secs);
        let database = format!("drtest_{}", test.id.simple());
        let scratch = self.recovery.workspace("drills");

        let options = match scenario.scenario {
            DrillScenario::PointInTime => RestoreOptions {
                target_directory: Some(scratch.clone()),
                point_in_time: Some(drill_started_at),
                ..RestoreOptions::full(backup.id)
            },
            DrillScenario::Full | DrillScenario::Incremental => RestoreOptions {
                target_database: Some(database.clone()),
                verify_after_restore: false,
                ..RestoreOptions::full(backup.id)
            },
        };
        let restored = self.recovery.restore_with_timeout(options, timeout).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        test.duration_ms = Some(duration_ms);
        test.rto_met = Some(duration_ms <= scenario.rto_minutes as u64 * 60_000);

        let mut problems = Vec::new();
        match restored {
            Ok(result) => self.score_restore(test, scenario, &backup, &result, &database, &mut problems).await,
            Err(e) => problems.push(e.to_string()),
        }

        match scenario.scenario {
            DrillScenario::PointInTime => remove_workspace(&scratch).await,
            _ => {
                if let Err(e) = self.recovery.drop_database(&database).await {
                    warn!("Failed to drop drill database {}: {}", database, e);
                }
            }
        }

        if test.rto_met == Some(false) {
            problems.push(format!(
                "recovery took {}ms, over the {} minute target",
                duration_ms, scenario.rto_minutes
            ));
        }
        if test.rpo_met == Some(false) {
            problems.push(format!(
                "backup is {} minutes old, over the {} minute objective",
                age_minutes, scenario.rpo_minutes
            ));
        }

        test.completed_at = Some(self.clock.now());
        if problems.is_empty() {
            test.status = RecoveryTestStatus::Passed;
            info!("{} drill {} passed in {}ms", scenario.scenario, test.id, duration_ms);
        } else {
            test.status = RecoveryTestStatus::Failed;
            test.error_message = Some(problems.join("; "));
            error!("{} drill {} failed: {}", scenario.scenario, test.id, problems.join("; "));
        }
        self.repository.update_recovery_test(test).await?;
        Ok(())
    }

    async fn score_restore(
        &self,
        test: &mut RecoveryTestRecord,
        scenario: &DrillScenarioConfig,
        backup: &BackupRecord,
        result: &RecoveryResult,
        database: &str,
        problems: &mut Vec<String>,
    ) {
        if !result.success {
            problems.extend(result.errors.iter().cloned());
            return;
        }
        test.integrity_check_passed = true;
        // a successful restore has passed the plaintext checksum guard
        test.checksum_verified = backup.checksum_sha256.is_some();
        test.wal_replayed = result.wal_replayed;
        problems.extend(result.errors.iter().cloned());

        if scenario.scenario == DrillScenario::PointInTime {
            return;
        }
        let Some(inspector) = self.recovery.inspector() else {
            debug!("No database inspector configured, skipping drill queries");
            return;
        };

        let connection = self.config.connection.with_database(database);
        match inspector.table_row_counts(&connection).await {
            Ok(tables) => test.results.tables = tables,
            Err(e) => problems.push(format!("row counts failed: {e}")),
        }
        match inspector.validate_constraints(&connection).await {
            Ok(constraints) => {
                for invalid in constraints.iter().filter(|c| !c.valid) {
                    problems.push(format!(
                        "constraint {} on {} is not valid",
                        invalid.name, invalid.table
                    ));
                }
                test.results.constraints = constraints;
            }
            Err(e) => problems.push(format!("constraint validation failed: {e}")),
        }
        for query in &scenario.verification_queries {
            let check = match inspector.query_scalar(&connection, &query.sql).await {
                Ok(value) => {
                    let passed = match (&query.expected, &value) {
                        (Some(expected), Some(actual)) => expected == actual,
                        (None, Some(_)) => true,
                        (_, None) => false,
                    };
                    QueryCheck {
                        name: query.name.clone(),
                        passed,
                        value,
                        error: None,
                    }
                }
                Err(e) => QueryCheck {
                    name: query.name.clone(),
                    passed: false,
                    value: None,
                    error: Some(e.to_string()),
                },
            };
            if !check.passed {
                problems.push(format!("verification query {} failed", check.name));
            }
            test.results.queries.push(check);
        }
    }
}
