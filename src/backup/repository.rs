use super::{
    BackupError, BackupRecord, BackupStatus, BackupType, RecoveryTestRecord, Result, RetentionTier,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Narrowing for `list_backups`. Deleted records are hidden unless asked for.
#[derive(Debug, Clone, Default)]
pub struct BackupFilter {
    pub backup_type: Option<BackupType>,
    pub status: Option<BackupStatus>,
    pub retention_tier: Option<RetentionTier>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
}

impl BackupFilter {
    fn matches(&self, record: &BackupRecord) -> bool {
        self.backup_type.map_or(true, |t| t == record.backup_type)
            && self.status.map_or(true, |s| s == record.status)
            && self.retention_tier.map_or(true, |t| t == record.retention_tier)
            && (self.include_deleted
                || self.status == Some(BackupStatus::Deleted)
                || record.status != BackupStatus::Deleted)
    }
}

/// Persistence for backup records and recovery tests.
#[async_trait]
pub trait BackupRepository: Send + Sync + std::fmt::Debug {
    async fn initialize(&self) -> Result<()>;
    async fn insert_backup(&self, record: &BackupRecord) -> Result<()>;
    async fn update_backup(&self, record: &BackupRecord) -> Result<()>;
    async fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>>;

    /// Newest first.
    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>>;

    /// Successful records whose `expires_at` is before `now`.
    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<BackupRecord>>;

    /// Newest successful record of one of `types` created at or before `at`.
    async fn latest_successful_before(
        &self,
        at: DateTime<Utc>,
        types: &[BackupType],
    ) -> Result<Option<BackupRecord>>;

    async fn insert_recovery_test(&self, test: &RecoveryTestRecord) -> Result<()>;
    async fn update_recovery_test(&self, test: &RecoveryTestRecord) -> Result<()>;
    async fn get_recovery_test(&self, id: Uuid) -> Result<Option<RecoveryTestRecord>>;

    /// Newest first.
    async fn list_recovery_tests(&self, limit: usize) -> Result<Vec<RecoveryTestRecord>>;
}

/// PostgreSQL implementation: filterable columns plus the full record as JSONB.
#[derive(Debug)]
pub struct PostgresBackupRepository {
    db_pool: Arc<PgPool>,
}

impl PostgresBackupRepository {
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self { db_pool }
    }

    fn status_strings(statuses: &[BackupStatus]) -> Vec<String> {
        statuses.iter().map(|s| s.as_str().to_string()).collect()
    }
}

#[async_trait]
impl BackupRepository for PostgresBackupRepository {
    async fn initialize(&self) -> Result<()> {
        debug!("Initializing backup record store");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backup_records (
                id UUID PRIMARY KEY,
                backup_type VARCHAR NOT NULL,
                status VARCHAR NOT NULL,
                retention_tier VARCHAR NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                record JSONB NOT NULL,
                updated_at TIMESTAMPTZ DEFAULT NOW()
            )
        "#,
        )
        .execute(self.db_pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_backup_records_status_expiry ON backup_records (status, expires_at)",
        )
        .execute(self.db_pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_backup_records_created ON backup_records (created_at DESC)",
        )
        .execute(self.db_pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recovery_tests (
                id UUID PRIMARY KEY,
                backup_id UUID,
                status VARCHAR NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                record JSONB NOT NULL
            )
        "#,
        )
        .execute(self.db_pool.as_ref())
        .await?;

        debug!("Backup record store initialized");
        Ok(())
    }

    async fn insert_backup(&self, record: &BackupRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_records (
                id, backup_type, status, retention_tier, created_at, expires_at, record
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
        )
        .bind(record.id)
        .bind(record.backup_type.as_str())
        .bind(record.status.as_str())
        .bind(record.retention_tier.as_str())
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(Json(record))
        .execute(self.db_pool.as_ref())
        .await?;

        Ok(())
    }

    async fn update_backup(&self, record: &BackupRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE backup_records SET
                status = $2, retention_tier = $3, expires_at = $4,
                record = $5, updated_at = NOW()
            WHERE id = $1
        "#,
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(record.retention_tier.as_str())
        .bind(record.expires_at)
        .bind(Json(record))
        .execute(self.db_pool.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(BackupError::not_found(format!("backup {}", record.id)));
        }
        Ok(())
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        let row = sqlx::query("SELECT record FROM backup_records WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db_pool.as_ref())
            .await?;

        row.map(|row| Ok(row.try_get::<Json<BackupRecord>, _>("record")?.0))
            .transpose()
    }

    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM backup_records
            WHERE ($1::text IS NULL OR backup_type = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR retention_tier = $3)
              AND ($4 OR $2 = 'deleted' OR status <> 'deleted')
            ORDER BY created_at DESC
            LIMIT $5
        "#,
        )
        .bind(filter.backup_type.map(|t| t.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.retention_tier.map(|t| t.as_str()))
        .bind(filter.include_deleted)
        .bind(filter.limit.map(|l| l as i64))
        .fetch_all(self.db_pool.as_ref())
        .await?;

        rows.into_iter()
            .map(|row| Ok(row.try_get::<Json<BackupRecord>, _>("record")?.0))
            .collect()
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM backup_records
            WHERE status = ANY($1) AND expires_at < $2
            ORDER BY expires_at
        "#,
        )
        .bind(Self::status_strings(&BackupStatus::SUCCESS))
        .bind(now)
        .fetch_all(self.db_pool.as_ref())
        .await?;

        rows.into_iter()
            .map(|row| Ok(row.try_get::<Json<BackupRecord>, _>("record")?.0))
            .collect()
    }

    async fn latest_successful_before(
        &self,
        at: DateTime<Utc>,
        types: &[BackupType],
    ) -> Result<Option<BackupRecord>> {
        let types: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();
        let row = sqlx::query(
            r#"
            SELECT record FROM backup_records
            WHERE status = ANY($1) AND backup_type = ANY($2) AND created_at <= $3
            ORDER BY created_at DESC
            LIMIT 1
        "#,
        )
        .bind(Self::status_strings(&BackupStatus::SUCCESS))
        .bind(types)
        .bind(at)
        .fetch_optional(self.db_pool.as_ref())
        .await?;

        row.map(|row| Ok(row.try_get::<Json<BackupRecord>, _>("record")?.0))
            .transpose()
    }

    async fn insert_recovery_test(&self, test: &RecoveryTestRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO recovery_tests (id, backup_id, status, started_at, record)
            VALUES ($1, $2, $3, $4, $5)
        "#,
        )
        .bind(test.id)
        .bind(test.backup_id)
        .bind(test.status.as_str())
        .bind(test.created_at)
        .bind(Json(test))
        .execute(self.db_pool.as_ref())
        .await?;
        Ok(())
    }

    async fn update_recovery_test(&self, test: &RecoveryTestRecord) -> Result<()> {
        let result = sqlx::query(
            "UPDATE recovery_tests SET backup_id = $2, status = $3, record = $4 WHERE id = $1",
        )
        .bind(test.id)
        .bind(test.backup_id)
        .bind(test.status.as_str())
        .bind(Json(test))
        .execute(self.db_pool.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(BackupError::not_found(format!("recovery test {}", test.id)));
        }
        Ok(())
    }

    async fn get_recovery_test(&self, id: Uuid) -> Result<Option<RecoveryTestRecord>> {
        let row = sqlx::query("SELECT record FROM recovery_tests WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db_pool.as_ref())
            .await?;

        row.map(|row| Ok(row.try_get::<Json<RecoveryTestRecord>, _>("record")?.0))
            .transpose()
    }

    async fn list_recovery_tests(&self, limit: usize) -> Result<Vec<RecoveryTestRecord>> {
        let rows = sqlx::query("SELECT record FROM recovery_tests ORDER BY started_at DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(self.db_pool.as_ref())
            .await?;

        rows.into_iter()
            .map(|row| Ok(row.try_get::<Json<RecoveryTestRecord>, _>("record")?.0))
            .collect()
    }
}

/// Process-local repository for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryBackupRepository {
    backups: RwLock<HashMap<Uuid, BackupRecord>>,
    recovery_tests: RwLock<HashMap<Uuid, RecoveryTestRecord>>,
}

impl InMemoryBackupRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackupRepository for InMemoryBackupRepository {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_backup(&self, record: &BackupRecord) -> Result<()> {
        let mut backups = self.backups.write().await;
        if backups.contains_key(&record.id) {
            return Err(BackupError::StorageError {
                message: format!("backup {} already exists", record.id),
            });
        }
        backups.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_backup(&self, record: &BackupRecord) -> Result<()> {
        match self.backups.write().await.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(BackupError::not_found(format!("backup {}", record.id))),
        }
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        Ok(self.backups.read().await.get(&id).cloned())
    }

    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> = self
            .backups
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<BackupRecord>> {
        let mut expired: Vec<BackupRecord> = self
            .backups
            .read()
            .await
            .values()
            .filter(|r| r.status.is_success() && r.expires_at < now)
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        Ok(expired)
    }

    async fn latest_successful_before(
        &self,
        at: DateTime<Utc>,
        types: &[BackupType],
    ) -> Result<Option<BackupRecord>> {
        Ok(self
            .backups
            .read()
            .await
            .values()
            .filter(|r| r.status.is_success() && types.contains(&r.backup_type) && r.created_at <= at)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn insert_recovery_test(&self, test: &RecoveryTestRecord) -> Result<()> {
        self.recovery_tests.write().await.insert(test.id, test.clone());
        Ok(())
    }

    async fn update_recovery_test(&self, test: &RecoveryTestRecord) -> Result<()> {
        match self.recovery_tests.write().await.get_mut(&test.id) {
            Some(existing) => {
                *existing = test.clone();
                Ok(())
            }
            None => Err(BackupError::not_found(format!("recovery test {}", test.id))),
        }
    }

    async fn get_recovery_test(&self, id: Uuid) -> Result<Option<RecoveryTestRecord>> {
        Ok(self.recovery_tests.read().await.get(&id).cloned())
    }

    async fn list_recovery_tests(&self, limit: usize) -> Result<Vec<RecoveryTestRecord>> {
        let mut tests: Vec<RecoveryTestRecord> =
            self.recovery_tests.read().await.values().cloned().collect();
        tests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tests.truncate(limit);
        Ok(tests)
    }
}
