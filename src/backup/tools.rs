//! Seams to the external database tooling: dump and base backup, restore,
//! and a read-only inspector for restored databases.

use super::artifact;
use super::{BackupError, ConnectionParams, Result, WalSegment};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgConnection, Row};
use std::fmt::Debug;
use std::path::Path;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

/// Produces backup artifacts from the source server.
#[async_trait]
pub trait DumpTool: Send + Sync + Debug {
    /// Logical dump of the source database.
    async fn dump(&self, connection: &ConnectionParams, output: &Path, compress: bool)
        -> Result<()>;

    /// Physical base backup of the whole server, written as `base.tar`
    /// (`base.tar.gz` when compressing) inside `target_dir`.
    async fn basebackup(
        &self,
        connection: &ConnectionParams,
        target_dir: &Path,
        compress: bool,
    ) -> Result<()>;
}

/// Loads artifacts into databases and configures WAL replay for PITR targets.
#[async_trait]
pub trait RestoreTool: Send + Sync + Debug {
    /// Load a plaintext (optionally gzip) SQL artifact into `target_database`.
    async fn restore(
        &self,
        connection: &ConnectionParams,
        input: &Path,
        target_database: &str,
    ) -> Result<()>;

    async fn create_database(&self, connection: &ConnectionParams, name: &str) -> Result<()>;

    async fn drop_database(&self, connection: &ConnectionParams, name: &str) -> Result<()>;

    /// Stage `segments` next to `target_dir` and configure recovery to stop
    /// at `target_time`. Returns the number of segments staged.
    async fn replay_wal(
        &self,
        target_dir: &Path,
        segments: &[WalSegment],
        target_time: DateTime<Utc>,
    ) -> Result<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRowCount {
    pub table: String,
    pub rows: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintStatus {
    pub name: String,
    pub table: String,
    pub valid: bool,
}

/// Read-only probes against a restored database.
#[async_trait]
pub trait DatabaseInspector: Send + Sync + Debug {
    async fn table_row_counts(&self, connection: &ConnectionParams) -> Result<Vec<TableRowCount>>;

    async fn validate_constraints(
        &self,
        connection: &ConnectionParams,
    ) -> Result<Vec<ConstraintStatus>>;

    /// First column of the first row, rendered as text.
    async fn query_scalar(&self, connection: &ConnectionParams, sql: &str)
        -> Result<Option<String>>;
}

fn command(program: &str, connection: &ConnectionParams) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg("-h")
        .arg(&connection.host)
        .arg("-p")
        .arg(connection.port.to_string())
        .arg("-U")
        .arg(&connection.user)
        .kill_on_drop(true);
    if let Some(password) = &connection.password {
        cmd.env("PGPASSWORD", password);
    }
    cmd
}

async fn run(tool: &str, mut cmd: Command) -> Result<()> {
    debug!("Running {}", tool);
    let output = cmd.output().await.map_err(|e| BackupError::ExternalTool {
        tool: tool.to_string(),
        message: if e.kind() == std::io::ErrorKind::NotFound {
            format!("{tool} not found on PATH")
        } else {
            e.to_string()
        },
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackupError::ExternalTool {
            tool: tool.to_string(),
            message: format!("exited with {}: {}", output.status, stderr.trim()),
        });
    }
    Ok(())
}

/// `pg_dump` in plain SQL format, gzip-compressed on request.
#[derive(Debug, Clone, Default)]
pub struct PgDumpTool;

#[async_trait]
impl DumpTool for PgDumpTool {
    async fn dump(&self, connection: &ConnectionParams, output: &Path, compress: bool) -> Result<()> {
        info!("Dumping database {} to {}", connection.database, output.display());

        let mut cmd = command("pg_dump", connection);
        cmd.arg("-d")
            .arg(&connection.database)
            .arg("--format=plain")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("-f")
            .arg(output);
        if compress {
            cmd.arg("--compress=6");
        }

        let result = run("pg_dump", cmd).await;
        if result.is_err() {
            let _ = fs::remove_file(output).await;
        }
        result
    }

    async fn basebackup(
        &self,
        connection: &ConnectionParams,
        target_dir: &Path,
        compress: bool,
    ) -> Result<()> {
        info!("Taking base backup into {}", target_dir.display());
        fs::create_dir_all(target_dir).await?;

        // WAL needed for consistency goes inside base.tar
        let mut cmd = command("pg_basebackup", connection);
        cmd.arg("-D")
            .arg(target_dir)
            .arg("--format=tar")
            .arg("--wal-method=fetch")
            .arg("--checkpoint=fast")
            .arg("--no-password");
        if compress {
            cmd.arg("--gzip");
        }
        run("pg_basebackup", cmd).await
    }
}

/// `psql`, `createdb` and `dropdb`, plus recovery configuration for
/// unpacked base backups.
#[derive(Debug, Clone, Default)]
pub struct PgRestoreTool;

#[async_trait]
impl RestoreTool for PgRestoreTool {
    async fn restore(
        &self,
        connection: &ConnectionParams,
        input: &Path,
        target_database: &str,
    ) -> Result<()> {
        info!("Restoring {} into {}", input.display(), target_database);

        let (sql_path, scratch) = if artifact::is_gzip(input).await? {
            let plain = input.with_extension("restore.sql");
            artifact::decompress_to(input, &plain).await?;
            (plain.clone(), Some(plain))
        } else {
            (input.to_path_buf(), None)
        };

        let mut cmd = command("psql", connection);
        cmd.arg("-d")
            .arg(target_database)
            .arg("-v")
            .arg("ON_ERROR_STOP=1")
            .arg("-q")
            .arg("-f")
            .arg(&sql_path);
        let result = run("psql", cmd).await;

        if let Some(scratch) = scratch {
            let _ = fs::remove_file(scratch).await;
        }
        result
    }

    async fn create_database(&self, connection: &ConnectionParams, name: &str) -> Result<()> {
        let mut cmd = command("createdb", connection);
        cmd.arg(name);
        run("createdb", cmd).await
    }

    async fn drop_database(&self, connection: &ConnectionParams, name: &str) -> Result<()> {
        let mut cmd = command("dropdb", connection);
        cmd.arg("--if-exists").arg(name);
        run("dropdb", cmd).await
    }

    async fn replay_wal(
        &self,
        target_dir: &Path,
        segments: &[WalSegment],
        target_time: DateTime<Utc>,
    ) -> Result<usize> {
        let staging = target_dir.join("pitr_wal");
        fs::create_dir_all(&staging).await?;
        for segment in segments {
            fs::copy(&segment.path, staging.join(&segment.name)).await?;
        }

        let settings = recovery_settings(&staging, target_time);
        let auto_conf = target_dir.join("postgresql.auto.conf");
        let mut existing = match fs::read_to_string(&auto_conf).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        existing.push_str(&settings);
        fs::write(&auto_conf, existing).await?;
        fs::write(target_dir.join("recovery.signal"), b"").await?;

        info!(
            "Staged {} WAL segments for recovery to {}",
            segments.len(),
            target_time
        );
        Ok(segments.len())
    }
}

fn recovery_settings(wal_dir: &Path, target_time: DateTime<Utc>) -> String {
    format!(
        "\n# point-in-time recovery\nrestore_command = 'cp \"{}/%f\" \"%p\"'\nrecovery_target_time = '{}'\nrecovery_target_action = 'promote'\n",
        wal_dir.display(),
        target_time.format("%Y-%m-%d %H:%M:%S%.6f+00")
    )
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Inspector over a direct `sqlx` connection.
#[derive(Debug, Clone, Default)]
pub struct PgInspector;

impl PgInspector {
    async fn connect(&self, connection: &ConnectionParams) -> Result<PgConnection> {
        Ok(PgConnection::connect(&connection.to_url()).await?)
    }
}

#[async_trait]
impl DatabaseInspector for PgInspector {
    async fn table_row_counts(&self, connection: &ConnectionParams) -> Result<Vec<TableRowCount>> {
        let mut conn = self.connect(connection).await?;
        let tables = sqlx::query(
            r#"
            SELECT table_schema, table_name
            FROM information_schema.tables
            WHERE table_type = 'BASE TABLE'
              AND table_schema NOT IN ('pg_catalog', 'information_schema')
            ORDER BY table_schema, table_name
        "#,
        )
        .fetch_all(&mut conn)
        .await?;

        let mut counts = Vec::with_capacity(tables.len());
        for row in tables {
            let schema: String = row.try_get("table_schema")?;
            let table: String = row.try_get("table_name")?;
            let sql = format!(
                "SELECT COUNT(*) FROM {}.{}",
                quote_ident(&schema),
                quote_ident(&table)
            );
            let rows: i64 = sqlx::query_scalar(&sql).fetch_one(&mut conn).await?;
            counts.push(TableRowCount {
                table: format!("{schema}.{table}"),
                rows,
            });
        }
        conn.close().await?;
        Ok(counts)
    }

    async fn validate_constraints(
        &self,
        connection: &ConnectionParams,
    ) -> Result<Vec<ConstraintStatus>> {
        let mut conn = self.connect(connection).await?;
        let rows = sqlx::query(
            r#"
            SELECT c.conname::text AS name, c.conrelid::regclass::text AS table_name, c.convalidated AS valid
            FROM pg_constraint c
            JOIN pg_namespace n ON n.oid = c.connamespace
            WHERE c.contype IN ('c', 'f', 'p', 'u')
              AND n.nspname NOT IN ('pg_catalog', 'information_schema')
            ORDER BY 2, 1
        "#,
        )
        .fetch_all(&mut conn)
        .await?;

        let mut constraints = Vec::with_capacity(rows.len());
        for row in rows {
            constraints.push(ConstraintStatus {
                name: row.try_get("name")?,
                table: row.try_get("table_name")?,
                valid: row.try_get("valid")?,
            });
        }
        conn.close().await?;
        Ok(constraints)
    }

    async fn query_scalar(
        &self,
        connection: &ConnectionParams,
        sql: &str,
    ) -> Result<Option<String>> {
        let mut conn = self.connect(connection).await?;
        let row = sqlx::query(sql).fetch_optional(&mut conn).await?;
        conn.close().await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let value = if let Ok(v) = row.try_get::<Option<String>, _>(0) {
            v
        } else if let Ok(v) = row.try_get::<Option<i64>, _>(0) {
            v.map(|v| v.to_string())
        } else if let Ok(v) = row.try_get::<Option<i32>, _>(0) {
            v.map(|v| v.to_string())
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(0) {
            v.map(|v| v.to_string())
        } else {
            row.try_get::<Option<f64>, _>(0)?.map(|v| v.to_string())
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_recovery_settings() {
        let target = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap();
        let settings = recovery_settings(Path::new("/restore/pitr_wal"), target);
        assert!(settings.contains("restore_command = 'cp \"/restore/pitr_wal/%f\" \"%p\"'"));
        assert!(settings.contains("recovery_target_time = '2024-06-01 12:30:00.000000+00'"));
        assert!(settings.contains("recovery_target_action = 'promote'"));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("memories"), "\"memories\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test]
    async fn test_replay_wal_stages_segments() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("postgresql.auto.conf"), "# existing\n").unwrap();

        let mut segments = Vec::new();
        for i in 1..=3 {
            let name = format!("00000001000000000000000{i}");
            let path = dir.path().join(&name);
            std::fs::write(&path, b"wal").unwrap();
            segments.push(WalSegment {
                name,
                path,
                size_bytes: 3,
                archived_at: Utc::now(),
            });
        }

        let applied = PgRestoreTool
            .replay_wal(&data_dir, &segments, Utc::now())
            .await
            .unwrap();
        assert_eq!(applied, 3);
        assert!(data_dir.join("recovery.signal").exists());
        assert!(data_dir.join("pitr_wal/000000010000000000000002").exists());
        let conf = std::fs::read_to_string(data_dir.join("postgresql.auto.conf")).unwrap();
        assert!(conf.starts_with("# existing\n"));
        assert!(conf.contains("recovery_target_time"));
    }
}
