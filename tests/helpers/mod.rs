//! Shared fakes for the integration tests: a dump tool that writes a small
//! gzip SQL dump or base backup archive, a restore tool that records what it
//! was asked to do, and a canned database inspector.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use codex_backup::backup::{
    BackupConfig, BackupError, BackupManager, BackupRepository, BucketLocation, CloudProvider,
    CloudStorageConfig, CloudStorageGateway, ConnectionParams, ConstraintStatus,
    DatabaseInspector, DumpTool, EncryptionEngine, FilesystemBlobStore, FixedClock,
    InMemoryBackupRepository, MasterKey, RecoveryEngine, RestoreTool, Result, RetentionPolicy,
    TableRowCount, WalSegment,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const SAMPLE_DUMP: &str = "\
--
-- PostgreSQL database dump
--
SET statement_timeout = 0;
CREATE TABLE public.memories (
    id uuid NOT NULL,
    content text NOT NULL
);
CREATE SEQUENCE public.memories_seq;
CREATE TABLE public.tags (
    memory_id uuid NOT NULL,
    tag text NOT NULL
);
CREATE INDEX idx_tags_tag ON public.tags USING btree (tag);
COPY public.memories (id, content) FROM stdin;
7f1c2e1a-0000-4000-8000-000000000001\tfirst
7f1c2e1a-0000-4000-8000-000000000002\tsecond
\\.
COPY public.tags (memory_id, tag) FROM stdin;
7f1c2e1a-0000-4000-8000-000000000001\tnote
\\.
";

/// Files of the fake base backup archive.
pub const SNAPSHOT_FILES: [(&str, &[u8]); 4] = [
    ("PG_VERSION", b"16\n"),
    ("global/pg_control", &[0u8; 64]),
    ("base/5/16384", &[1u8; 256]),
    ("base/5/16390", &[2u8; 256]),
];

pub fn snapshot_archive() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, body) in SNAPSHOT_FILES {
        let mut header = tar::Header::new_ustar();
        header.set_size(body.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder.append_data(&mut header, name, body).unwrap();
    }
    builder.into_inner().unwrap()
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

pub fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

/// Writes `SAMPLE_DUMP` or `snapshot_archive()`, gzipped when asked.
#[derive(Debug, Default)]
pub struct FakeDumpTool {
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeDumpTool {
    fn start(&self, tool: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(BackupError::ExternalTool {
                tool: tool.to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DumpTool for FakeDumpTool {
    async fn dump(&self, _connection: &ConnectionParams, output: &Path, compress: bool) -> Result<()> {
        self.start("pg_dump")?;
        let bytes = if compress {
            gzip(SAMPLE_DUMP.as_bytes())?
        } else {
            SAMPLE_DUMP.as_bytes().to_vec()
        };
        tokio::fs::write(output, bytes).await?;
        Ok(())
    }

    async fn basebackup(&self, _connection: &ConnectionParams, target_dir: &Path, compress: bool) -> Result<()> {
        self.start("pg_basebackup")?;
        tokio::fs::create_dir_all(target_dir).await?;
        let (name, bytes) = if compress {
            ("base.tar.gz", gzip(&snapshot_archive())?)
        } else {
            ("base.tar", snapshot_archive())
        };
        tokio::fs::write(target_dir.join(name), bytes).await?;
        Ok(())
    }
}

/// Records every call; `replay_wal` leaves the file a real recovery
/// configuration would.
#[derive(Debug, Default)]
pub struct FakeRestoreTool {
    pub calls: Mutex<Vec<String>>,
    pub delay: Mutex<Option<Duration>>,
    pub fail_restore: AtomicBool,
}

impl FakeRestoreTool {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RestoreTool for FakeRestoreTool {
    async fn restore(&self, _connection: &ConnectionParams, input: &Path, target_database: &str) -> Result<()> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !input.exists() {
            return Err(BackupError::ExternalTool {
                tool: "psql".to_string(),
                message: format!("{} does not exist", input.display()),
            });
        }
        self.record(format!("restore {target_database}"));
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(BackupError::ExternalTool {
                tool: "psql".to_string(),
                message: "ERROR: relation already exists".to_string(),
            });
        }
        Ok(())
    }

    async fn create_database(&self, _connection: &ConnectionParams, name: &str) -> Result<()> {
        self.record(format!("createdb {name}"));
        Ok(())
    }

    async fn drop_database(&self, _connection: &ConnectionParams, name: &str) -> Result<()> {
        self.record(format!("dropdb {name}"));
        Ok(())
    }

    async fn replay_wal(
        &self,
        target_dir: &Path,
        segments: &[WalSegment],
        target_time: DateTime<Utc>,
    ) -> Result<usize> {
        tokio::fs::write(
            target_dir.join("recovery.signal"),
            format!("recovery_target_time = '{}'\n", target_time.to_rfc3339()),
        )
        .await?;
        self.record(format!("replay_wal {}", segments.len()));
        Ok(segments.len())
    }
}

/// Reports two populated tables and answers every scalar query with "1".
#[derive(Debug, Default)]
pub struct FakeInspector {
    pub invalid_constraint: AtomicBool,
}

#[async_trait]
impl DatabaseInspector for FakeInspector {
    async fn table_row_counts(&self, _connection: &ConnectionParams) -> Result<Vec<TableRowCount>> {
        Ok(vec![
            TableRowCount {
                table: "public.memories".to_string(),
                rows: 2,
            },
            TableRowCount {
                table: "public.tags".to_string(),
                rows: 1,
            },
        ])
    }

    async fn validate_constraints(&self, _connection: &ConnectionParams) -> Result<Vec<ConstraintStatus>> {
        Ok(vec![ConstraintStatus {
            name: "memories_pkey".to_string(),
            table: "public.memories".to_string(),
            valid: !self.invalid_constraint.load(Ordering::SeqCst),
        }])
    }

    async fn query_scalar(&self, _connection: &ConnectionParams, _sql: &str) -> Result<Option<String>> {
        Ok(Some("1".to_string()))
    }
}

pub fn master_key(byte: u8) -> MasterKey {
    MasterKey::new(vec![byte; 32]).unwrap()
}

pub fn encryption_engine() -> EncryptionEngine {
    EncryptionEngine::new(master_key(42))
}

/// One scratch directory, one in-memory catalog and one fixed clock shared by
/// every engine a test builds.
pub struct Harness {
    pub dir: TempDir,
    pub config: BackupConfig,
    pub repository: Arc<InMemoryBackupRepository>,
    pub clock: Arc<FixedClock>,
    pub dump_tool: Arc<FakeDumpTool>,
    pub restore_tool: Arc<FakeRestoreTool>,
    pub inspector: Arc<FakeInspector>,
}

impl Harness {
    pub fn new() -> Self {
        Self::at(ts(2024, 6, 12, 2, 0))
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        let dir = TempDir::new().unwrap();
        let config = BackupConfig {
            backup_directory: dir.path().join("backups"),
            wal_archive_directory: dir.path().join("wal"),
            retention: RetentionPolicy::default(),
            ..Default::default()
        };
        Self {
            dir,
            config,
            repository: Arc::new(InMemoryBackupRepository::new()),
            clock: Arc::new(FixedClock::new(now)),
            dump_tool: Arc::new(FakeDumpTool::default()),
            restore_tool: Arc::new(FakeRestoreTool::default()),
            inspector: Arc::new(FakeInspector::default()),
        }
    }

    pub fn repository(&self) -> Arc<dyn BackupRepository> {
        self.repository.clone()
    }

    pub fn manager(&self) -> BackupManager {
        BackupManager::new(self.config.clone(), self.repository(), self.dump_tool.clone())
            .with_clock(self.clock.clone())
    }

    pub fn encrypted_manager(&self) -> BackupManager {
        self.manager().with_encryption(encryption_engine())
    }

    pub fn recovery(&self) -> RecoveryEngine {
        RecoveryEngine::new(self.config.clone(), self.repository(), self.restore_tool.clone())
            .with_inspector(self.inspector.clone())
            .with_encryption(encryption_engine())
            .with_clock(self.clock.clone())
    }

    /// Directory-backed object storage under the scratch directory.
    pub fn cloud_config(&self, replication: bool) -> CloudStorageConfig {
        CloudStorageConfig {
            enabled: true,
            provider: CloudProvider::Filesystem,
            primary: BucketLocation {
                bucket: "backups-primary".to_string(),
                region: "us-east-1".to_string(),
            },
            replica: replication.then(|| BucketLocation {
                bucket: "backups-replica".to_string(),
                region: "eu-west-1".to_string(),
            }),
            cross_region_enabled: replication,
            endpoint_url: None,
            filesystem_root: self.dir.path().join("object-store"),
        }
    }

    pub fn filesystem_cloud(&self, replication: bool) -> Arc<CloudStorageGateway> {
        let config = self.cloud_config(replication);
        let store = Arc::new(FilesystemBlobStore::new(&config.filesystem_root));
        let replica = replication.then(|| store.clone() as Arc<dyn codex_backup::backup::BlobStore>);
        Arc::new(CloudStorageGateway::new(config, store, replica))
    }
}
