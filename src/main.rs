use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use codex_backup::application::*;
use codex_backup::backup::{BackupStatus, BackupType, DrillScenario, RetentionTier, VerifyOptions};
use codex_backup::setup::create_sample_env_file;
use codex_backup::Config;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "codex-backup")]
#[command(about = "Encrypted, verified and replicated PostgreSQL backups")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backup management commands
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Restore a backup into a database, or recover to a point in time
    Restore {
        /// Backup to restore; pins the base backup for point-in-time recovery
        #[arg(long)]
        backup_id: Option<Uuid>,
        /// Target database (default: a fresh restore_* database)
        #[arg(long)]
        target_database: Option<String>,
        /// Recover to this instant (RFC 3339)
        #[arg(long)]
        point_in_time: Option<DateTime<Utc>>,
        /// Data directory for point-in-time recovery
        #[arg(long)]
        target_directory: Option<PathBuf>,
        /// Load into an existing database instead of creating it
        #[arg(long)]
        no_create: bool,
        /// Skip the post-restore sanity check
        #[arg(long)]
        skip_verify: bool,
        /// Download from the replica bucket
        #[arg(long)]
        from_replica: bool,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Disaster recovery drills
    Drill {
        #[command(subcommand)]
        command: DrillCommands,
    },
    /// WAL archive commands
    Wal {
        #[command(subcommand)]
        command: WalCommands,
    },
    /// Run the backup, verification, drill and cleanup jobs on their schedules
    Schedule,
    /// Check tools, directories, keys and connectivity
    Health {
        /// Print every check as JSON
        #[arg(long)]
        detailed: bool,
    },
    /// Generate sample configuration file
    InitConfig {
        #[arg(long, default_value = ".env.example")]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Create a backup
    Create {
        #[arg(long = "type", value_name = "TYPE")]
        backup_type: Option<BackupType>,
        #[arg(long, conflicts_with = "no_encrypt")]
        encrypt: bool,
        #[arg(long)]
        no_encrypt: bool,
        #[arg(long, conflicts_with = "no_upload")]
        upload: bool,
        #[arg(long)]
        no_upload: bool,
        /// Copy the upload to the replica bucket
        #[arg(long, conflicts_with = "no_replicate")]
        replicate: bool,
        #[arg(long)]
        no_replicate: bool,
        #[arg(long, conflicts_with = "no_compress")]
        compress: bool,
        #[arg(long)]
        no_compress: bool,
        #[arg(long, conflicts_with = "no_verify")]
        verify: bool,
        #[arg(long)]
        no_verify: bool,
        /// Override the date-based retention tier
        #[arg(long)]
        tier: Option<RetentionTier>,
    },
    /// List backups, newest first
    List {
        #[arg(long = "type", value_name = "TYPE")]
        backup_type: Option<BackupType>,
        #[arg(long)]
        status: Option<BackupStatus>,
        #[arg(long)]
        tier: Option<RetentionTier>,
        #[arg(long)]
        include_deleted: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one backup record
    Show { id: Uuid },
    /// Delete a backup and its stored copies
    Delete { id: Uuid },
    /// Verify one backup, or every finished backup
    Verify {
        id: Option<Uuid>,
        /// Skip the test restore into a scratch database
        #[arg(long)]
        skip_test_recovery: bool,
        /// Test recovery timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Delete backups past their expiry
    Cleanup,
    /// Counts, sizes and alerts
    Stats,
    /// Cross-region replication status
    Replication,
}

#[derive(Subcommand)]
enum DrillCommands {
    /// Run every configured drill scenario
    Run,
    /// Run one drill now
    Test {
        /// full, incremental or point_in_time
        scenario: DrillScenario,
        #[arg(long)]
        backup_id: Option<Uuid>,
    },
    /// Report over recent drills
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum WalCommands {
    /// Archive one segment; use as archive_command = 'codex-backup wal archive %p %f'
    Archive { path: PathBuf, name: String },
}

fn flag(yes: bool, no: bool) -> Option<bool> {
    match (yes, no) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries command output
    if format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { path } = &cli.command {
        init_logging("info", "text");
        return create_sample_env_file(path);
    }

    let config = Config::from_env()?;
    init_logging(&config.operational.log_level, &config.operational.log_format);
    config.validate()?;

    // Commands that run without the backup catalog
    match &cli.command {
        Commands::Wal {
            command: WalCommands::Archive { path, name },
        } => return archive_wal_segment(&config, path, name).await,
        Commands::Health { detailed } => {
            return HealthCommandHandler::new(config).run_health_check(*detailed).await;
        }
        _ => {}
    }

    // Initialize application
    let app = Application::new(config).await?;
    app.initialize().await?;

    // Route commands to appropriate handlers
    match cli.command {
        Commands::Backup { command } => handle_backup_command(command, &app).await,
        Commands::Restore {
            backup_id,
            target_database,
            point_in_time,
            target_directory,
            no_create,
            skip_verify,
            from_replica,
            timeout,
        } => {
            let handler = RecoveryCommandHandler::new(app.container.clone());
            handler
                .restore(&RestoreArgs {
                    backup_id,
                    target_database,
                    point_in_time,
                    target_directory,
                    no_create,
                    skip_verify,
                    from_replica,
                    timeout_seconds: timeout,
                })
                .await
        }
        Commands::Drill { command } => {
            let handler = DrillCommandHandler::new(app.container.clone());
            match command {
                DrillCommands::Run => handler.run_drills().await,
                DrillCommands::Test {
                    scenario,
                    backup_id,
                } => handler.run_test(scenario, backup_id).await,
                DrillCommands::List { limit } => handler.list_tests(limit).await,
            }
        }
        Commands::Schedule => app.lifecycle.run_scheduler().await,
        Commands::Wal { .. } | Commands::Health { .. } | Commands::InitConfig { .. } => Ok(()),
    }
}

async fn handle_backup_command(command: BackupCommands, app: &Application) -> Result<()> {
    let handler = BackupCommandHandler::new(app.container.clone());

    match command {
        BackupCommands::Create {
            backup_type,
            encrypt,
            no_encrypt,
            upload,
            no_upload,
            replicate,
            no_replicate,
            compress,
            no_compress,
            verify,
            no_verify,
            tier,
        } => {
            let args = CreateBackupArgs {
                backup_type,
                encrypt: flag(encrypt, no_encrypt),
                upload: flag(upload, no_upload),
                replicate: flag(replicate, no_replicate),
                compress: flag(compress, no_compress),
                verify: flag(verify, no_verify),
                retention_tier: tier,
            };
            handler.create_backup(&args).await
        }
        BackupCommands::List {
            backup_type,
            status,
            tier,
            include_deleted,
            limit,
        } => {
            handler
                .list_backups(backup_type, status, tier, include_deleted, limit)
                .await
        }
        BackupCommands::Show { id } => handler.show_backup(id).await,
        BackupCommands::Delete { id } => handler.delete_backup(id).await,
        BackupCommands::Verify {
            id,
            skip_test_recovery,
            timeout,
        } => {
            let defaults = app.container.config.to_schedule_config().verify_options;
            let options = VerifyOptions {
                test_recovery: !skip_test_recovery,
                test_recovery_timeout_secs: timeout.unwrap_or(defaults.test_recovery_timeout_secs),
                ..defaults
            };
            handler.verify(id, options).await
        }
        BackupCommands::Cleanup => handler.cleanup().await,
        BackupCommands::Stats => handler.statistics().await,
        BackupCommands::Replication => handler.replication_status().await,
    }
}
