use crate::{
    backup::{
        BackupManager, BackupRepository, BackupVerifier, CloudStorageGateway,
        DisasterRecoveryManager, EncryptionEngine, PgDumpTool, PgInspector, PgRestoreTool,
        PostgresBackupRepository, RecoveryEngine, WalArchiver,
    },
    scheduler::BackupScheduler,
    setup::SetupManager,
    Config,
};
use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Dependency injection container for the application
pub struct DependencyContainer {
    // Core configuration
    pub config: Config,

    // Database layer
    pub db_pool: Arc<PgPool>,

    // Repository layer
    pub repository: Arc<dyn BackupRepository>,

    // Service layer
    pub backup_manager: Arc<BackupManager>,
    pub recovery_engine: Arc<RecoveryEngine>,
    pub verifier: Arc<BackupVerifier>,
    pub disaster_recovery: Arc<DisasterRecoveryManager>,
    pub setup_manager: Arc<SetupManager>,

    // Infrastructure layer
    pub cloud_storage: Option<Arc<CloudStorageGateway>>,
    pub wal_archiver: WalArchiver,
}

impl DependencyContainer {
    pub async fn new(config: Config) -> Result<Self> {
        info!("🔧 Initializing dependency container...");
        info!("Database: {}", config.safe_database_url());

        let backup_config = config.to_backup_config()?;

        // Create database connection pool
        let db_pool = Arc::new(
            create_pool(&config.database_url, config.operational.max_db_connections).await?,
        );

        // Repository layer
        let repository: Arc<dyn BackupRepository> =
            Arc::new(PostgresBackupRepository::new(db_pool.clone()));

        // Infrastructure layer
        let cloud_storage = if config.cloud.enabled {
            let gateway = CloudStorageGateway::from_config(config.to_cloud_config())
                .await
                .map_err(|e| anyhow::anyhow!("Failed to initialize cloud storage: {}", e))?;
            info!(
                "☁️  Cloud storage enabled: {} ({})",
                gateway.config().primary.bucket,
                gateway.config().primary.region
            );
            Some(Arc::new(gateway))
        } else {
            None
        };
        let encryption = config.master_key()?.map(EncryptionEngine::new);
        let wal_archiver = WalArchiver::new(backup_config.wal_archive_directory.clone());

        // Service layer
        let mut backup_manager = BackupManager::new(
            backup_config.clone(),
            repository.clone(),
            Arc::new(PgDumpTool),
        );
        let mut recovery_engine = RecoveryEngine::new(
            backup_config.clone(),
            repository.clone(),
            Arc::new(PgRestoreTool),
        )
        .with_inspector(Arc::new(PgInspector))
        .with_wal_archiver(wal_archiver.clone());

        if let Some(engine) = encryption {
            info!("🔐 Encryption key loaded (key id {})", engine.key_id());
            backup_manager = backup_manager.with_encryption(engine.clone());
            recovery_engine = recovery_engine.with_encryption(engine);
        }
        if let Some(gateway) = &cloud_storage {
            backup_manager = backup_manager.with_cloud_storage(gateway.clone());
            recovery_engine = recovery_engine.with_cloud_storage(gateway.clone());
        }

        let recovery_engine = Arc::new(recovery_engine);
        let verifier = Arc::new(BackupVerifier::new(
            repository.clone(),
            recovery_engine.clone(),
        ));
        let disaster_recovery = Arc::new(DisasterRecoveryManager::new(
            backup_config,
            repository.clone(),
            recovery_engine.clone(),
        ));
        let setup_manager = Arc::new(SetupManager::new(config.clone()));

        info!("✅ Dependency container initialized successfully");

        Ok(Self {
            config,
            db_pool,
            repository,
            backup_manager: Arc::new(backup_manager),
            recovery_engine,
            verifier,
            disaster_recovery,
            setup_manager,
            cloud_storage,
            wal_archiver,
        })
    }

    pub async fn create_scheduler(&self) -> Result<BackupScheduler> {
        BackupScheduler::new(
            self.config.to_schedule_config(),
            self.backup_manager.clone(),
            self.verifier.clone(),
            self.disaster_recovery.clone(),
        )
        .await
    }

    pub async fn health_check(&self) -> Result<bool> {
        Ok(self.setup_manager.check_all().await.is_healthy())
    }
}

/// Pool for the backup catalog. Dump and restore run through the client
/// tools, so a handful of connections is enough.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Some(Duration::from_secs(300))) // 5 minutes
        .test_before_acquire(true)
        .connect(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Database connectivity test failed: {}", e))?;

    Ok(pool)
}
