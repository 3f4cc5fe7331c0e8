pub mod application;
pub mod backup;
pub mod config;
pub mod scheduler;
pub mod setup;

pub use config::Config;
pub use setup::SetupManager;

// Re-export backup types
pub use backup::{
    BackupConfig, BackupError, BackupManager, BackupOptions, BackupRecord, BackupStatus,
    BackupType, BackupVerifier, CloudStorageGateway, DisasterRecoveryManager, EncryptionEngine,
    EnhancedBackupResult, RecoveryEngine, RetentionPolicy, RetentionTier, WalArchiver,
};

pub use scheduler::{BackupScheduler, ScheduleConfig};
