use anyhow::Result;
use std::sync::Arc;

pub mod command_handlers;
pub mod dependency_container;
pub mod lifecycle;

pub use command_handlers::{
    archive_wal_segment, BackupCommandHandler, CreateBackupArgs, DrillCommandHandler,
    HealthCommandHandler, RecoveryCommandHandler, RestoreArgs,
};
pub use dependency_container::DependencyContainer;
pub use lifecycle::ApplicationLifecycle;

use crate::Config;

/// Application layer - wires configuration into the backup engines
pub struct Application {
    pub container: Arc<DependencyContainer>,
    pub lifecycle: Arc<ApplicationLifecycle>,
}

impl Application {
    pub async fn new(config: Config) -> Result<Self> {
        let container = Arc::new(DependencyContainer::new(config).await?);
        let lifecycle = Arc::new(ApplicationLifecycle::new(container.clone()));

        Ok(Self {
            container,
            lifecycle,
        })
    }

    pub async fn initialize(&self) -> Result<()> {
        self.lifecycle.initialize().await
    }
}
