use crate::application::DependencyContainer;
use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Manages application lifecycle events and graceful shutdown
pub struct ApplicationLifecycle {
    container: Arc<DependencyContainer>,
}

impl ApplicationLifecycle {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    /// Validate configuration and prepare the catalog and directories
    pub async fn initialize(&self) -> Result<()> {
        info!("🚀 Initializing application...");

        self.container.config.validate()?;
        self.container.setup_manager.prepare_directories().await?;

        self.container
            .backup_manager
            .initialize()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize backup catalog: {}", e))?;
        self.container
            .wal_archiver
            .initialize()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize WAL archive: {}", e))?;

        info!("✅ Application initialized successfully");
        Ok(())
    }

    /// Run the cron jobs until SIGINT or SIGTERM
    pub async fn run_scheduler(&self) -> Result<()> {
        if !self.container.health_check().await? {
            warn!("⚠️ Health checks failed; scheduled jobs may fail until fixed (run `codex-backup health --detailed`)");
        }

        let scheduler = self.container.create_scheduler().await?;
        scheduler.start().await?;

        self.wait_for_shutdown().await;

        info!("🛑 Initiating graceful shutdown...");
        scheduler.shutdown().await?;
        for (job, stats) in scheduler.statistics().await {
            info!(
                "{} job: {} runs, {} succeeded, {} failed, {} skipped",
                job, stats.total_runs, stats.successful_runs, stats.failed_runs, stats.skipped_runs
            );
        }
        self.container.db_pool.close().await;
        info!("🎉 Graceful shutdown completed");
        Ok(())
    }

    /// Wait for shutdown signals
    pub async fn wait_for_shutdown(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install terminate signal handler: {}", e);
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received");
    }
}
