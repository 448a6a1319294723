//! fogd - Fog control-plane daemon
//!
//! Library components for the daemon process: storage, repo registry,
//! worktree management, run scheduling, tool invocation, the post-run
//! pipeline, and the HTTP API.

pub mod ai;
pub mod crypto;
pub mod git;
pub mod pipeline;
pub mod proc;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod worktree;

use std::sync::Arc;
use std::time::Duration;

use fog_core::FogConfig;
use registry::Registry;
use scheduler::{Scheduler, SchedulerConfig};
use server::AppState;
use storage::Storage;
use tracing::{info, warn};
use worktree::WorktreeManager;

/// Type alias for application-level errors with context and backtraces.
pub type AppResult<T> = eyre::Result<T>;

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: FogConfig,
    storage: Arc<Storage>,
    scheduler: Arc<Scheduler>,
    registry: Arc<Registry>,
    worktrees: Arc<WorktreeManager>,
}

impl Daemon {
    /// Create a new daemon with the given configuration.
    pub async fn new(config: FogConfig) -> AppResult<Self> {
        std::fs::create_dir_all(&config.home)?;
        std::fs::create_dir_all(config.log_dir())?;

        let storage = Storage::new(&config.db_path()).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);

        // Materialize the master key early so secret writes never race
        // key creation.
        crypto::load_or_create_master_key(&config.master_key_path())?;

        if !git::is_available() {
            warn!("git executable not found; repo registration will fail");
        }

        let worktrees = Arc::new(WorktreeManager::new());
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&storage),
            Arc::clone(&worktrees),
            SchedulerConfig {
                max_parallel: config.max_parallel,
                run_timeout: Duration::from_secs(config.run_timeout_sec),
            },
        ));
        let registry = Arc::new(Registry::new(Arc::clone(&storage), config.repos_dir()));

        Ok(Self {
            config,
            storage,
            scheduler,
            registry,
            worktrees,
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Build the shared state handed to the HTTP layer.
    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            storage: Arc::clone(&self.storage),
            scheduler: Arc::clone(&self.scheduler),
            registry: Arc::clone(&self.registry),
            worktrees: Arc::clone(&self.worktrees),
            config: self.config.clone(),
        })
    }

    /// Run the daemon: recovery pass, then the HTTP server.
    pub async fn run(&self) -> AppResult<()> {
        info!("fogd starting on port {}", self.config.port);
        info!("home: {}", self.config.home.display());
        info!("max parallel runs: {}", self.config.max_parallel);

        match self.scheduler.recover().await {
            Ok(0) => {}
            Ok(count) => info!("marked {count} orphaned run(s) as failed"),
            Err(e) => warn!("startup recovery failed: {e}"),
        }

        server::start_server(self.app_state(), self.config.port)
            .await
            .map_err(|e| eyre::eyre!("http server: {e}"))?;

        Ok(())
    }

    /// Signal supervisors to stop.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
