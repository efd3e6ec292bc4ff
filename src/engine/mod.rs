//! Replication engine: scheduler, wallet tasks and the handle operators use.

mod config;
mod directory;
mod reconnect;
mod scheduler;
mod supervisor;

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ledger::LedgerClient;
use crate::models::WalletStatus;

pub use config::{DetectionMode, EngineConfig, ReconnectPolicy};
pub use directory::{DirectorySnapshot, WalletDirectory};
use scheduler::{Registry, Scheduler};

/// Collaborators and configuration handed to every engine component.
#[derive(Clone)]
pub struct EngineContext {
    pub ledger: Arc<dyn LedgerClient>,
    pub directory: Arc<dyn WalletDirectory>,
    pub config: Arc<EngineConfig>,
}

impl EngineContext {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        directory: Arc<dyn WalletDirectory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            directory,
            config: Arc::new(config),
        }
    }
}

struct Running {
    root: CancellationToken,
    scheduler: JoinHandle<Vec<WalletStatus>>,
}

/// Start/stop handle around the scheduler.
pub struct Engine {
    ctx: EngineContext,
    registry: Registry,
    running: Mutex<Option<Running>>,
}

impl Engine {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            registry: Registry::default(),
            running: Mutex::new(None),
        }
    }

    /// Spawn the scheduler. Returns `false` if already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return false;
        }

        let root = CancellationToken::new();
        let scheduler = Scheduler::new(self.ctx.clone(), self.registry.clone(), root.clone());
        info!(
            mode = %self.ctx.config.mode,
            dry_run = self.ctx.config.dry_run,
            "Starting replication engine"
        );

        *running = Some(Running {
            root,
            scheduler: tokio::spawn(scheduler.run()),
        });
        true
    }

    /// Cancel the scheduler and every wallet task, releasing all
    /// subscriptions. Returns the tasks' final status; empty when not running.
    pub async fn stop(&self) -> Vec<WalletStatus> {
        let Some(running) = self.running.lock().await.take() else {
            return Vec::new();
        };

        info!("Stopping replication engine");
        running.root.cancel();
        match running.scheduler.await {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!(error = %e, "Scheduler ended abnormally");
                Vec::new()
            }
        }
    }

    #[cfg(test)]
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Per-wallet status, sorted by address.
    pub async fn status(&self) -> Vec<WalletStatus> {
        let registry = self.registry.read().await;
        let mut statuses: Vec<WalletStatus> = registry
            .values()
            .map(|handle| handle.status.borrow().clone())
            .collect();
        statuses.sort_by(|a, b| a.address.cmp(&b.address));
        statuses
    }
}
