//! Monitoring scheduler: keeps the set of wallet tasks in line with the directory.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::WalletStatus;

use super::supervisor::{TaskHandle, WalletTask};
use super::{DirectorySnapshot, EngineContext};

/// Running wallet tasks by trimmed address. Only the scheduler writes it.
pub type Registry = Arc<RwLock<HashMap<String, TaskHandle>>>;

/// What one reconciliation changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub revived: Vec<String>,
    /// Tasks that had ended on their own and were started again
    pub restarted: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty()
            && self.stopped.is_empty()
            && self.revived.is_empty()
            && self.restarted.is_empty()
    }
}

pub struct Scheduler {
    ctx: EngineContext,
    registry: Registry,
    snapshot: watch::Sender<Arc<DirectorySnapshot>>,
    root: CancellationToken,
}

impl Scheduler {
    pub fn new(ctx: EngineContext, registry: Registry, root: CancellationToken) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(DirectorySnapshot::default()));
        Self {
            ctx,
            registry,
            snapshot,
            root,
        }
    }

    /// Diff the directory against running tasks: start new wallets, stop
    /// removed ones, restart tasks that died, revive transient failures.
    ///
    /// A directory read failure leaves every task untouched.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let wallets = self.ctx.directory.list_wallets().await?;
        let snapshot = Arc::new(DirectorySnapshot::from_wallets(wallets));
        self.snapshot.send_replace(snapshot.clone());

        let mut report = ReconcileReport::default();
        let mut stopping = Vec::new();

        {
            let mut registry = self.registry.write().await;

            let removed: Vec<String> = registry
                .keys()
                .filter(|address| !snapshot.contains(address))
                .cloned()
                .collect();
            for address in removed {
                if let Some(handle) = registry.remove(&address) {
                    info!(wallet = %address, "Wallet left the directory, stopping task");
                    handle.cancel.cancel();
                    stopping.push(handle);
                    report.stopped.push(address);
                }
            }

            let dead: Vec<String> = registry
                .iter()
                .filter(|(_, handle)| handle.join.is_finished())
                .map(|(address, _)| address.clone())
                .collect();
            for address in dead {
                if let Some(handle) = registry.remove(&address) {
                    match handle.join.await {
                        Err(e) if e.is_panic() => {
                            warn!(wallet = %address, error = %e, "Wallet task panicked, restarting")
                        }
                        _ => warn!(wallet = %address, "Wallet task exited unexpectedly, restarting"),
                    }
                    report.restarted.push(address);
                }
            }

            for address in snapshot.addresses() {
                if registry.contains_key(address) {
                    continue;
                }
                if !report.restarted.contains(address) {
                    report.started.push(address.clone());
                }
                let handle = WalletTask::spawn(
                    address.clone(),
                    self.ctx.clone(),
                    self.snapshot.subscribe(),
                    self.root.child_token(),
                );
                registry.insert(address.clone(), handle);
            }

            for (address, handle) in registry.iter() {
                if handle.status.borrow().state.is_revivable() {
                    handle.revive.notify_one();
                    report.revived.push(address.clone());
                }
            }
        }

        for handle in stopping {
            if let Err(e) = handle.join.await {
                warn!(error = %e, "Wallet task ended abnormally");
            }
        }

        report.started.sort();
        report.stopped.sort();
        report.revived.sort();
        report.restarted.sort();
        Ok(report)
    }

    /// Reconcile on the configured cadence until the root token is cancelled,
    /// then stop every task and return their final status.
    pub async fn run(self) -> Vec<WalletStatus> {
        let mut ticker = interval(self.ctx.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.ctx.config.reconcile_interval, "Scheduler started");

        loop {
            tokio::select! {
                _ = self.root.cancelled() => break,
                _ = ticker.tick() => {
                    match self.reconcile().await {
                        Ok(report) if report.is_noop() => debug!("Reconciliation: no changes"),
                        Ok(report) => info!(
                            started = report.started.len(),
                            stopped = report.stopped.len(),
                            revived = report.revived.len(),
                            restarted = report.restarted.len(),
                            "Reconciliation applied"
                        ),
                        Err(e) => warn!(error = %e, "Directory read failed, keeping current tasks"),
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// Cancel and await every task.
    pub async fn shutdown(&self) -> Vec<WalletStatus> {
        let handles: Vec<TaskHandle> = {
            let mut registry = self.registry.write().await;
            registry.drain().map(|(_, handle)| handle).collect()
        };

        for handle in &handles {
            handle.cancel.cancel();
        }

        let mut statuses = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Err(e) = handle.join.await {
                warn!(error = %e, "Wallet task ended abnormally");
            }
            statuses.push(handle.status.borrow().clone());
        }
        statuses.sort_by(|a, b| a.address.cmp(&b.address));

        info!(tasks = statuses.len(), "Scheduler stopped");
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rust_decimal_macros::dec;

    use crate::engine::{DetectionMode, EngineConfig, ReconnectPolicy};
    use crate::models::{MonitoredWallet, Phase};
    use crate::testing::{FakeLedger, MemoryDirectory};

    fn setup(directory: Arc<MemoryDirectory>, ledger: Arc<FakeLedger>) -> Scheduler {
        let config = EngineConfig {
            mode: DetectionMode::Push,
            reconnect: ReconnectPolicy {
                jitter: 0.0,
                max_attempts: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let ctx = EngineContext::new(ledger, directory, config);
        Scheduler::new(ctx, Registry::default(), CancellationToken::new())
    }

    async fn phase_of(scheduler: &Scheduler, address: &str) -> Option<Phase> {
        let registry = scheduler.registry.read().await;
        registry.get(address).map(|h| h.status.borrow().state.phase)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_is_idempotent() {
        let directory = Arc::new(MemoryDirectory::with_wallets(vec![
            MonitoredWallet::new("walletA", dec!(10)),
            MonitoredWallet::new("walletB", dec!(10)),
        ]));
        let scheduler = setup(directory, Arc::new(FakeLedger::new()));

        let first = scheduler.reconcile().await.unwrap();
        assert_eq!(first.started, vec!["walletA".to_string(), "walletB".to_string()]);

        let second = scheduler.reconcile().await.unwrap();
        assert!(second.is_noop());
        assert_eq!(scheduler.registry.read().await.len(), 2);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_addresses_start_one_task() {
        let directory = Arc::new(MemoryDirectory::with_wallets(vec![
            MonitoredWallet::new("walletA", dec!(10)),
            MonitoredWallet::new(" walletA", dec!(30)),
        ]));
        let scheduler = setup(directory, Arc::new(FakeLedger::new()));

        let report = scheduler.reconcile().await.unwrap();
        assert_eq!(report.started, vec!["walletA".to_string()]);
        assert_eq!(scheduler.registry.read().await.len(), 1);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_wallet_task_ends_removed() {
        let directory = Arc::new(MemoryDirectory::with_wallets(vec![
            MonitoredWallet::new("walletA", dec!(10)),
            MonitoredWallet::new("walletB", dec!(10)),
        ]));
        let ledger = Arc::new(FakeLedger::new());
        let scheduler = setup(directory.clone(), ledger.clone());
        scheduler.reconcile().await.unwrap();

        let status = scheduler.registry.read().await["walletA"].status.clone();
        directory.remove("walletA");

        let report = scheduler.reconcile().await.unwrap();
        assert_eq!(report.stopped, vec!["walletA".to_string()]);
        // The task was awaited inside reconcile.
        assert_eq!(status.borrow().state.phase, Phase::Removed);
        assert_eq!(ledger.active_subscriptions("walletA"), 0);
        assert!(phase_of(&scheduler, "walletA").await.is_none());
        assert!(phase_of(&scheduler, "walletB").await.is_some());

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_directory_failure_keeps_tasks() {
        let directory = Arc::new(MemoryDirectory::with_wallets(vec![MonitoredWallet::new(
            "walletA",
            dec!(10),
        )]));
        let scheduler = setup(directory.clone(), Arc::new(FakeLedger::new()));
        scheduler.reconcile().await.unwrap();

        directory.fail_next_list();
        assert!(scheduler.reconcile().await.is_err());
        assert_eq!(scheduler.registry.read().await.len(), 1);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_task_is_revived() {
        let directory = Arc::new(MemoryDirectory::with_wallets(vec![MonitoredWallet::new(
            "walletA",
            dec!(10),
        )]));
        let ledger = Arc::new(FakeLedger::new());
        ledger.fail_subscribe(2);
        let scheduler = setup(directory, ledger.clone());
        scheduler.reconcile().await.unwrap();

        let mut status = scheduler.registry.read().await["walletA"].status.clone();
        status
            .wait_for(|s| s.state.phase == Phase::Failed)
            .await
            .unwrap();

        let report = scheduler.reconcile().await.unwrap();
        assert_eq!(report.revived, vec!["walletA".to_string()]);
        assert!(report.started.is_empty());

        status
            .wait_for(|s| s.state.phase == Phase::Active)
            .await
            .unwrap();

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_wallet_is_not_revived() {
        let directory = Arc::new(MemoryDirectory::with_wallets(vec![MonitoredWallet::new(
            "invalid-wallet",
            dec!(10),
        )]));
        let scheduler = setup(directory, Arc::new(FakeLedger::new()));
        scheduler.reconcile().await.unwrap();

        let mut status = scheduler.registry.read().await["invalid-wallet"].status.clone();
        status
            .wait_for(|s| s.state.phase == Phase::Failed)
            .await
            .unwrap();

        let report = scheduler.reconcile().await.unwrap();
        assert!(report.is_noop());

        let finals = scheduler.shutdown().await;
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].state.phase, Phase::Removed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let directory = Arc::new(MemoryDirectory::with_wallets(vec![MonitoredWallet::new(
            "walletA",
            dec!(10),
        )]));
        let scheduler = setup(directory, Arc::new(FakeLedger::new()));
        let registry = scheduler.registry.clone();
        let root = scheduler.root.clone();
        let run = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.read().await.len(), 1);

        root.cancel();
        let finals = run.await.unwrap();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].state.phase, Phase::Removed);
        assert!(registry.read().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicked_task_is_restarted() {
        let directory = Arc::new(MemoryDirectory::with_wallets(vec![MonitoredWallet::new(
            "walletA",
            dec!(10),
        )]));
        let ledger = Arc::new(FakeLedger::new());
        let scheduler = setup(directory, ledger.clone());
        scheduler.reconcile().await.unwrap();

        let mut status = scheduler.registry.read().await["walletA"].status.clone();
        status
            .wait_for(|s| s.state.phase == Phase::Active)
            .await
            .unwrap();

        ledger.panic_on_detail("boom");
        ledger.add_transfer("walletA", "boom", "dest", dec!(1), dec!(10));
        ledger.notify("walletA", "boom");
        while !scheduler.registry.read().await["walletA"].join.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let report = scheduler.reconcile().await.unwrap();
        assert_eq!(report.restarted, vec!["walletA".to_string()]);
        assert!(report.started.is_empty());

        let mut status = scheduler.registry.read().await["walletA"].status.clone();
        status
            .wait_for(|s| s.state.phase == Phase::Active)
            .await
            .unwrap();
        assert_eq!(ledger.subscribe_calls("walletA"), 2);

        // A healthy restarted task is left alone.
        assert!(scheduler.reconcile().await.unwrap().is_noop());

        scheduler.shutdown().await;
    }
}
