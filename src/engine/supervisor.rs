//! Wallet task: one per monitored wallet, owning its detection, sizing and
//! execution pipeline together with its subscription state machine.

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{
    ErrorKind, ObservedTransfer, Outcome, Phase, ReplicationOrder, WalletStatus,
};
use crate::trading::{
    ExecutionCoordinator, PollDetector, PositionSizer, PushDetector, PushEvent, SizingDecision,
};

use super::reconnect::Reconnector;
use super::{DetectionMode, DirectorySnapshot, EngineContext};

/// Scheduler-side handle of a running wallet task.
pub struct TaskHandle {
    pub cancel: CancellationToken,
    pub join: JoinHandle<()>,
    pub status: watch::Receiver<WalletStatus>,
    pub revive: Arc<Notify>,
}

/// Why a detector loop returned.
enum Exit {
    Cancelled,
    Failed(ErrorKind),
}

pub struct WalletTask {
    address: String,
    ctx: EngineContext,
    snapshot: watch::Receiver<Arc<DirectorySnapshot>>,
    status: watch::Sender<WalletStatus>,
    cancel: CancellationToken,
    revive: Arc<Notify>,
    sizer: PositionSizer,
    coordinator: ExecutionCoordinator,
    reconnector: Reconnector,
    push: PushDetector,
    poll: PollDetector,
}

impl WalletTask {
    /// Spawn the task for `address` and return its handle.
    pub fn spawn(
        address: String,
        ctx: EngineContext,
        snapshot: watch::Receiver<Arc<DirectorySnapshot>>,
        cancel: CancellationToken,
    ) -> TaskHandle {
        let (status_tx, status_rx) = watch::channel(WalletStatus::new(address.clone()));
        let revive = Arc::new(Notify::new());

        let task = WalletTask {
            sizer: PositionSizer::new(ctx.config.sizing.clone()),
            coordinator: ExecutionCoordinator::new(ctx.ledger.clone(), ctx.config.dry_run),
            reconnector: Reconnector::new(&ctx.config.reconnect),
            push: PushDetector::new(),
            poll: PollDetector::new(ctx.config.history_limit),
            address,
            ctx,
            snapshot,
            status: status_tx,
            cancel: cancel.clone(),
            revive: revive.clone(),
        };

        TaskHandle {
            cancel,
            join: tokio::spawn(task.run()),
            status: status_rx,
            revive,
        }
    }

    async fn run(mut self) {
        info!(wallet = %self.address, mode = %self.ctx.config.mode, "Wallet task started");

        if !self.ctx.ledger.is_valid_address(&self.address) {
            warn!(wallet = %self.address, "Invalid wallet address, not monitoring");
            self.update(|s| s.state.fail(ErrorKind::InvalidAddress));
            self.cancel.cancelled().await;
        } else {
            loop {
                let exit = match self.ctx.config.mode {
                    DetectionMode::Push => self.run_push().await,
                    DetectionMode::Poll => self.run_poll().await,
                };

                match exit {
                    Exit::Cancelled => break,
                    Exit::Failed(kind) => {
                        warn!(wallet = %self.address, error = %kind, "Wallet task failed");
                        self.update(|s| s.state.fail(kind));
                        if !self.wait_for_revival().await {
                            break;
                        }
                    }
                }
            }
        }

        self.update(|s| s.state.remove());
        info!(wallet = %self.address, "Wallet task stopped");
    }

    /// Park in `Failed` until revived (`true`) or cancelled (`false`).
    async fn wait_for_revival(&mut self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = self.revive.notified() => {
                info!(wallet = %self.address, "Reviving wallet task");
                self.reconnector.reset();
                self.update(|s| s.state.revive());
                true
            }
        }
    }

    async fn run_push(&mut self) -> Exit {
        loop {
            self.update(|s| s.state.connecting(Phase::Subscribing));

            let subscribed = tokio::select! {
                _ = self.cancel.cancelled() => return Exit::Cancelled,
                result = self.ctx.ledger.subscribe(&self.address) => result,
            };

            let (kind, reason) = match subscribed {
                Ok(mut subscription) => {
                    info!(wallet = %self.address, "Subscribed to wallet activity");
                    self.update(|s| s.state.activate());
                    // Budget is only restored once the subscription delivers.
                    let mut delivered = false;

                    loop {
                        if self.push.has_pending() {
                            let resumed = tokio::select! {
                                _ = self.cancel.cancelled() => return Exit::Cancelled,
                                result = self.push.resume(self.ctx.ledger.as_ref(), &self.address) => result,
                            };
                            match resumed {
                                Ok(events) => {
                                    self.confirm_delivery(&mut delivered);
                                    if self.process(events).await.is_break() {
                                        return Exit::Cancelled;
                                    }
                                }
                                Err(e) => {
                                    delivered = false;
                                    if let Some(exit) = self.back_off(e.kind(), &e.to_string()).await {
                                        return exit;
                                    }
                                }
                            }
                            continue;
                        }

                        let raw = tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return Exit::Cancelled,
                            raw = subscription.next() => raw,
                        };
                        let Some(raw) = raw else {
                            break (ErrorKind::LedgerUnavailable, "subscription channel closed".to_string());
                        };

                        let event = self
                            .push
                            .on_notification(self.ctx.ledger.as_ref(), &self.address, &raw)
                            .await;
                        match event {
                            PushEvent::Transfers(events) => {
                                self.confirm_delivery(&mut delivered);
                                if self.process(events).await.is_break() {
                                    return Exit::Cancelled;
                                }
                            }
                            PushEvent::Nothing => self.confirm_delivery(&mut delivered),
                            PushEvent::Stalled(e) => {
                                delivered = false;
                                if let Some(exit) = self.back_off(e.kind(), &e.to_string()).await {
                                    return exit;
                                }
                            }
                            PushEvent::Disconnected(reason) => {
                                break (ErrorKind::LedgerUnavailable, reason);
                            }
                        }
                    }
                }
                Err(e) => (e.kind(), e.to_string()),
            };

            if let Some(exit) = self.back_off(kind, &reason).await {
                return exit;
            }
        }
    }

    /// First good delivery since (re)subscribing or a stall.
    fn confirm_delivery(&mut self, delivered: &mut bool) {
        if *delivered {
            return;
        }
        *delivered = true;
        self.reconnector.reset();
        self.update(|s| {
            s.state.activate();
            s.state.confirm();
        });
    }

    async fn run_poll(&mut self) -> Exit {
        let mut ticker = interval(self.ctx.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if !self.poll.has_baseline() {
            self.update(|s| s.state.connecting(Phase::Polling));
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Exit::Cancelled,
                _ = ticker.tick() => {}
            }

            let polled = tokio::select! {
                _ = self.cancel.cancelled() => return Exit::Cancelled,
                result = self.poll.poll(self.ctx.ledger.as_ref(), &self.address) => result,
            };

            match polled {
                Ok(events) => {
                    if self.status.borrow().state.phase != Phase::Active {
                        self.reconnector.reset();
                        self.update(|s| {
                            s.state.activate();
                            s.state.confirm();
                        });
                        info!(wallet = %self.address, cursor = ?self.poll.cursor(), "Polling wallet history");
                    }
                    if self.process(events).await.is_break() {
                        return Exit::Cancelled;
                    }
                }
                Err(e) => {
                    if let Some(exit) = self.back_off(e.kind(), &e.to_string()).await {
                        return exit;
                    }
                    ticker.reset();
                }
            }
        }
    }

    /// Sleep out the next backoff delay. `Some` means stop trying.
    async fn back_off(&mut self, kind: ErrorKind, reason: &str) -> Option<Exit> {
        if !kind.is_transient() {
            return Some(Exit::Failed(kind));
        }

        let Some(delay) = self.reconnector.next_delay() else {
            return Some(Exit::Failed(kind));
        };

        let attempt = self.reconnector.attempts();
        warn!(
            wallet = %self.address,
            error = %kind,
            reason,
            attempt,
            retry_in = ?delay,
            "Detector failed, retrying"
        );
        self.update(|s| s.state.reconnect(kind, delay, attempt));

        tokio::select! {
            _ = self.cancel.cancelled() => Some(Exit::Cancelled),
            _ = tokio::time::sleep(delay) => None,
        }
    }

    /// Run events through sizing and execution, one at a time, in order.
    async fn process(&mut self, events: Vec<ObservedTransfer>) -> ControlFlow<()> {
        for event in events {
            if self.cancel.is_cancelled() {
                return ControlFlow::Break(());
            }
            self.handle_event(event).await;
        }
        ControlFlow::Continue(())
    }

    async fn handle_event(&mut self, event: ObservedTransfer) {
        self.update(|s| s.transfers_observed += 1);
        info!(
            wallet = %self.address,
            recipient = %event.recipient,
            amount = %event.amount,
            asset = %event.asset(),
            signature = %event.signature,
            "Observed outgoing transfer"
        );

        let allocation = self.snapshot.borrow().allocation(&self.address);
        let Some(allocation) = allocation else {
            debug!(wallet = %self.address, "Wallet not in directory snapshot, skipping");
            self.update(|s| s.orders_skipped += 1);
            return;
        };

        let own_address = self.ctx.ledger.own_address();
        let own_balance = match self
            .ctx
            .ledger
            .get_balance(&own_address, event.token_id.clone())
            .await
        {
            Ok(balance) => balance,
            Err(e) => {
                warn!(wallet = %self.address, error = %e, "Could not read own balance, skipping");
                self.update(|s| s.orders_skipped += 1);
                return;
            }
        };

        let amount = match self.sizer.size(
            own_balance,
            allocation,
            event.amount,
            event.source_balance_at_event,
        ) {
            SizingDecision::Replicate(amount) => amount,
            SizingDecision::Skip(reason) => {
                debug!(wallet = %self.address, signature = %event.signature, %reason, "Sizing skipped transfer");
                self.update(|s| s.orders_skipped += 1);
                return;
            }
        };

        let order = ReplicationOrder::mirror(&event, amount);
        let result = self.coordinator.execute(&order).await;

        self.update(|s| {
            match (result.outcome, result.error_kind) {
                (Outcome::Failure, Some(ErrorKind::InsufficientBalance)) => s.orders_skipped += 1,
                (Outcome::Failure, _) => s.orders_failed += 1,
                (Outcome::Success | Outcome::Simulated, _) => s.orders_executed += 1,
            }
            s.last_result = Some(result);
        });
    }

    fn update(&self, f: impl FnOnce(&mut WalletStatus)) {
        self.status.send_modify(f);
    }
}
