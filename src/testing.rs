//! In-memory ledger and directory for engine tests.
//!
//! Deterministic and fully controllable from test code: balances, history,
//! push notifications and injected failures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::WalletDirectory;
use crate::ledger::{
    BalanceEntry, LedgerClient, LedgerError, Subscription, TransferDetail, TransferInstruction,
    TransferReceipt, TransferRef,
};
use crate::models::{MonitoredWallet, TokenId};

pub const OWN_ADDRESS: &str = "controller";

type BalanceKey = (String, Option<TokenId>);

#[derive(Default)]
struct LedgerState {
    /// Successive reads pop values; the last one sticks
    balances: HashMap<BalanceKey, VecDeque<Decimal>>,
    /// Newest first, per wallet
    history: HashMap<String, Vec<TransferRef>>,
    details: HashMap<String, TransferDetail>,
    subscribers: HashMap<String, Vec<mpsc::Sender<Value>>>,
    subscribe_calls: HashMap<String, usize>,
    fail_subscribe: usize,
    /// Subscriptions whose channel is closed before anything is delivered
    close_on_subscribe: bool,
    fail_history: usize,
    fail_details: usize,
    slow_details: usize,
    detail_delay: Duration,
    panic_on_detail: Option<String>,
    submitted: Vec<(String, Decimal, Option<TokenId>)>,
    slot: u64,
}

/// A fake ledger.
///
/// Addresses starting with `invalid` fail validation. The controlled wallet
/// is [`OWN_ADDRESS`].
#[derive(Default)]
pub struct FakeLedger {
    state: Mutex<LedgerState>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, owner: &str, token_id: Option<TokenId>, amount: Decimal) {
        self.script_balances(owner, token_id, vec![amount]);
    }

    /// Return `values` on successive balance reads, then keep the last.
    pub fn script_balances(&self, owner: &str, token_id: Option<TokenId>, values: Vec<Decimal>) {
        let mut state = self.state.lock().unwrap();
        state
            .balances
            .insert((owner.to_string(), token_id), values.into_iter().collect());
    }

    /// Record a confirmed native transfer from `wallet` in its history.
    pub fn add_transfer(
        &self,
        wallet: &str,
        signature: &str,
        recipient: &str,
        amount: Decimal,
        balance_before: Decimal,
    ) {
        let mut state = self.state.lock().unwrap();
        state.slot += 1;
        let slot = state.slot;

        state.history.entry(wallet.to_string()).or_default().insert(
            0,
            TransferRef {
                signature: signature.to_string(),
                slot,
                block_time: None,
                failed: false,
            },
        );
        state.details.insert(
            signature.to_string(),
            TransferDetail {
                signature: signature.to_string(),
                slot,
                failed: false,
                instructions: vec![TransferInstruction {
                    kind: Some("transfer".to_string()),
                    source: Some(wallet.to_string()),
                    recipient: Some(recipient.to_string()),
                    amount: Some(amount),
                    token_id: None,
                }],
                balances_before: vec![BalanceEntry {
                    owner: wallet.to_string(),
                    token_id: None,
                    amount: balance_before,
                }],
            },
        );
    }

    /// Push a `logsNotification` for `signature` to every open subscription of `wallet`.
    pub fn notify(&self, wallet: &str, signature: &str) {
        let state = self.state.lock().unwrap();
        let raw = json!({
            "jsonrpc": "2.0",
            "method": "logsNotification",
            "params": {
                "result": {
                    "context": {"slot": state.slot},
                    "value": {"signature": signature, "err": null, "logs": []}
                },
                "subscription": 1
            }
        });
        if let Some(senders) = state.subscribers.get(wallet) {
            for tx in senders {
                let _ = tx.try_send(raw.clone());
            }
        }
    }

    /// Drop the producer side of every subscription of `wallet`.
    pub fn close_subscriptions(&self, wallet: &str) {
        self.state.lock().unwrap().subscribers.remove(wallet);
    }

    pub fn active_subscriptions(&self, wallet: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .get(wallet)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn subscribe_calls(&self, wallet: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscribe_calls
            .get(wallet)
            .copied()
            .unwrap_or(0)
    }

    /// Fail the next `n` subscribe calls.
    pub fn fail_subscribe(&self, n: usize) {
        self.state.lock().unwrap().fail_subscribe = n;
    }

    /// Fail the next `n` transaction detail lookups.
    pub fn fail_details(&self, n: usize) {
        self.state.lock().unwrap().fail_details = n;
    }

    /// Hand out subscriptions that are already closed.
    pub fn close_on_subscribe(&self, close: bool) {
        self.state.lock().unwrap().close_on_subscribe = close;
    }

    /// Fail the next `n` history reads.
    pub fn fail_history(&self, n: usize) {
        self.state.lock().unwrap().fail_history = n;
    }

    /// Delay the next `n` detail lookups by `delay`.
    pub fn slow_details(&self, n: usize, delay: Duration) {
        let mut state = self.state.lock().unwrap();
        state.slow_details = n;
        state.detail_delay = delay;
    }

    /// Panic the caller when `signature` is looked up.
    pub fn panic_on_detail(&self, signature: &str) {
        self.state.lock().unwrap().panic_on_detail = Some(signature.to_string());
    }

    pub fn submitted(&self) -> Vec<(String, Decimal, Option<TokenId>)> {
        self.state.lock().unwrap().submitted.clone()
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    fn is_valid_address(&self, address: &str) -> bool {
        let address = address.trim();
        !address.is_empty() && !address.starts_with("invalid")
    }

    fn own_address(&self) -> String {
        OWN_ADDRESS.to_string()
    }

    async fn get_balance(
        &self,
        address: &str,
        token_id: Option<TokenId>,
    ) -> Result<Decimal, LedgerError> {
        let mut state = self.state.lock().unwrap();
        let Some(values) = state.balances.get_mut(&(address.to_string(), token_id)) else {
            return Ok(Decimal::ZERO);
        };
        let value = if values.len() > 1 {
            values.pop_front()
        } else {
            values.front().copied()
        };
        Ok(value.unwrap_or(Decimal::ZERO))
    }

    async fn get_recent_transfers(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<TransferRef>, LedgerError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_history > 0 {
            state.fail_history -= 1;
            return Err(LedgerError::Unavailable("injected history failure".into()));
        }
        Ok(state
            .history
            .get(address)
            .map(|h| h.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_transfer_detail(
        &self,
        signature: &str,
    ) -> Result<Option<TransferDetail>, LedgerError> {
        let (delay, panics, detail) = {
            let mut state = self.state.lock().unwrap();
            if state.fail_details > 0 {
                state.fail_details -= 1;
                return Err(LedgerError::Unavailable("injected detail failure".into()));
            }
            let delay = if state.slow_details > 0 {
                state.slow_details -= 1;
                Some(state.detail_delay)
            } else {
                None
            };
            let panics = state.panic_on_detail.as_deref() == Some(signature);
            (delay, panics, state.details.get(signature).cloned())
        };

        if panics {
            panic!("injected panic looking up {}", signature);
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(detail)
    }

    async fn submit_transfer(
        &self,
        recipient: &str,
        amount: Decimal,
        token_id: Option<TokenId>,
    ) -> Result<TransferReceipt, LedgerError> {
        let mut state = self.state.lock().unwrap();
        if let Some(values) = state
            .balances
            .get_mut(&(OWN_ADDRESS.to_string(), token_id.clone()))
        {
            if let Some(last) = values.back_mut() {
                *last -= amount;
            }
        }
        state
            .submitted
            .push((recipient.to_string(), amount, token_id));
        Ok(TransferReceipt {
            transfer_id: format!("fake-tx-{}", state.submitted.len()),
        })
    }

    async fn subscribe(&self, address: &str) -> Result<Subscription, LedgerError> {
        let mut state = self.state.lock().unwrap();
        *state.subscribe_calls.entry(address.to_string()).or_default() += 1;
        if state.fail_subscribe > 0 {
            state.fail_subscribe -= 1;
            return Err(LedgerError::Unavailable("injected subscribe failure".into()));
        }

        let (tx, rx) = mpsc::channel(16);
        if state.close_on_subscribe {
            drop(tx);
            return Ok(Subscription::new(rx, CancellationToken::new()));
        }
        state
            .subscribers
            .entry(address.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx, CancellationToken::new()))
    }
}

/// In-memory wallet directory.
#[derive(Default)]
pub struct MemoryDirectory {
    wallets: Mutex<Vec<MonitoredWallet>>,
    fail_next: AtomicBool,
}

impl MemoryDirectory {
    pub fn with_wallets(wallets: Vec<MonitoredWallet>) -> Self {
        Self {
            wallets: Mutex::new(wallets),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn add(&self, wallet: MonitoredWallet) {
        self.wallets.lock().unwrap().push(wallet);
    }

    pub fn remove(&self, address: &str) {
        self.wallets
            .lock()
            .unwrap()
            .retain(|w| w.address.trim() != address.trim());
    }

    /// Make the next listing fail.
    pub fn fail_next_list(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl WalletDirectory for MemoryDirectory {
    async fn list_wallets(&self) -> Result<Vec<MonitoredWallet>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("directory unavailable"));
        }
        Ok(self.wallets.lock().unwrap().clone())
    }
}
