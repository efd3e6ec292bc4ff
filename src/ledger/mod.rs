//! Ledger access layer: the capability the engine consumes, plus the Solana
//! JSON-RPC/WebSocket implementation of it.

mod pubsub;
mod rpc_client;
mod timeout;
mod types;

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::models::{ErrorKind, TokenId};

pub use rpc_client::{RpcLedger, RpcLedgerConfig, DEFAULT_RPC_URL};
pub use timeout::TimeoutLedger;

/// Errors surfaced by a ledger client.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Ledger call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transfer submission failed: {0}")]
    SubmissionFailed(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAddress(_) => ErrorKind::InvalidAddress,
            LedgerError::Unavailable(_) => ErrorKind::LedgerUnavailable,
            LedgerError::Timeout(_) => ErrorKind::Timeout,
            LedgerError::SubmissionFailed(_) => ErrorKind::SubmissionFailed,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

/// Entry of a wallet's transaction history, most recent first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRef {
    pub signature: String,
    pub slot: u64,
    /// Unix timestamp, when the ledger knows it
    pub block_time: Option<i64>,
    /// The transaction landed but failed
    pub failed: bool,
}

/// One instruction of a transaction, as far as the ledger could parse it.
///
/// Every field is optional: the detector decides what counts as a transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInstruction {
    /// Instruction type, e.g. `transfer` or `transferChecked`
    pub kind: Option<String>,
    /// Owner of the debited funds
    pub source: Option<String>,
    /// Owner of the credited funds
    pub recipient: Option<String>,
    /// Amount in asset units
    pub amount: Option<Decimal>,
    /// Mint for token instructions
    pub token_id: Option<TokenId>,
}

/// Balance an account owner held before the transaction executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub owner: String,
    pub token_id: Option<TokenId>,
    pub amount: Decimal,
}

/// Parsed content of a confirmed transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDetail {
    pub signature: String,
    pub slot: u64,
    pub failed: bool,
    pub instructions: Vec<TransferInstruction>,
    pub balances_before: Vec<BalanceEntry>,
}

impl TransferDetail {
    /// Pre-transaction balance of `owner` for the given asset.
    pub fn balance_before(&self, owner: &str, token_id: Option<&TokenId>) -> Option<Decimal> {
        self.balances_before
            .iter()
            .find(|b| b.owner == owner && b.token_id.as_ref() == token_id)
            .map(|b| b.amount)
    }
}

/// Receipt for an accepted transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub transfer_id: String,
}

/// Cancellable channel of raw account notifications.
///
/// Yields until the producer closes it. Dropping the subscription cancels the
/// producer, which releases the underlying connection.
pub struct Subscription {
    rx: mpsc::Receiver<serde_json::Value>,
    _guard: DropGuard,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<serde_json::Value>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            _guard: cancel.drop_guard(),
        }
    }

    /// Next raw notification; `None` once the channel closed.
    pub async fn next(&mut self) -> Option<serde_json::Value> {
        self.rx.recv().await
    }
}

/// Everything the replication engine needs from the ledger.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Check address format without touching the network.
    fn is_valid_address(&self, address: &str) -> bool;

    /// Address of the controlled wallet we trade from.
    fn own_address(&self) -> String;

    /// SOL balance, or the balance of `token_id` when given.
    async fn get_balance(
        &self,
        address: &str,
        token_id: Option<TokenId>,
    ) -> Result<Decimal, LedgerError>;

    /// Most recent transactions touching `address`, newest first.
    async fn get_recent_transfers(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<TransferRef>, LedgerError>;

    /// Parsed transaction, or `None` if the ledger does not know it (yet).
    async fn get_transfer_detail(
        &self,
        signature: &str,
    ) -> Result<Option<TransferDetail>, LedgerError>;

    /// Send `amount` of SOL (or of `token_id`) from the controlled wallet.
    async fn submit_transfer(
        &self,
        recipient: &str,
        amount: Decimal,
        token_id: Option<TokenId>,
    ) -> Result<TransferReceipt, LedgerError>;

    /// Open a push channel of account notifications for `address`.
    async fn subscribe(&self, address: &str) -> Result<Subscription, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            LedgerError::Unavailable("503".into()).kind(),
            ErrorKind::LedgerUnavailable
        );
        assert!(LedgerError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!LedgerError::SubmissionFailed("rejected".into()).is_transient());
        assert!(!LedgerError::InvalidAddress("x".into()).is_transient());
    }

    #[test]
    fn test_balance_before_matches_asset() {
        let mint = TokenId::new("mint");
        let detail = TransferDetail {
            balances_before: vec![
                BalanceEntry { owner: "a".into(), token_id: None, amount: dec!(3) },
                BalanceEntry { owner: "a".into(), token_id: Some(mint.clone()), amount: dec!(70) },
            ],
            ..Default::default()
        };

        assert_eq!(detail.balance_before("a", None), Some(dec!(3)));
        assert_eq!(detail.balance_before("a", Some(&mint)), Some(dec!(70)));
        assert_eq!(detail.balance_before("b", None), None);
    }

    #[tokio::test]
    async fn test_dropping_subscription_cancels_producer() {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let mut sub = Subscription::new(rx, cancel.clone());

        tx.send(serde_json::json!({"n": 1})).await.unwrap();
        assert_eq!(sub.next().await, Some(serde_json::json!({"n": 1})));
        assert!(!cancel.is_cancelled());

        drop(sub);
        assert!(cancel.is_cancelled());
    }
}
