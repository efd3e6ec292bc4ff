//! Deadline decorator: bounds every ledger call with the configured timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::debug;

use crate::models::TokenId;

use super::{
    LedgerClient, LedgerError, Subscription, TransferDetail, TransferReceipt, TransferRef,
};

/// Wraps a ledger client and fails any call exceeding `timeout`.
pub struct TimeoutLedger {
    inner: Arc<dyn LedgerClient>,
    timeout: Duration,
}

impl TimeoutLedger {
    pub fn new(inner: Arc<dyn LedgerClient>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        call: &'static str,
        fut: impl Future<Output = Result<T, LedgerError>>,
    ) -> Result<T, LedgerError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                debug!(call, timeout = ?self.timeout, "Ledger call timed out");
                Err(LedgerError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl LedgerClient for TimeoutLedger {
    fn is_valid_address(&self, address: &str) -> bool {
        self.inner.is_valid_address(address)
    }

    fn own_address(&self) -> String {
        self.inner.own_address()
    }

    async fn get_balance(
        &self,
        address: &str,
        token_id: Option<TokenId>,
    ) -> Result<Decimal, LedgerError> {
        self.bounded("get_balance", self.inner.get_balance(address, token_id))
            .await
    }

    async fn get_recent_transfers(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<TransferRef>, LedgerError> {
        self.bounded(
            "get_recent_transfers",
            self.inner.get_recent_transfers(address, limit),
        )
        .await
    }

    async fn get_transfer_detail(
        &self,
        signature: &str,
    ) -> Result<Option<TransferDetail>, LedgerError> {
        self.bounded(
            "get_transfer_detail",
            self.inner.get_transfer_detail(signature),
        )
        .await
    }

    async fn submit_transfer(
        &self,
        recipient: &str,
        amount: Decimal,
        token_id: Option<TokenId>,
    ) -> Result<TransferReceipt, LedgerError> {
        self.bounded(
            "submit_transfer",
            self.inner.submit_transfer(recipient, amount, token_id),
        )
        .await
    }

    async fn subscribe(&self, address: &str) -> Result<Subscription, LedgerError> {
        self.bounded("subscribe", self.inner.subscribe(address)).await
    }
}
