//! Transfer models: what we observed on a watched wallet and what we send in response.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Token mint address. Absent token ids mean the native asset (SOL).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub String);

impl TokenId {
    pub fn new(mint: impl Into<String>) -> Self {
        Self(mint.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Human readable asset label for logs.
pub fn asset_label(token_id: Option<&TokenId>) -> String {
    token_id
        .map(|t| super::wallet::short_address(t.as_str()))
        .unwrap_or_else(|| "SOL".to_string())
}

/// An outgoing transfer detected on a monitored wallet.
///
/// Built only by the detector, and only from explicit ledger data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedTransfer {
    /// Wallet being mirrored
    pub source_wallet: String,

    /// Where the source wallet sent funds
    pub recipient: String,

    /// Amount sent, in asset units (SOL or UI token amount)
    pub amount: Decimal,

    /// Mint for token transfers, `None` for SOL
    pub token_id: Option<TokenId>,

    /// Source wallet's balance of the asset right before the transfer
    pub source_balance_at_event: Decimal,

    /// Transaction signature carrying the transfer
    pub signature: String,

    /// Ledger slot of the transaction
    pub slot: u64,

    /// When we detected it
    pub observed_at: DateTime<Utc>,
}

impl ObservedTransfer {
    /// Asset label for logs.
    pub fn asset(&self) -> String {
        asset_label(self.token_id.as_ref())
    }
}

/// A sized transfer we intend to send from the controlled wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationOrder {
    pub recipient: String,
    pub amount: Decimal,
    pub token_id: Option<TokenId>,
}

impl ReplicationOrder {
    /// Build the order mirroring an observed transfer.
    pub fn mirror(transfer: &ObservedTransfer, amount: Decimal) -> Self {
        Self {
            recipient: transfer.recipient.clone(),
            amount: amount.max(Decimal::ZERO),
            token_id: transfer.token_id.clone(),
        }
    }

    pub fn asset(&self) -> String {
        asset_label(self.token_id.as_ref())
    }
}
