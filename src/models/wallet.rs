//! Monitored wallet model: an external wallet whose transfers we mirror.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Allocation given to a wallet when none is specified.
pub const DEFAULT_ALLOCATION: Decimal = dec!(10);

/// Upper bound for an allocation percentage.
pub const MAX_ALLOCATION: Decimal = dec!(100);

/// A wallet listed in the directory, as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredWallet {
    /// Base58 wallet address
    pub address: String,

    /// Share of our own balance eligible for mirroring this wallet (0 to 100)
    #[serde(default = "default_allocation")]
    pub allocation_percentage: Decimal,
}

fn default_allocation() -> Decimal {
    DEFAULT_ALLOCATION
}

impl MonitoredWallet {
    /// Create a wallet entry, clamping the allocation into [0, 100].
    pub fn new(address: impl Into<String>, allocation_percentage: Decimal) -> Self {
        Self {
            address: address.into().trim().to_string(),
            allocation_percentage: clamp_allocation(allocation_percentage),
        }
    }

    /// Get display name (truncated address).
    pub fn display_name(&self) -> String {
        short_address(&self.address)
    }
}

/// Whether a percentage lies inside the accepted allocation range.
pub fn is_valid_allocation(percentage: Decimal) -> bool {
    percentage >= Decimal::ZERO && percentage <= MAX_ALLOCATION
}

/// Clamp a percentage into [0, 100].
pub fn clamp_allocation(percentage: Decimal) -> Decimal {
    percentage.max(Decimal::ZERO).min(MAX_ALLOCATION)
}

/// Shorten an address for logs and tables.
pub fn short_address(address: &str) -> String {
    if address.len() <= 10 {
        return address.to_string();
    }
    match (address.get(..4), address.get(address.len() - 4..)) {
        (Some(head), Some(tail)) => format!("{}...{}", head, tail),
        _ => address.to_string(),
    }
}
