//! Sizing configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Constraints applied on top of proportional sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Orders below this amount are dust and skipped
    pub min_order_amount: Decimal,

    /// Optional ceiling for a single replicated order
    pub max_order_amount: Option<Decimal>,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            min_order_amount: dec!(0.000001), // 1000 lamports
            max_order_amount: None,
        }
    }
}
