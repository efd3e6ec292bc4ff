//! Proportional position sizing.
//!
//! amount = own_balance × (allocation / 100) × (observed / source_balance)

use std::fmt;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::models::clamp_allocation;

use super::SizingConfig;

/// Why no order was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Source wallet had nothing before the transfer
    NoSourceBalance,
    /// Observed transfer carried no value
    NoObservedAmount,
    /// Our wallet is empty
    NoOwnBalance,
    /// Allocation is 0%
    ZeroAllocation,
    /// Result smaller than the minimum order amount
    BelowMinimum,
    /// Decimal arithmetic overflowed
    Overflow,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoSourceBalance => "source balance not positive",
            SkipReason::NoObservedAmount => "observed amount not positive",
            SkipReason::NoOwnBalance => "own balance not positive",
            SkipReason::ZeroAllocation => "allocation is zero",
            SkipReason::BelowMinimum => "below minimum order amount",
            SkipReason::Overflow => "arithmetic overflow",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingDecision {
    Replicate(Decimal),
    Skip(SkipReason),
}

impl SizingDecision {
    #[cfg(test)]
    pub fn amount(&self) -> Option<Decimal> {
        match self {
            SizingDecision::Replicate(amount) => Some(*amount),
            SizingDecision::Skip(_) => None,
        }
    }
}

/// Pure proportional sizing.
///
/// Any non-positive input skips. The source ratio is not capped: a transfer
/// larger than the recorded balance scales up like any other. Use
/// `max_order_amount` for a ceiling.
pub fn size(
    own_balance: Decimal,
    allocation_percentage: Decimal,
    observed_amount: Decimal,
    source_balance_at_event: Decimal,
) -> SizingDecision {
    if source_balance_at_event <= Decimal::ZERO {
        return SizingDecision::Skip(SkipReason::NoSourceBalance);
    }
    if observed_amount <= Decimal::ZERO {
        return SizingDecision::Skip(SkipReason::NoObservedAmount);
    }
    if own_balance <= Decimal::ZERO {
        return SizingDecision::Skip(SkipReason::NoOwnBalance);
    }

    let allocation = clamp_allocation(allocation_percentage);
    if allocation.is_zero() {
        return SizingDecision::Skip(SkipReason::ZeroAllocation);
    }

    let amount = observed_amount
        .checked_div(source_balance_at_event)
        .and_then(|ratio| {
            own_balance
                .checked_mul(allocation)
                .and_then(|v| v.checked_div(dec!(100)))
                .and_then(|v| v.checked_mul(ratio))
        });

    match amount {
        Some(amount) => SizingDecision::Replicate(amount.max(Decimal::ZERO).normalize()),
        None => SizingDecision::Skip(SkipReason::Overflow),
    }
}

/// Sizer with order-size constraints.
#[derive(Debug, Clone, Default)]
pub struct PositionSizer {
    config: SizingConfig,
}

impl PositionSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    /// Size an order and apply min/max constraints.
    pub fn size(
        &self,
        own_balance: Decimal,
        allocation_percentage: Decimal,
        observed_amount: Decimal,
        source_balance_at_event: Decimal,
    ) -> SizingDecision {
        match size(
            own_balance,
            allocation_percentage,
            observed_amount,
            source_balance_at_event,
        ) {
            SizingDecision::Replicate(amount) => self.apply_constraints(amount),
            skip => skip,
        }
    }

    fn apply_constraints(&self, amount: Decimal) -> SizingDecision {
        let capped = match self.config.max_order_amount {
            Some(max) if max > Decimal::ZERO => amount.min(max),
            _ => amount,
        };

        if capped <= Decimal::ZERO || capped < self.config.min_order_amount {
            return SizingDecision::Skip(SkipReason::BelowMinimum);
        }

        SizingDecision::Replicate(capped)
    }
}
