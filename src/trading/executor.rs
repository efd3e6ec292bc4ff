//! Execution coordinator: turns a sized order into exactly one submitted transfer.

use std::sync::Arc;

use tracing::{info, warn};

use crate::ledger::LedgerClient;
use crate::models::{ErrorKind, ExecutionResult, ReplicationOrder};

pub struct ExecutionCoordinator {
    ledger: Arc<dyn LedgerClient>,
    dry_run: bool,
}

impl ExecutionCoordinator {
    pub fn new(ledger: Arc<dyn LedgerClient>, dry_run: bool) -> Self {
        Self { ledger, dry_run }
    }

    /// Validate, re-check funds and submit once. Never retries.
    pub async fn execute(&self, order: &ReplicationOrder) -> ExecutionResult {
        if !self.ledger.is_valid_address(&order.recipient) {
            warn!(recipient = %order.recipient, "Refusing order to invalid recipient");
            return ExecutionResult::failure(
                order,
                ErrorKind::InvalidAddress,
                format!("Invalid recipient {}", order.recipient),
            );
        }

        let own = self.ledger.own_address();
        let balance = match self.ledger.get_balance(&own, order.token_id.clone()).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(error = %e, "Balance re-check failed");
                return ExecutionResult::failure(order, e.kind(), e.to_string());
            }
        };

        if balance < order.amount {
            warn!(
                asset = %order.asset(),
                balance = %balance,
                amount = %order.amount,
                "Insufficient balance for order"
            );
            return ExecutionResult::failure(
                order,
                ErrorKind::InsufficientBalance,
                format!("Balance {} below order amount {}", balance, order.amount),
            );
        }

        if self.dry_run {
            info!(
                recipient = %order.recipient,
                amount = %order.amount,
                asset = %order.asset(),
                "[DRY RUN] Would submit transfer"
            );
            return ExecutionResult::simulated(order);
        }

        match self
            .ledger
            .submit_transfer(&order.recipient, order.amount, order.token_id.clone())
            .await
        {
            Ok(receipt) => {
                info!(
                    recipient = %order.recipient,
                    amount = %order.amount,
                    asset = %order.asset(),
                    transfer_id = %receipt.transfer_id,
                    "Replicated transfer"
                );
                ExecutionResult::success(order, receipt.transfer_id)
            }
            Err(e) => {
                warn!(recipient = %order.recipient, error = %e, "Transfer submission failed");
                ExecutionResult::failure(order, e.kind(), e.to_string())
            }
        }
    }
}
