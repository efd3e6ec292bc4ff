//! Execution outcomes and the error taxonomy shared by the engine.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::transfer::ReplicationOrder;

/// Classification of everything that can go wrong for a wallet or an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Address failed validation; fatal for the wallet
    InvalidAddress,
    /// Network or RPC error
    LedgerUnavailable,
    /// Ledger call exceeded its deadline
    Timeout,
    /// The ledger rejected our transfer
    SubmissionFailed,
    /// Our balance no longer covers the order
    InsufficientBalance,
}

impl ErrorKind {
    /// Transient errors are retried with backoff; the rest are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::LedgerUnavailable | ErrorKind::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidAddress => "invalid_address",
            ErrorKind::LedgerUnavailable => "ledger_unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SubmissionFailed => "submission_failed",
            ErrorKind::InsufficientBalance => "insufficient_balance",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an order ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Success,
    Failure,
    /// Dry run: every check passed but nothing was submitted
    Simulated,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::Failure => "FAILURE",
            Outcome::Simulated => "SIMULATED",
        }
    }
}

/// Result of executing one replication order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub outcome: Outcome,

    /// Ledger transfer id (transaction signature) on success
    pub transfer_id: Option<String>,

    /// Error classification on failure
    pub error_kind: Option<ErrorKind>,

    /// Failure detail for logs
    #[serde(default)]
    pub message: Option<String>,

    pub recipient: String,
    pub amount: Decimal,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn success(order: &ReplicationOrder, transfer_id: String) -> Self {
        Self {
            outcome: Outcome::Success,
            transfer_id: Some(transfer_id),
            error_kind: None,
            message: None,
            recipient: order.recipient.clone(),
            amount: order.amount,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(order: &ReplicationOrder, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failure,
            transfer_id: None,
            error_kind: Some(kind),
            message: Some(message.into()),
            recipient: order.recipient.clone(),
            amount: order.amount,
            completed_at: Utc::now(),
        }
    }

    pub fn simulated(order: &ReplicationOrder) -> Self {
        Self {
            outcome: Outcome::Simulated,
            transfer_id: None,
            error_kind: None,
            message: None,
            recipient: order.recipient.clone(),
            amount: order.amount,
            completed_at: Utc::now(),
        }
    }
}
