//! Per-wallet subscription state and the status snapshot exposed to operators.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::execution::{ErrorKind, ExecutionResult};
use super::wallet::short_address;

/// Lifecycle phase of a wallet task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Spawned, no detector attached yet
    Idle,
    /// Opening the push channel
    Subscribing,
    /// Running the first history poll
    Polling,
    /// Detector is producing events
    Active,
    /// Waiting out a backoff delay after a transient failure
    Reconnecting,
    /// Gave up; waits for the scheduler to revive it
    Failed,
    /// Wallet left the directory or the engine stopped
    Removed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Subscribing => "subscribing",
            Phase::Polling => "polling",
            Phase::Active => "active",
            Phase::Reconnecting => "reconnecting",
            Phase::Failed => "failed",
            Phase::Removed => "removed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Subscription state machine value, owned by exactly one wallet task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionState {
    pub phase: Phase,

    /// Consecutive failed connection/poll attempts since the last success
    pub reconnect_attempts: u32,

    /// Most recent failure classification
    pub last_error: Option<ErrorKind>,

    /// Backoff delay before the next attempt, while reconnecting
    pub retry_in: Option<Duration>,
}

impl SubscriptionState {
    pub fn idle() -> Self {
        Self {
            phase: Phase::Idle,
            reconnect_attempts: 0,
            last_error: None,
            retry_in: None,
        }
    }

    /// Detector attaching (subscribing or first poll).
    pub fn connecting(&mut self, phase: Phase) {
        self.phase = phase;
        self.retry_in = None;
    }

    /// Detector attached. Attempts are kept until it proves healthy.
    pub fn activate(&mut self) {
        self.phase = Phase::Active;
        self.retry_in = None;
    }

    /// First good delivery since attaching: attempts start over.
    pub fn confirm(&mut self) {
        self.reconnect_attempts = 0;
    }

    /// Transient failure; `attempt` of the budget runs after `delay`.
    pub fn reconnect(&mut self, kind: ErrorKind, delay: Duration, attempt: u32) {
        self.phase = Phase::Reconnecting;
        self.reconnect_attempts = attempt;
        self.last_error = Some(kind);
        self.retry_in = Some(delay);
    }

    pub fn fail(&mut self, kind: ErrorKind) {
        self.phase = Phase::Failed;
        self.last_error = Some(kind);
        self.retry_in = None;
    }

    /// Leaving `Failed` on scheduler request: attempts start over.
    pub fn revive(&mut self) {
        self.phase = Phase::Idle;
        self.reconnect_attempts = 0;
        self.retry_in = None;
    }

    pub fn remove(&mut self) {
        self.phase = Phase::Removed;
        self.retry_in = None;
    }

    /// Failed for a reason the next reconciliation may fix.
    pub fn is_revivable(&self) -> bool {
        self.phase == Phase::Failed
            && self.last_error.map(|k| k.is_transient()).unwrap_or(true)
    }
}

impl Default for SubscriptionState {
    fn default() -> Self {
        Self::idle()
    }
}

/// Status of one wallet task as reported to the operator.
#[derive(Debug, Clone, Serialize)]
pub struct WalletStatus {
    pub address: String,
    pub state: SubscriptionState,
    pub last_result: Option<ExecutionResult>,
    pub transfers_observed: u64,
    pub orders_executed: u64,
    pub orders_failed: u64,
    pub orders_skipped: u64,
    pub started_at: DateTime<Utc>,
}

impl WalletStatus {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: SubscriptionState::idle(),
            last_result: None,
            transfers_observed: 0,
            orders_executed: 0,
            orders_failed: 0,
            orders_skipped: 0,
            started_at: Utc::now(),
        }
    }
}

impl fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = match &self.last_result {
            Some(r) => match r.error_kind {
                Some(kind) => format!("{} ({})", r.outcome.as_str(), kind),
                None => r.outcome.as_str().to_string(),
            },
            None => "-".to_string(),
        };
        write!(
            f,
            "{:<14} {:<13} {:>8} {:>8} {:>8} {:>8}  {}",
            short_address(&self.address),
            self.state.phase,
            self.transfers_observed,
            self.orders_executed,
            self.orders_failed,
            self.orders_skipped,
            last
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts_clear_only_on_confirm() {
        let mut state = SubscriptionState::idle();
        state.connecting(Phase::Subscribing);
        state.reconnect(ErrorKind::LedgerUnavailable, Duration::from_secs(1), 1);
        state.reconnect(ErrorKind::Timeout, Duration::from_secs(2), 2);

        assert_eq!(state.phase, Phase::Reconnecting);
        assert_eq!(state.reconnect_attempts, 2);
        assert_eq!(state.retry_in, Some(Duration::from_secs(2)));

        state.activate();
        assert_eq!(state.phase, Phase::Active);
        assert_eq!(state.retry_in, None);
        assert_eq!(state.reconnect_attempts, 2);

        state.confirm();
        assert_eq!(state.reconnect_attempts, 0);
        // Last error stays visible for the operator.
        assert_eq!(state.last_error, Some(ErrorKind::Timeout));
    }

    #[test]
    fn test_revivable_only_for_transient_failures() {
        let mut state = SubscriptionState::idle();
        state.fail(ErrorKind::LedgerUnavailable);
        assert!(state.is_revivable());

        state.fail(ErrorKind::InvalidAddress);
        assert!(!state.is_revivable());

        state.remove();
        assert_eq!(state.phase, Phase::Removed);
        assert!(!state.is_revivable());
    }
}
