//! Data models for monitored wallets, transfers, executions, and task state.

mod execution;
mod state;
mod transfer;
mod wallet;

pub use execution::{ErrorKind, ExecutionResult, Outcome};
pub use state::{Phase, WalletStatus};
pub use transfer::{asset_label, ObservedTransfer, ReplicationOrder, TokenId};
pub use wallet::{clamp_allocation, is_valid_allocation, MonitoredWallet, DEFAULT_ALLOCATION};
