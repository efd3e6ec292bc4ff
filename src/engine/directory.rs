//! Directory capability and the read-only snapshot shared with wallet tasks.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::MonitoredWallet;

/// Source of the wallets to monitor.
#[async_trait]
pub trait WalletDirectory: Send + Sync {
    async fn list_wallets(&self) -> Result<Vec<MonitoredWallet>>;
}

/// Wallets keyed by trimmed address, as of one reconciliation.
#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshot {
    wallets: HashMap<String, MonitoredWallet>,
}

impl DirectorySnapshot {
    /// Build from a directory listing. Blank addresses are dropped and the
    /// first entry wins for duplicates.
    pub fn from_wallets(wallets: Vec<MonitoredWallet>) -> Self {
        let mut map = HashMap::with_capacity(wallets.len());
        for wallet in wallets {
            let wallet = MonitoredWallet::new(wallet.address, wallet.allocation_percentage);
            if wallet.address.is_empty() {
                continue;
            }
            map.entry(wallet.address.clone()).or_insert(wallet);
        }
        Self { wallets: map }
    }

    pub fn allocation(&self, address: &str) -> Option<Decimal> {
        self.wallets.get(address.trim()).map(|w| w.allocation_percentage)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.wallets.contains_key(address.trim())
    }

    pub fn addresses(&self) -> impl Iterator<Item = &String> {
        self.wallets.keys()
    }
}
