//! Wallet directory persistence.
//!
//! Stores the wallets to monitor and their allocation percentage. The engine
//! only reads it (through [`WalletDirectory`]); the CLI edits it.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::{debug, info};

use crate::engine::WalletDirectory;
use crate::models::{is_valid_allocation, MonitoredWallet, DEFAULT_ALLOCATION};

/// SQLite-backed wallet directory.
pub struct Database {
    pool: SqlitePool,
}

/// Stored wallet record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredWallet {
    pub address: String,
    pub allocation_percentage: f64,
    pub created_at: String,
}

impl StoredWallet {
    pub fn to_wallet(&self) -> MonitoredWallet {
        let allocation = Decimal::try_from(self.allocation_percentage).unwrap_or(DEFAULT_ALLOCATION);
        MonitoredWallet::new(self.address.clone(), allocation)
    }
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. One connection, so every query sees the
    /// same memory store.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallets (
                address TEXT PRIMARY KEY,
                allocation_percentage REAL NOT NULL DEFAULT 10.0,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create wallets table")?;

        debug!("Database migrations complete");
        Ok(())
    }

    /// Add a wallet to monitor. Defaults to a 10% allocation.
    pub async fn add_wallet(
        &self,
        address: &str,
        allocation_percentage: Option<Decimal>,
    ) -> Result<MonitoredWallet> {
        let address = address.trim();
        if address.is_empty() {
            bail!("Wallet address must not be empty");
        }

        let allocation = allocation_percentage.unwrap_or(DEFAULT_ALLOCATION);
        if !is_valid_allocation(allocation) {
            bail!("Allocation percentage must be between 0 and 100, got {}", allocation);
        }

        if self.get_wallet(address).await?.is_some() {
            bail!("Wallet address already exists");
        }

        sqlx::query(
            r#"
            INSERT INTO wallets (address, allocation_percentage, created_at, updated_at)
            VALUES (?, ?, datetime('now'), datetime('now'))
            "#,
        )
        .bind(address)
        .bind(allocation.to_f64().unwrap_or(10.0))
        .execute(&self.pool)
        .await
        .context("Failed to insert wallet")?;

        info!(wallet = %address, allocation = %allocation, "Wallet added to directory");
        Ok(MonitoredWallet::new(address, allocation))
    }

    /// Remove a wallet. Errors when it is not in the directory.
    pub async fn remove_wallet(&self, address: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM wallets WHERE address = ?")
            .bind(address.trim())
            .execute(&self.pool)
            .await
            .context("Failed to delete wallet")?;

        if result.rows_affected() == 0 {
            bail!("Wallet {} not found", address.trim());
        }

        info!(wallet = %address.trim(), "Wallet removed from directory");
        Ok(())
    }

    pub async fn get_wallet(&self, address: &str) -> Result<Option<StoredWallet>> {
        sqlx::query_as(
            "SELECT address, allocation_percentage, created_at FROM wallets WHERE address = ?",
        )
        .bind(address.trim())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch wallet")
    }

    /// All wallets, oldest first.
    pub async fn get_wallets(&self) -> Result<Vec<StoredWallet>> {
        sqlx::query_as(
            "SELECT address, allocation_percentage, created_at FROM wallets ORDER BY created_at, address",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list wallets")
    }

    /// Change a wallet's allocation percentage.
    pub async fn set_allocation(&self, address: &str, allocation_percentage: Decimal) -> Result<()> {
        if !is_valid_allocation(allocation_percentage) {
            bail!(
                "Allocation percentage must be between 0 and 100, got {}",
                allocation_percentage
            );
        }

        let result = sqlx::query(
            "UPDATE wallets SET allocation_percentage = ?, updated_at = datetime('now') WHERE address = ?",
        )
        .bind(allocation_percentage.to_f64().unwrap_or(10.0))
        .bind(address.trim())
        .execute(&self.pool)
        .await
        .context("Failed to update allocation")?;

        if result.rows_affected() == 0 {
            bail!("Wallet {} not found", address.trim());
        }

        info!(wallet = %address.trim(), allocation = %allocation_percentage, "Allocation updated");
        Ok(())
    }
}

#[async_trait]
impl WalletDirectory for Database {
    async fn list_wallets(&self) -> Result<Vec<MonitoredWallet>> {
        Ok(self
            .get_wallets()
            .await?
            .iter()
            .map(StoredWallet::to_wallet)
            .collect())
    }
}
