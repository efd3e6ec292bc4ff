//! Solana RPC client implementing the ledger capability.
//!
//! Reads go through the nonblocking `solana-client` RPC client. Transfers are
//! built and signed locally with `solana-sdk` and sent with
//! `sendTransaction`. Push notifications use a per-wallet `logsSubscribe`
//! (see `pubsub`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_client::GetConfirmedSignaturesForAddress2Config;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_client::rpc_request::{RpcError, RpcRequest, TokenAccountsFilter};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{read_keypair_file, Keypair, Signature, Signer};
use solana_sdk::system_instruction;
use solana_sdk::transaction::Transaction;
use solana_transaction_status::{EncodedConfirmedTransactionWithStatusMeta, UiTransactionEncoding};
use spl_associated_token_account::get_associated_token_address;
use spl_associated_token_account::instruction::create_associated_token_account_idempotent;
use tracing::{debug, info, warn};

use crate::models::TokenId;

use super::pubsub;
use super::types::{self, lamports_to_sol, RawTokenAmount, SOL_DECIMALS};
use super::{LedgerClient, LedgerError, Subscription, TransferDetail, TransferReceipt, TransferRef};

pub const DEFAULT_RPC_URL: &str = "https://api.mainnet-beta.solana.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound the RPC node accepts for `getSignaturesForAddress`.
const MAX_SIGNATURE_PAGE: usize = 1000;

/// Endpoints and signing key for [`RpcLedger`].
#[derive(Debug, Clone)]
pub struct RpcLedgerConfig {
    pub rpc_url: String,
    /// Derived from `rpc_url` when unset
    pub ws_url: Option<String>,
    /// Solana CLI keypair file of the controlled wallet; read-only when unset
    pub keypair_path: Option<PathBuf>,
    /// `processed`, `confirmed` or `finalized`
    pub commitment: String,
}

impl Default for RpcLedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: DEFAULT_RPC_URL.to_string(),
            ws_url: None,
            keypair_path: None,
            commitment: "confirmed".to_string(),
        }
    }
}

impl RpcLedgerConfig {
    /// WebSocket endpoint, explicit or derived from the RPC URL.
    pub fn ws_endpoint(&self) -> String {
        if let Some(url) = &self.ws_url {
            return url.clone();
        }
        if let Some(rest) = self.rpc_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.rpc_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.rpc_url.clone()
        }
    }
}

/// Ledger client backed by a Solana RPC node.
pub struct RpcLedger {
    client: RpcClient,
    ws_url: String,
    commitment: CommitmentConfig,
    signer: Option<Keypair>,
    /// Mint decimals never change; cached after the first lookup
    mint_decimals: RwLock<HashMap<Pubkey, u8>>,
}

impl RpcLedger {
    pub fn new(config: RpcLedgerConfig) -> Result<Self> {
        let commitment = CommitmentConfig::from_str(&config.commitment)
            .map_err(|e| anyhow!("Invalid commitment '{}': {}", config.commitment, e))?;

        let signer = match &config.keypair_path {
            Some(path) => Some(
                read_keypair_file(path)
                    .map_err(|e| anyhow!("Failed to read keypair {}: {}", path.display(), e))?,
            ),
            None => None,
        };

        if let Some(signer) = &signer {
            info!(wallet = %signer.pubkey(), "Loaded controlled wallet keypair");
        }

        Ok(Self {
            client: RpcClient::new_with_timeout_and_commitment(
                config.rpc_url.clone(),
                DEFAULT_TIMEOUT,
                commitment,
            ),
            ws_url: config.ws_endpoint(),
            commitment,
            signer,
            mint_decimals: RwLock::new(HashMap::new()),
        })
    }

    pub fn has_signer(&self) -> bool {
        self.signer.is_some()
    }

    fn parse_pubkey(address: &str) -> Result<Pubkey, LedgerError> {
        Pubkey::from_str(address.trim()).map_err(|_| LedgerError::InvalidAddress(address.to_string()))
    }

    async fn token_balance(&self, owner: &Pubkey, mint: &TokenId) -> Result<Decimal, LedgerError> {
        let mint = Self::parse_pubkey(mint.as_str())?;
        let accounts = self
            .client
            .get_token_accounts_by_owner_with_commitment(
                owner,
                TokenAccountsFilter::Mint(mint),
                self.commitment,
            )
            .await
            .map_err(|e| unavailable("getTokenAccountsByOwner", e))?
            .value;

        Ok(accounts
            .iter()
            .filter_map(|a| serde_json::to_value(&a.account.data).ok())
            .filter_map(|data| RawTokenAmount::at(&data, "/parsed/info/tokenAmount"))
            .filter_map(|amount| amount.to_decimal())
            .sum())
    }

    async fn mint_decimals(&self, mint: &Pubkey) -> Result<u8, LedgerError> {
        if let Ok(cache) = self.mint_decimals.read() {
            if let Some(decimals) = cache.get(mint) {
                return Ok(*decimals);
            }
        }

        let decimals = self
            .client
            .get_token_supply_with_commitment(mint, self.commitment)
            .await
            .map_err(|e| unavailable("getTokenSupply", e))?
            .value
            .decimals;

        if let Ok(mut cache) = self.mint_decimals.write() {
            cache.insert(*mint, decimals);
        }
        Ok(decimals)
    }

    /// Instructions sending `amount` of SOL or of a token to `recipient`.
    async fn build_instructions(
        &self,
        payer: &Pubkey,
        recipient: &Pubkey,
        amount: Decimal,
        token_id: Option<&TokenId>,
    ) -> Result<Vec<Instruction>, LedgerError> {
        match token_id {
            None => {
                let lamports = to_raw_amount(amount, SOL_DECIMALS as u8)?;
                Ok(vec![system_instruction::transfer(payer, recipient, lamports)])
            }
            Some(mint_id) => {
                let mint = Self::parse_pubkey(mint_id.as_str())?;
                let decimals = self.mint_decimals(&mint).await?;
                let raw = to_raw_amount(amount, decimals)?;

                let source = get_associated_token_address(payer, &mint);
                let destination = get_associated_token_address(recipient, &mint);

                let create =
                    create_associated_token_account_idempotent(payer, recipient, &mint, &spl_token::id());
                let transfer = spl_token::instruction::transfer_checked(
                    &spl_token::id(),
                    &source,
                    &mint,
                    &destination,
                    payer,
                    &[],
                    raw,
                    decimals,
                )
                .map_err(|e| LedgerError::SubmissionFailed(format!("Failed to build token transfer: {}", e)))?;

                Ok(vec![create, transfer])
            }
        }
    }
}

fn unavailable(call: &str, e: ClientError) -> LedgerError {
    LedgerError::Unavailable(format!("{}: {}", call, e))
}

/// A node that answered and refused the transaction is a submission failure;
/// anything that never reached a verdict stays transient.
fn submission_error(e: ClientError) -> LedgerError {
    match e.kind() {
        ClientErrorKind::RpcError(RpcError::RpcResponseError { .. })
        | ClientErrorKind::TransactionError(_) => LedgerError::SubmissionFailed(e.to_string()),
        _ => unavailable("sendTransaction", e),
    }
}

/// Convert asset units into the integer amount the ledger uses.
pub fn to_raw_amount(amount: Decimal, decimals: u8) -> Result<u64, LedgerError> {
    let out_of_range = || LedgerError::SubmissionFailed(format!("Amount {} out of range", amount));

    let scale = 10u64
        .checked_pow(decimals as u32)
        .map(Decimal::from)
        .ok_or_else(out_of_range)?;
    let raw = amount
        .checked_mul(scale)
        .and_then(|v| v.trunc().to_u64())
        .ok_or_else(out_of_range)?;

    if raw == 0 {
        return Err(LedgerError::SubmissionFailed(format!(
            "Amount {} rounds to zero",
            amount
        )));
    }
    Ok(raw)
}

#[async_trait]
impl LedgerClient for RpcLedger {
    fn is_valid_address(&self, address: &str) -> bool {
        Self::parse_pubkey(address).is_ok()
    }

    fn own_address(&self) -> String {
        self.signer
            .as_ref()
            .map(|s| s.pubkey().to_string())
            .unwrap_or_default()
    }

    async fn get_balance(
        &self,
        address: &str,
        token_id: Option<TokenId>,
    ) -> Result<Decimal, LedgerError> {
        let owner = Self::parse_pubkey(address)?;
        match token_id {
            None => {
                let lamports = self
                    .client
                    .get_balance_with_commitment(&owner, self.commitment)
                    .await
                    .map_err(|e| unavailable("getBalance", e))?
                    .value;
                Ok(lamports_to_sol(lamports))
            }
            Some(mint) => self.token_balance(&owner, &mint).await,
        }
    }

    async fn get_recent_transfers(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<TransferRef>, LedgerError> {
        let owner = Self::parse_pubkey(address)?;
        let config = GetConfirmedSignaturesForAddress2Config {
            limit: Some(limit.clamp(1, MAX_SIGNATURE_PAGE)),
            commitment: Some(self.commitment),
            ..Default::default()
        };
        let entries = self
            .client
            .get_signatures_for_address_with_config(&owner, config)
            .await
            .map_err(|e| unavailable("getSignaturesForAddress", e))?;

        Ok(entries.into_iter().map(TransferRef::from).collect())
    }

    async fn get_transfer_detail(
        &self,
        signature: &str,
    ) -> Result<Option<TransferDetail>, LedgerError> {
        if Signature::from_str(signature).is_err() {
            debug!(signature, "Not a transaction signature");
            return Ok(None);
        }

        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::JsonParsed),
            commitment: Some(self.commitment),
            max_supported_transaction_version: Some(0),
        };
        // `null` until the node has the transaction at this commitment.
        let tx: Option<EncodedConfirmedTransactionWithStatusMeta> = self
            .client
            .send(RpcRequest::GetTransaction, json!([signature, config]))
            .await
            .map_err(|e| unavailable("getTransaction", e))?;

        Ok(tx.map(|tx| types::into_detail(tx, signature)))
    }

    async fn submit_transfer(
        &self,
        recipient: &str,
        amount: Decimal,
        token_id: Option<TokenId>,
    ) -> Result<TransferReceipt, LedgerError> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            LedgerError::SubmissionFailed("No keypair configured for the controlled wallet".into())
        })?;
        let payer = signer.pubkey();
        let to = Self::parse_pubkey(recipient)?;

        let instructions = self
            .build_instructions(&payer, &to, amount, token_id.as_ref())
            .await?;
        let (blockhash, _) = self
            .client
            .get_latest_blockhash_with_commitment(self.commitment)
            .await
            .map_err(|e| unavailable("getLatestBlockhash", e))?;

        let tx = Transaction::new_signed_with_payer(&instructions, Some(&payer), &[signer], blockhash);
        let signature = self.client.send_transaction(&tx).await.map_err(|e| {
            let err = submission_error(e);
            warn!(recipient, %amount, error = %err, "Transaction not accepted");
            err
        })?;

        info!(recipient, %amount, signature = %signature, "Transaction submitted");
        Ok(TransferReceipt {
            transfer_id: signature.to_string(),
        })
    }

    async fn subscribe(&self, address: &str) -> Result<Subscription, LedgerError> {
        let owner = Self::parse_pubkey(address)?;
        pubsub::logs_subscribe(&self.ws_url, &owner, self.commitment).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use solana_client::rpc_request::RpcResponseErrorData;
    use solana_sdk::system_program;

    #[test]
    fn test_ws_endpoint_derivation() {
        let config = RpcLedgerConfig {
            rpc_url: "https://rpc.example.com".to_string(),
            ..Default::default()
        };
        assert_eq!(config.ws_endpoint(), "wss://rpc.example.com");

        let local = RpcLedgerConfig {
            rpc_url: "http://127.0.0.1:8899".to_string(),
            ..Default::default()
        };
        assert_eq!(local.ws_endpoint(), "ws://127.0.0.1:8899");

        let explicit = RpcLedgerConfig {
            ws_url: Some("ws://127.0.0.1:8900".to_string()),
            ..local
        };
        assert_eq!(explicit.ws_endpoint(), "ws://127.0.0.1:8900");
    }

    #[test]
    fn test_to_raw_amount() {
        assert_eq!(to_raw_amount(dec!(0.2), 9).unwrap(), 200_000_000);
        assert_eq!(to_raw_amount(dec!(25.1234567), 6).unwrap(), 25_123_456);
        assert!(matches!(
            to_raw_amount(dec!(0.0000000001), 9),
            Err(LedgerError::SubmissionFailed(_))
        ));
        assert!(to_raw_amount(dec!(-1), 9).is_err());
    }

    #[test]
    fn test_to_raw_amount_rejects_oversized_scale() {
        assert_eq!(to_raw_amount(dec!(1), 19).unwrap(), 10_000_000_000_000_000_000);
        assert!(matches!(
            to_raw_amount(dec!(1), 20),
            Err(LedgerError::SubmissionFailed(_))
        ));
        assert!(to_raw_amount(dec!(1), u8::MAX).is_err());
    }

    #[test]
    fn test_address_validation() {
        let ledger = RpcLedger::new(RpcLedgerConfig::default()).unwrap();
        assert!(ledger.is_valid_address("9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM"));
        assert!(ledger.is_valid_address("  9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM "));
        assert!(!ledger.is_valid_address("not-a-wallet"));
        assert!(!ledger.is_valid_address(""));
        assert!(!ledger.has_signer());
        assert_eq!(ledger.own_address(), "");
    }

    #[test]
    fn test_unknown_commitment_is_rejected() {
        let config = RpcLedgerConfig {
            commitment: "eventually".to_string(),
            ..Default::default()
        };
        assert!(RpcLedger::new(config).is_err());
    }

    #[tokio::test]
    async fn test_native_transfer_instruction() {
        let ledger = RpcLedger::new(RpcLedgerConfig::default()).unwrap();
        let payer = Pubkey::new_unique();
        let recipient = Pubkey::new_unique();

        let instructions = ledger
            .build_instructions(&payer, &recipient, dec!(0.25), None)
            .await
            .unwrap();
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].program_id, system_program::id());
    }

    #[tokio::test]
    async fn test_token_transfer_targets_associated_accounts() {
        let ledger = RpcLedger::new(RpcLedgerConfig::default()).unwrap();
        let payer = Pubkey::new_unique();
        let recipient = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        ledger.mint_decimals.write().unwrap().insert(mint, 6);

        let instructions = ledger
            .build_instructions(&payer, &recipient, dec!(1.5), Some(&TokenId::new(mint.to_string())))
            .await
            .unwrap();
        assert_eq!(instructions.len(), 2);

        let destination = get_associated_token_address(&recipient, &mint);
        let create = &instructions[0];
        assert_eq!(create.program_id, spl_associated_token_account::id());
        assert!(create.accounts.iter().any(|a| a.pubkey == destination));

        let transfer = &instructions[1];
        assert_eq!(transfer.program_id, spl_token::id());
        assert_eq!(transfer.accounts[0].pubkey, get_associated_token_address(&payer, &mint));
        assert_eq!(transfer.accounts[2].pubkey, destination);
    }

    #[test]
    fn test_submission_error_classification() {
        let rejected = ClientError::from(ClientErrorKind::RpcError(RpcError::RpcResponseError {
            code: -32002,
            message: "Transaction simulation failed".into(),
            data: RpcResponseErrorData::Empty,
        }));
        assert!(matches!(submission_error(rejected), LedgerError::SubmissionFailed(_)));

        let unreachable = ClientError::from(ClientErrorKind::Custom("connection refused".into()));
        let err = submission_error(unreachable);
        assert!(matches!(err, LedgerError::Unavailable(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_submit_without_keypair_fails() {
        let ledger = RpcLedger::new(RpcLedgerConfig::default()).unwrap();
        let err = ledger
            .submit_transfer("9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM", dec!(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::SubmissionFailed(_)));
    }
}
