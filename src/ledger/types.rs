//! Conversion of Solana RPC responses into ledger models.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use solana_client::rpc_response::RpcConfirmedTransactionStatusWithSignature;
use solana_transaction_status::{
    EncodedConfirmedTransactionWithStatusMeta, EncodedTransaction, UiInstruction, UiMessage,
    UiParsedInstruction, UiTransactionTokenBalance,
};

use crate::models::TokenId;

use super::{BalanceEntry, TransferDetail, TransferInstruction, TransferRef};

/// Decimals of the native asset (lamports per SOL = 10^9).
pub const SOL_DECIMALS: u32 = 9;

pub const SYSTEM_PROGRAM: &str = "system";
pub const TOKEN_PROGRAM: &str = "spl-token";

/// `tokenAmount` object of `jsonParsed` token data.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTokenAmount {
    pub amount: String,
    pub decimals: u8,
}

impl RawTokenAmount {
    /// Read the `tokenAmount` found at `pointer` inside `value`.
    pub fn at(value: &Value, pointer: &str) -> Option<Self> {
        value
            .pointer(pointer)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Exact decimal value from the raw integer amount.
    pub fn to_decimal(&self) -> Option<Decimal> {
        raw_to_decimal(&self.amount, self.decimals as u32)
    }
}

/// `parsed` object of a recognised instruction.
#[derive(Debug, Clone, Deserialize)]
struct ParsedBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    info: Value,
}

/// Owner, mint and decimals of a token account appearing in a transaction.
#[derive(Debug, Clone)]
struct TokenAccountMeta {
    owner: Option<String>,
    mint: String,
    decimals: u32,
}

/// Convert a raw integer amount with `decimals` places into a decimal.
///
/// `None` for malformed input or more places than a `Decimal` can hold.
pub fn raw_to_decimal(raw: &str, decimals: u32) -> Option<Decimal> {
    let value: u64 = raw.parse().ok()?;
    Decimal::try_from_i128_with_scale(value as i128, decimals)
        .ok()
        .map(|d| d.normalize())
}

/// Lamports to SOL.
pub fn lamports_to_sol(lamports: u64) -> Decimal {
    Decimal::from_i128_with_scale(lamports as i128, SOL_DECIMALS).normalize()
}

impl From<RpcConfirmedTransactionStatusWithSignature> for TransferRef {
    fn from(status: RpcConfirmedTransactionStatusWithSignature) -> Self {
        TransferRef {
            failed: status.err.is_some(),
            signature: status.signature,
            slot: status.slot,
            block_time: status.block_time,
        }
    }
}

/// Flatten a `jsonParsed` transaction into the ledger-neutral detail model.
///
/// Non-parsed encodings yield a detail without instructions.
pub fn into_detail(tx: EncodedConfirmedTransactionWithStatusMeta, signature: &str) -> TransferDetail {
    let (keys, ui_instructions) = match tx.transaction.transaction {
        EncodedTransaction::Json(ui) => match ui.message {
            UiMessage::Parsed(message) => (
                message
                    .account_keys
                    .into_iter()
                    .map(|k| k.pubkey)
                    .collect::<Vec<_>>(),
                message.instructions,
            ),
            UiMessage::Raw(_) => (Vec::new(), Vec::new()),
        },
        _ => (Vec::new(), Vec::new()),
    };

    let mut failed = false;
    let mut token_accounts: HashMap<String, TokenAccountMeta> = HashMap::new();
    let mut balances_before: Vec<BalanceEntry> = Vec::new();

    if let Some(meta) = tx.transaction.meta {
        failed = meta.err.is_some();

        for (index, lamports) in meta.pre_balances.iter().enumerate() {
            if let Some(owner) = keys.get(index) {
                balances_before.push(BalanceEntry {
                    owner: owner.clone(),
                    token_id: None,
                    amount: lamports_to_sol(*lamports),
                });
            }
        }

        let pre: Vec<UiTransactionTokenBalance> =
            Option::from(meta.pre_token_balances).unwrap_or_default();
        let post: Vec<UiTransactionTokenBalance> =
            Option::from(meta.post_token_balances).unwrap_or_default();

        for balance in pre.iter().chain(&post) {
            if let Some(account) = keys.get(balance.account_index as usize) {
                token_accounts
                    .entry(account.clone())
                    .or_insert_with(|| TokenAccountMeta {
                        owner: Option::from(balance.owner.clone()),
                        mint: balance.mint.clone(),
                        decimals: balance.ui_token_amount.decimals as u32,
                    });
            }
        }

        // One owner may hold several accounts of the same mint.
        for balance in &pre {
            let owner: Option<String> = Option::from(balance.owner.clone());
            let amount = raw_to_decimal(
                &balance.ui_token_amount.amount,
                balance.ui_token_amount.decimals as u32,
            );
            let (Some(owner), Some(amount)) = (owner, amount) else {
                continue;
            };
            let token_id = Some(TokenId::new(balance.mint.clone()));
            match balances_before
                .iter_mut()
                .find(|b| b.owner == owner && b.token_id == token_id)
            {
                Some(existing) => existing.amount += amount,
                None => balances_before.push(BalanceEntry {
                    owner,
                    token_id,
                    amount,
                }),
            }
        }
    }

    let instructions = ui_instructions
        .iter()
        .map(|ix| parse_instruction(ix, &token_accounts))
        .collect();

    TransferDetail {
        signature: signature.to_string(),
        slot: tx.slot,
        failed,
        instructions,
        balances_before,
    }
}

fn info_str(info: &Value, field: &str) -> Option<String> {
    info.get(field).and_then(Value::as_str).map(str::to_string)
}

fn parse_instruction(
    ix: &UiInstruction,
    token_accounts: &HashMap<String, TokenAccountMeta>,
) -> TransferInstruction {
    let UiInstruction::Parsed(UiParsedInstruction::Parsed(ix)) = ix else {
        return TransferInstruction::default();
    };
    let Ok(parsed) = serde_json::from_value::<ParsedBody>(ix.parsed.clone()) else {
        return TransferInstruction::default();
    };
    let info = &parsed.info;
    let mut out = TransferInstruction {
        kind: Some(parsed.kind.clone()),
        ..Default::default()
    };

    match (ix.program.as_str(), parsed.kind.as_str()) {
        (SYSTEM_PROGRAM, "transfer") => {
            out.source = info_str(info, "source");
            out.recipient = info_str(info, "destination");
            out.amount = info.get("lamports").and_then(Value::as_u64).map(lamports_to_sol);
        }
        (TOKEN_PROGRAM, "transfer") => {
            let destination = info_str(info, "destination");
            let source_account = info_str(info, "source");
            let meta = source_account
                .as_ref()
                .and_then(|a| token_accounts.get(a))
                .or_else(|| destination.as_ref().and_then(|a| token_accounts.get(a)));

            out.source = info_str(info, "authority").or_else(|| info_str(info, "multisigAuthority"));
            out.recipient = destination
                .as_ref()
                .and_then(|a| token_accounts.get(a))
                .and_then(|m| m.owner.clone());
            if let Some(meta) = meta {
                out.token_id = Some(TokenId::new(meta.mint.clone()));
                out.amount = info_str(info, "amount").and_then(|raw| raw_to_decimal(&raw, meta.decimals));
            }
        }
        (TOKEN_PROGRAM, "transferChecked") => {
            out.source = info_str(info, "authority").or_else(|| info_str(info, "multisigAuthority"));
            out.recipient = info_str(info, "destination")
                .and_then(|a| token_accounts.get(&a).and_then(|m| m.owner.clone()));
            out.token_id = info_str(info, "mint").map(TokenId::new);
            out.amount = RawTokenAmount::at(info, "/tokenAmount").and_then(|a| a.to_decimal());
        }
        _ => {}
    }

    out
}
