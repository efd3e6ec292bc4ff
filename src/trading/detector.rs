//! Transfer detection: turns ledger notifications and history pages into
//! [`ObservedTransfer`] events for one monitored wallet.

use std::collections::{HashSet, VecDeque};

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};

use crate::ledger::{LedgerClient, LedgerError, TransferDetail, TransferInstruction};
use crate::models::{ObservedTransfer, TokenId};

/// Instruction types that move value from one owner to another.
const TRANSFER_KINDS: [&str; 2] = ["transfer", "transferChecked"];

/// Recent signatures remembered by the push detector.
pub const SEEN_CAPACITY: usize = 512;

/// A raw push notification, decoded at the detector boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A transaction mentioning the wallet landed
    Transfer {
        signature: String,
        slot: u64,
        failed: bool,
    },
    /// Keep-alive or request acknowledgement
    Heartbeat,
    /// The channel reported an error and will not deliver more
    Error(String),
}

impl Notification {
    /// Decode a raw frame: a `logsNotification` envelope or its bare
    /// `{context, value}` result. Unknown shapes yield `None`.
    pub fn decode(raw: &Value) -> Option<Self> {
        let result = if raw.get("method").and_then(Value::as_str) == Some("logsNotification") {
            raw.get("params")?.get("result")
        } else if raw.get("context").is_some() {
            Some(raw)
        } else {
            None
        };

        if let Some(result) = result {
            let value = result.get("value")?;
            let signature = value.get("signature")?.as_str()?.to_string();
            let slot = result
                .get("context")
                .and_then(|c| c.get("slot"))
                .and_then(Value::as_u64)
                .unwrap_or_default();
            let failed = value.get("err").map(|e| !e.is_null()).unwrap_or(false);
            return Some(Notification::Transfer {
                signature,
                slot,
                failed,
            });
        }

        if let Some(err) = raw.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Some(Notification::Error(message));
        }

        if raw.get("id").is_some() && raw.get("result").is_some() {
            return Some(Notification::Heartbeat);
        }

        None
    }
}

/// A qualifying instruction before its balance context is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    recipient: String,
    amount: Decimal,
    token_id: Option<TokenId>,
}

/// Check whether `ix` is an outgoing transfer sent by `wallet`.
fn qualify(wallet: &str, ix: &TransferInstruction) -> Option<Candidate> {
    let kind = ix.kind.as_deref()?;
    if !TRANSFER_KINDS.contains(&kind) {
        return None;
    }
    if ix.source.as_deref() != Some(wallet) {
        return None;
    }

    let recipient = ix.recipient.as_deref().map(str::trim).filter(|r| !r.is_empty())?;
    if recipient == wallet {
        return None;
    }

    let amount = ix.amount.filter(|a| *a > Decimal::ZERO)?;

    Some(Candidate {
        recipient: recipient.to_string(),
        amount,
        token_id: ix.token_id.clone(),
    })
}

/// All outgoing transfers of `wallet` in a transaction, with their
/// pre-transaction source balance when the detail carries it.
fn extract(wallet: &str, detail: &TransferDetail) -> Vec<(Candidate, Option<Decimal>)> {
    if detail.failed {
        return Vec::new();
    }
    detail
        .instructions
        .iter()
        .filter_map(|ix| qualify(wallet, ix))
        .map(|c| {
            let before = detail.balance_before(wallet, c.token_id.as_ref());
            (c, before)
        })
        .collect()
}

/// Fetch a transaction and build its observed transfers for `wallet`.
pub async fn resolve_transfers(
    ledger: &dyn LedgerClient,
    wallet: &str,
    signature: &str,
) -> Result<Vec<ObservedTransfer>, LedgerError> {
    let Some(detail) = ledger.get_transfer_detail(signature).await? else {
        debug!(wallet, signature, "Transaction not available, skipping");
        return Ok(Vec::new());
    };

    let mut events = Vec::new();
    for (candidate, before) in extract(wallet, &detail) {
        let source_balance = match before {
            Some(balance) => balance,
            None => ledger.get_balance(wallet, candidate.token_id.clone()).await?,
        };

        events.push(ObservedTransfer {
            source_wallet: wallet.to_string(),
            recipient: candidate.recipient,
            amount: candidate.amount,
            token_id: candidate.token_id,
            source_balance_at_event: source_balance,
            signature: detail.signature.clone(),
            slot: detail.slot,
            observed_at: Utc::now(),
        });
    }

    Ok(events)
}

/// Bounded memory of recently processed signatures.
#[derive(Debug, Clone)]
pub struct SeenSignatures {
    order: VecDeque<String>,
    set: HashSet<String>,
    capacity: usize,
}

impl SeenSignatures {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            set: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.set.contains(signature)
    }

    /// Remember `signature`; `false` if it was already known.
    pub fn insert(&mut self, signature: &str) -> bool {
        if self.set.contains(signature) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.order.push_back(signature.to_string());
        self.set.insert(signature.to_string());
        true
    }
}

/// What the task should do after a push notification.
#[derive(Debug)]
pub enum PushEvent {
    Transfers(Vec<ObservedTransfer>),
    Nothing,
    /// A lookup failed transiently; the signature stays pending
    Stalled(LedgerError),
    /// Channel is dead; reconnect
    Disconnected(String),
}

/// Push strategy state: the de-dup memory and the signatures still to be
/// resolved. Both survive reconnects.
#[derive(Debug, Clone)]
pub struct PushDetector {
    seen: SeenSignatures,
    pending: VecDeque<String>,
}

impl Default for PushDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl PushDetector {
    pub fn new() -> Self {
        Self {
            seen: SeenSignatures::new(SEEN_CAPACITY),
            pending: VecDeque::new(),
        }
    }

    /// Signatures waiting for a successful lookup.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Resolve pending signatures in arrival order.
    ///
    /// Stops at the first transient failure. Transfers resolved before it are
    /// returned and the failing signature stays at the front; with nothing
    /// resolved the error is returned instead.
    pub async fn resume(
        &mut self,
        ledger: &dyn LedgerClient,
        wallet: &str,
    ) -> Result<Vec<ObservedTransfer>, LedgerError> {
        let mut events = Vec::new();
        while let Some(signature) = self.pending.front().cloned() {
            match resolve_transfers(ledger, wallet, &signature).await {
                Ok(resolved) => events.extend(resolved),
                Err(e) if e.is_transient() => {
                    if events.is_empty() {
                        return Err(e);
                    }
                    break;
                }
                Err(e) => {
                    warn!(wallet, signature = %signature, error = %e, "Dropping unresolvable transaction");
                }
            }
            self.pending.pop_front();
            self.seen.insert(&signature);
        }
        Ok(events)
    }

    pub async fn on_notification(
        &mut self,
        ledger: &dyn LedgerClient,
        wallet: &str,
        raw: &Value,
    ) -> PushEvent {
        match Notification::decode(raw) {
            Some(Notification::Transfer {
                signature, failed, ..
            }) => {
                if failed {
                    debug!(wallet, signature = %signature, "Failed transaction, skipping");
                    return PushEvent::Nothing;
                }
                if self.seen.contains(&signature) || self.pending.contains(&signature) {
                    debug!(wallet, signature = %signature, "Duplicate notification");
                    return PushEvent::Nothing;
                }
                self.pending.push_back(signature);
                match self.resume(ledger, wallet).await {
                    Ok(events) => PushEvent::Transfers(events),
                    Err(e) => {
                        warn!(wallet, error = %e, "Could not resolve notified transaction, will retry");
                        PushEvent::Stalled(e)
                    }
                }
            }
            Some(Notification::Heartbeat) => PushEvent::Nothing,
            Some(Notification::Error(message)) => PushEvent::Disconnected(message),
            None => {
                debug!(wallet, "Dropping unrecognised notification");
                PushEvent::Nothing
            }
        }
    }
}

/// Poll strategy state: the last-seen signature cursor.
#[derive(Debug, Clone)]
pub struct PollDetector {
    cursor: Option<String>,
    baseline: bool,
    limit: usize,
}

impl PollDetector {
    pub fn new(limit: usize) -> Self {
        Self {
            cursor: None,
            baseline: false,
            limit: limit.max(1),
        }
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Whether the first poll has established the cursor.
    pub fn has_baseline(&self) -> bool {
        self.baseline
    }

    /// Fetch history and return new transfers, oldest first.
    ///
    /// The first successful poll only records the cursor. Nothing is
    /// returned and the cursor stays put unless every entry resolved.
    pub async fn poll(
        &mut self,
        ledger: &dyn LedgerClient,
        wallet: &str,
    ) -> Result<Vec<ObservedTransfer>, LedgerError> {
        let page = ledger.get_recent_transfers(wallet, self.limit).await?;
        let newest = page.first().map(|r| r.signature.clone());

        if !self.baseline {
            debug!(wallet, cursor = ?newest, "Poll baseline established");
            self.cursor = newest;
            self.baseline = true;
            return Ok(Vec::new());
        }

        let mut fresh: Vec<_> = page
            .into_iter()
            .take_while(|r| Some(&r.signature) != self.cursor.as_ref())
            .collect();
        fresh.reverse();

        let mut events = Vec::new();
        for entry in fresh.iter().filter(|r| !r.failed) {
            let resolved = resolve_transfers(ledger, wallet, &entry.signature).await?;
            events.extend(resolved);
        }

        if newest.is_some() {
            self.cursor = newest;
        }
        Ok(events)
    }
}
