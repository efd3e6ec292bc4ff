//! `logsSubscribe` push channel over the Solana PubSub WebSocket.
//!
//! One client per wallet. A background task owns the client, forwards every
//! notification as raw JSON and unsubscribes when the owning
//! [`Subscription`] is dropped.

use futures::StreamExt;
use serde_json::{json, Value};
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::rpc_config::{RpcTransactionLogsConfig, RpcTransactionLogsFilter};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{LedgerError, Subscription};

const CHANNEL_CAPACITY: usize = 256;

/// Connect, subscribe to logs mentioning `address` and return the
/// notification channel once the node confirmed the subscription.
pub async fn logs_subscribe(
    ws_url: &str,
    address: &Pubkey,
    commitment: CommitmentConfig,
) -> Result<Subscription, LedgerError> {
    debug!(url = %ws_url, wallet = %address, "Opening PubSub connection");

    let client = PubsubClient::new(ws_url)
        .await
        .map_err(|e| LedgerError::Unavailable(format!("PubSub connect to {}: {}", ws_url, e)))?;

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (ready_tx, ready_rx) = oneshot::channel();
    let cancel = CancellationToken::new();
    tokio::spawn(pump(client, address.to_string(), commitment, tx, ready_tx, cancel.clone()));

    match ready_rx.await {
        Ok(Ok(())) => Ok(Subscription::new(rx, cancel)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(LedgerError::Unavailable(
            "PubSub task ended before subscribing".into(),
        )),
    }
}

fn error_frame(message: impl Into<String>) -> Value {
    json!({"jsonrpc": "2.0", "error": {"code": -1, "message": message.into()}})
}

/// Subscribe, then forward notifications until cancelled or the stream ends.
async fn pump(
    client: PubsubClient,
    address: String,
    commitment: CommitmentConfig,
    tx: mpsc::Sender<Value>,
    ready: oneshot::Sender<Result<(), LedgerError>>,
    cancel: CancellationToken,
) {
    let filter = RpcTransactionLogsFilter::Mentions(vec![address.clone()]);
    let config = RpcTransactionLogsConfig {
        commitment: Some(commitment),
    };

    // Dropping the client on the error path closes its socket.
    let (mut stream, unsubscribe) = match client.logs_subscribe(filter, config).await {
        Ok(subscribed) => subscribed,
        Err(e) => {
            let _ = ready.send(Err(LedgerError::Unavailable(format!("logsSubscribe: {}", e))));
            return;
        }
    };

    if ready.send(Ok(())).is_ok() {
        info!(wallet = %address, "Log subscription confirmed");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = stream.next() => match item {
                    Some(response) => match serde_json::to_value(&response) {
                        Ok(value) => {
                            if tx.send(value).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!(wallet = %address, error = %e, "Ignoring unencodable notification"),
                    },
                    None => {
                        warn!(wallet = %address, "PubSub stream ended");
                        let _ = tx.send(error_frame("PubSub stream ended")).await;
                        break;
                    }
                },
            }
        }
    }

    drop(stream);
    unsubscribe().await;
    if let Err(e) = client.shutdown().await {
        debug!(wallet = %address, error = %e, "PubSub shutdown failed");
    }
    debug!(wallet = %address, "Log subscription released");
}
