//!
//! JSON-RPC client for an Ethereum-compatible ledger node.
//!
//! This module provides an async client that talks to the node over HTTP for request/response
//! calls (block height, range log queries, transaction submission, receipts) and over a
//! WebSocket for `eth_subscribe("logs")` push subscriptions. All methods are async and
//! designed for use with Tokio.

use super::types::*;
use super::{LogSource, LogSubscription};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Buffered log notifications per subscription before the reader applies backpressure.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Ledger node JSON-RPC client
#[derive(Clone)]
pub struct EthereumClient {
	/// The underlying HTTP client for JSON-RPC calls.
	http_client: Client,
	/// The HTTP JSON-RPC endpoint.
	rpc_url: String,
	/// The WebSocket endpoint for push subscriptions.
	ws_url: String,
	/// Monotonic JSON-RPC request id.
	next_id: Arc<AtomicU64>,
}

impl EthereumClient {
	/// Create a new ledger client.
	///
	/// # Arguments
	/// * `rpc_url` - The HTTP endpoint for JSON-RPC calls.
	/// * `ws_url` - The WebSocket endpoint for subscriptions.
	pub fn new(rpc_url: String, ws_url: String) -> Result<Self, LedgerError> {
		let http_client = Client::builder().timeout(Duration::from_secs(30)).build()?;

		Ok(Self {
			http_client,
			rpc_url,
			ws_url,
			next_id: Arc::new(AtomicU64::new(1)),
		})
	}

	pub fn rpc_url(&self) -> &str {
		&self.rpc_url
	}

	/// Execute a JSON-RPC request and deserialize its `result`.
	///
	/// # Returns
	/// The decoded result, or a `LedgerError` if transport, status or the RPC error object says otherwise.
	pub async fn request<T: DeserializeOwned>(
		&self,
		method: &str,
		params: serde_json::Value,
	) -> Result<T, LedgerError> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let request_body = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params,
		});

		let response = self
			.http_client
			.post(&self.rpc_url)
			.header("Content-Type", "application/json")
			.json(&request_body)
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(LedgerError::InvalidResponse(format!(
				"HTTP error calling {}: {}",
				method,
				response.status()
			)));
		}

		let response_json: serde_json::Value = response.json().await?;
		parse_rpc_response(response_json)
	}

	/// Current chain id as reported by the node.
	pub async fn chain_id(&self) -> Result<u64, LedgerError> {
		let raw: String = self.request("eth_chainId", json!([])).await?;
		quantity::decode(&raw).map_err(LedgerError::InvalidResponse)
	}

	/// Submit a transaction for the node to sign with the `from` account.
	pub async fn send_transaction(&self, transaction: serde_json::Value) -> Result<TxHash, LedgerError> {
		self.request("eth_sendTransaction", json!([transaction])).await
	}

	/// Fetch a transaction receipt; `None` while the transaction is pending.
	pub async fn transaction_receipt(
		&self,
		hash: &TxHash,
	) -> Result<Option<serde_json::Value>, LedgerError> {
		self.request("eth_getTransactionReceipt", json!([format!("{:#x}", hash)]))
			.await
	}

	/// Open an `eth_subscribe("logs")` subscription over the WebSocket endpoint.
	///
	/// A reader task owns the socket and forwards decoded logs to the returned
	/// subscription. Calling [`LogSubscription::unsubscribe`] sends `eth_unsubscribe`
	/// and closes the socket.
	///
	/// # Errors
	/// Returns `LedgerError` if the WebSocket connection or subscription request fails.
	pub async fn subscribe_logs_ws(&self, filter: &LogFilter) -> Result<LogSubscription, LedgerError> {
		debug!("Attempting WebSocket connection to: {}", self.ws_url);

		let (ws_stream, response) = connect_async(self.ws_url.as_str()).await?;
		debug!(
			"WebSocket connection established, response status: {}",
			response.status()
		);
		let (mut ws_sender, mut ws_receiver) = ws_stream.split();

		let subscribe_message = json!({
			"jsonrpc": "2.0",
			"id": 1,
			"method": "eth_subscribe",
			"params": ["logs", filter.to_json()],
		});
		ws_sender
			.send(Message::Text(subscribe_message.to_string()))
			.await?;

		// Wait for the subscription id
		let subscription_id = loop {
			match ws_receiver.next().await {
				Some(Ok(Message::Text(text))) => {
					let parsed: serde_json::Value = serde_json::from_str(&text)?;
					if parsed.get("id") != Some(&json!(1)) {
						debug!("Ignoring message before subscription ack: {}", text);
						continue;
					}
					break parse_rpc_response::<String>(parsed)?;
				}
				Some(Ok(Message::Close(frame))) => {
					return Err(LedgerError::SubscriptionClosed(format!(
						"closed during handshake: {:?}",
						frame
					)));
				}
				Some(Ok(_)) => continue,
				Some(Err(e)) => return Err(e.into()),
				None => {
					return Err(LedgerError::SubscriptionClosed(
						"stream ended during handshake".to_string(),
					));
				}
			}
		};

		info!("Subscribed to logs with subscription id {}", subscription_id);

		let (log_tx, log_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
		let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
		let reader_id = subscription_id.clone();

		let task = tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = &mut shutdown_rx => {
						let unsubscribe = json!({
							"jsonrpc": "2.0",
							"id": 2,
							"method": "eth_unsubscribe",
							"params": [reader_id],
						});
						if let Err(e) = ws_sender.send(Message::Text(unsubscribe.to_string())).await {
							warn!("Failed to send eth_unsubscribe for {}: {}", reader_id, e);
						}
						if let Err(e) = ws_sender.close().await {
							debug!("WebSocket close for {} failed: {}", reader_id, e);
						}
						debug!("Log subscription {} cancelled", reader_id);
						break;
					}
					msg = ws_receiver.next() => {
						let log = match msg {
							Some(Ok(Message::Text(text))) => match parse_log_notification(&text) {
								Ok(Some(log)) => log,
								Ok(None) => continue,
								Err(e) => {
									warn!("Skipping malformed notification on {}: {}", reader_id, e);
									continue;
								}
							},
							Some(Ok(Message::Close(frame))) => {
								let _ = log_tx
									.send(Err(LedgerError::SubscriptionClosed(format!("closed by node: {:?}", frame))))
									.await;
								break;
							}
							Some(Ok(_)) => continue,
							Some(Err(e)) => {
								error!("Error in log subscription {}: {}", reader_id, e);
								let _ = log_tx.send(Err(e.into())).await;
								break;
							}
							None => {
								let _ = log_tx
									.send(Err(LedgerError::SubscriptionClosed("stream ended".to_string())))
									.await;
								break;
							}
						};
						if log_tx.send(Ok(log)).await.is_err() {
							// Receiver gone; nobody is listening any more.
							break;
						}
					}
				}
			}
		});

		Ok(LogSubscription::new(subscription_id, log_rx)
			.with_shutdown(shutdown_tx)
			.with_task(task))
	}
}

#[async_trait]
impl LogSource for EthereumClient {
	async fn block_number(&self) -> Result<u64, LedgerError> {
		let raw: String = self.request("eth_blockNumber", json!([])).await?;
		quantity::decode(&raw).map_err(LedgerError::InvalidResponse)
	}

	async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, LedgerError> {
		self.request("eth_getLogs", json!([filter.to_json()])).await
	}

	async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogSubscription, LedgerError> {
		self.subscribe_logs_ws(filter).await
	}
}

/// Pull `result` out of a JSON-RPC response, mapping the `error` object.
fn parse_rpc_response<T: DeserializeOwned>(response: serde_json::Value) -> Result<T, LedgerError> {
	if let Some(error) = response.get("error") {
		let code = error.get("code").and_then(|c| c.as_i64()).unwrap_or_default();
		let message = error
			.get("message")
			.and_then(|m| m.as_str())
			.unwrap_or("Unknown RPC error")
			.to_string();
		return Err(LedgerError::RpcError { code, message });
	}

	let result = response
		.get("result")
		.cloned()
		.ok_or_else(|| LedgerError::InvalidResponse("missing result field".to_string()))?;
	Ok(serde_json::from_value(result)?)
}

/// Parse an `eth_subscription` notification; other messages yield `None`.
fn parse_log_notification(text: &str) -> Result<Option<Log>, LedgerError> {
	let parsed: serde_json::Value = serde_json::from_str(text)?;
	if parsed.get("method").and_then(|m| m.as_str()) != Some("eth_subscription") {
		debug!("Ignoring non-notification message: {}", text);
		return Ok(None);
	}
	let result = parsed
		.get("params")
		.and_then(|p| p.get("result"))
		.cloned()
		.ok_or_else(|| LedgerError::InvalidResponse("notification without result".to_string()))?;
	Ok(Some(serde_json::from_value(result)?))
}

/// Parse a receipt `status` field; `true` on success.
pub(crate) fn receipt_succeeded(receipt: &serde_json::Value) -> Option<bool> {
	receipt
		.get("status")
		.and_then(|s| s.as_str())
		.and_then(|s| quantity::decode(s).ok())
		.map(|status| status == 1)
}
