//!
//! GraphQL client for a UTXO chain indexer.
//!
//! History queries go over HTTP; chain-head tracking and per-address transaction listeners use
//! `graphql-transport-ws` subscriptions. The consensus state exposed to the synchronizer is derived
//! from the head subscription: `Syncing` until the first head arrives, `Established` while heads
//! flow, `Connecting` while the socket is being re-established.

use super::{
	ConsensusState, HeadInfo, IndexedTransaction, ProviderError, UtxoProvider,
};
use crate::wallet::Transaction;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures_util::{SinkExt, Stream, StreamExt};
use reqwest::Client;
use serde_json::json;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
	connect_async,
	tungstenite::{Message, client::IntoClientRequest},
};
use tracing::{debug, error, info, warn};

type SubscriptionStream = Pin<Box<dyn Stream<Item = Result<serde_json::Value, ProviderError>> + Send>>;

/// UTXO chain GraphQL indexer client
#[derive(Clone)]
pub struct UtxoIndexerClient {
	/// The underlying HTTP client for GraphQL queries.
	http_client: Client,
	/// The base URL for the indexer GraphQL HTTP endpoint.
	indexer_url: String,
	/// The WebSocket URL for real-time subscriptions.
	ws_url: String,
	/// Confirmations after which a mined transaction is reported as confirmed.
	min_confirmations: u64,
	consensus: Arc<watch::Sender<ConsensusState>>,
	head: Arc<watch::Sender<HeadInfo>>,
}

impl UtxoIndexerClient {
	/// Create a new indexer client.
	///
	/// # Arguments
	/// * `indexer_url` - The HTTP endpoint for GraphQL queries.
	/// * `ws_url` - The WebSocket endpoint for subscriptions.
	/// * `min_confirmations` - Depth at which transactions count as confirmed.
	pub fn new(
		indexer_url: String,
		ws_url: String,
		min_confirmations: u64,
	) -> Result<Self, ProviderError> {
		let http_client = Client::builder().timeout(Duration::from_secs(30)).build()?;
		let (consensus, _) = watch::channel(ConsensusState::Syncing);
		let (head, _) = watch::channel(HeadInfo::default());

		Ok(Self {
			http_client,
			indexer_url,
			ws_url,
			min_confirmations,
			consensus: Arc::new(consensus),
			head: Arc::new(head),
		})
	}

	/// Spawn the background task that follows the chain head and drives the consensus state.
	///
	/// The task reconnects with exponential backoff whenever the subscription ends.
	pub fn start(&self) -> JoinHandle<()> {
		let client = self.clone();
		tokio::spawn(async move {
			let mut reconnect = ExponentialBackoff {
				max_elapsed_time: None,
				..ExponentialBackoff::default()
			};

			loop {
				match client.follow_head().await {
					Ok(()) => info!("Head subscription completed"),
					Err(e) => warn!("Head subscription failed: {}", e),
				}

				if *client.consensus.borrow() == ConsensusState::Established {
					reconnect.reset();
				}
				client.consensus.send_replace(ConsensusState::Connecting);

				let delay = reconnect.next_backoff().unwrap_or(Duration::from_secs(30));
				debug!("Reconnecting head subscription in {:?}", delay);
				tokio::time::sleep(delay).await;
			}
		})
	}

	async fn follow_head(&self) -> Result<(), ProviderError> {
		let query = r#"
            subscription Head {
                head {
                    height
                    timestamp
                }
            }
        "#
		.to_string();

		let mut stream = self.open_subscription("head", "head", query).await?;
		while let Some(item) = stream.next().await {
			let value = item?;
			let height = value.get("height").and_then(|h| h.as_u64()).unwrap_or(0);
			let timestamp = value.get("timestamp").and_then(|t| t.as_u64()).unwrap_or(0);

			self.head.send_replace(HeadInfo { height, timestamp });
			if *self.consensus.borrow() != ConsensusState::Established {
				info!("Consensus established at height {}", height);
				self.consensus.send_replace(ConsensusState::Established);
			}
		}
		Ok(())
	}

	/// Open a `graphql-transport-ws` subscription and stream the `field` member of each payload.
	///
	/// # Errors
	/// Returns `ProviderError` if the WebSocket connection or handshake fails.
	async fn open_subscription(
		&self,
		id: &str,
		field: &'static str,
		query: String,
	) -> Result<SubscriptionStream, ProviderError> {
		debug!("Attempting WebSocket connection to: {}", self.ws_url);

		// Create WebSocket request with required subprotocol
		let mut request = self.ws_url.clone().into_client_request()?;
		request.headers_mut().insert(
			"Sec-WebSocket-Protocol",
			"graphql-transport-ws".parse().map_err(|_| {
				ProviderError::GraphQLError("Invalid WebSocket subprotocol header value".to_string())
			})?,
		);

		let (ws_stream, response) = connect_async(request).await?;
		debug!(
			"WebSocket connection established, response status: {}",
			response.status()
		);
		let (mut ws_sender, mut ws_receiver) = ws_stream.split();

		let init_message = json!({
			"type": "connection_init"
		});
		ws_sender
			.send(Message::Text(init_message.to_string()))
			.await?;

		// Wait for connection ack
		match ws_receiver.next().await {
			Some(msg) => match msg? {
				Message::Text(text) => {
					let parsed: serde_json::Value = serde_json::from_str(&text)?;
					if parsed.get("type")
						!= Some(&serde_json::Value::String("connection_ack".to_string()))
					{
						return Err(ProviderError::SessionError(
							"Connection not acknowledged".to_string(),
						));
					}
				}
				_ => {
					return Err(ProviderError::SessionError(
						"Unexpected message type during handshake".to_string(),
					));
				}
			},
			None => {
				return Err(ProviderError::SessionError(
					"Socket closed during handshake".to_string(),
				));
			}
		}

		let start_message = json!({
			"id": id,
			"type": "subscribe",
			"payload": {
				"query": query
			}
		});
		ws_sender
			.send(Message::Text(start_message.to_string()))
			.await?;

		// Keep the sink alive for as long as the stream is consumed
		let stream = ws_receiver
			.map(move |msg| {
				let _keep_open = &ws_sender;
				msg
			})
			.filter_map(move |msg| async move {
				match msg {
					Ok(Message::Text(text)) => {
						let parsed = match serde_json::from_str::<serde_json::Value>(&text) {
							Ok(parsed) => parsed,
							Err(e) => return Some(Err(ProviderError::JsonError(e))),
						};
						match parsed.get("type").and_then(|t| t.as_str()) {
							Some("next") => match parsed
								.get("payload")
								.and_then(|p| p.get("data"))
								.and_then(|d| d.get(field))
							{
								Some(data) => Some(Ok(data.clone())),
								None => Some(Err(ProviderError::NoData)),
							},
							Some("error") => {
								let error_msg = parsed
									.get("payload")
									.and_then(|p| p.get(0).or(Some(p)))
									.and_then(|p| p.get("message"))
									.and_then(|m| m.as_str())
									.unwrap_or("Unknown subscription error");
								Some(Err(ProviderError::GraphQLError(error_msg.to_string())))
							}
							Some("complete") => {
								debug!("Subscription {} completed", field);
								None
							}
							Some(other) => {
								debug!("Ignoring message type: {}", other);
								None
							}
							None => Some(Err(ProviderError::GraphQLError(
								"Message missing type field".to_string(),
							))),
						}
					}
					Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
					Ok(_) => Some(Err(ProviderError::GraphQLError(
						"Unexpected message type".to_string(),
					))),
					Err(e) => Some(Err(ProviderError::WebSocketError(e))),
				}
			});

		Ok(Box::pin(stream))
	}

	/// Execute a GraphQL query.
	///
	/// # Returns
	/// The JSON response from the indexer, or a `ProviderError` if the request fails.
	pub async fn execute_query(
		&self,
		query: &str,
		variables: Option<serde_json::Value>,
	) -> Result<serde_json::Value, ProviderError> {
		let request_body = json!({
			"query": query,
			"variables": variables
		});

		let response = self
			.http_client
			.post(&self.indexer_url)
			.header("Content-Type", "application/json")
			.json(&request_body)
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(ProviderError::GraphQLError(format!(
				"HTTP error: {}",
				response.status()
			)));
		}

		let response_json: serde_json::Value = response.json().await?;

		if let Some(errors) = response_json.get("errors") {
			return Err(ProviderError::GraphQLError(format!(
				"GraphQL errors: {}",
				errors
			)));
		}

		Ok(response_json)
	}
}

const TRANSACTION_FIELDS: &str = r#"
    hash
    blockHeight
    timestamp
    confirmations
    fee
    inputs { prevHash prevIndex address value }
    outputs { index address script value }
"#;

#[async_trait::async_trait]
impl UtxoProvider for UtxoIndexerClient {
	async fn transactions_by_address(
		&self,
		address: &str,
		since_height: u64,
		known_hints: &HashSet<String>,
	) -> Result<Vec<Transaction>, ProviderError> {
		let query = format!(
			r#"
            query AddressTransactions($address: String!, $sinceHeight: Int!, $knownHashes: [String!]) {{
                transactions(address: $address, sinceHeight: $sinceHeight, knownHashes: $knownHashes) {{
                    {TRANSACTION_FIELDS}
                }}
            }}
            "#
		);

		let mut hints: Vec<&String> = known_hints.iter().collect();
		hints.sort();
		let variables = json!({
			"address": address,
			"sinceHeight": since_height,
			"knownHashes": hints,
		});

		let response = self.execute_query(&query, Some(variables)).await?;
		let raw = response
			.get("data")
			.and_then(|data| data.get("transactions"))
			.cloned()
			.ok_or(ProviderError::NoData)?;

		let indexed: Vec<IndexedTransaction> = serde_json::from_value(raw)?;
		debug!("Indexer returned {} transactions for {}", indexed.len(), address);

		Ok(indexed
			.into_iter()
			.filter(|tx| !known_hints.contains(&tx.hash) || tx.block_height.is_none())
			.map(|tx| Transaction::from_indexed(tx, self.min_confirmations))
			.collect())
	}

	async fn add_transaction_listener(
		&self,
		addresses: Vec<String>,
		sink: mpsc::UnboundedSender<Transaction>,
	) -> Result<(), ProviderError> {
		let query = format!(
			r#"
            subscription AddressTransactions {{
                addressTransactions(addresses: {}) {{
                    {TRANSACTION_FIELDS}
                }}
            }}
            "#,
			serde_json::to_string(&addresses)?
		);

		let id = format!("listener-{}", addresses.first().map(String::as_str).unwrap_or("none"));
		let mut stream = self
			.open_subscription(&id, "addressTransactions", query)
			.await?;
		let min_confirmations = self.min_confirmations;

		tokio::spawn(async move {
			while let Some(item) = stream.next().await {
				let indexed = match item.and_then(|value| {
					serde_json::from_value::<IndexedTransaction>(value).map_err(ProviderError::from)
				}) {
					Ok(indexed) => indexed,
					Err(e) => {
						error!("Failed to decode live transaction: {}", e);
						continue;
					}
				};

				if sink
					.send(Transaction::from_indexed(indexed, min_confirmations))
					.is_err()
				{
					debug!("Transaction listener sink dropped, closing subscription");
					break;
				}
			}
		});

		Ok(())
	}

	fn consensus(&self) -> watch::Receiver<ConsensusState> {
		self.consensus.subscribe()
	}

	fn head(&self) -> watch::Receiver<HeadInfo> {
		self.head.subscribe()
	}
}
