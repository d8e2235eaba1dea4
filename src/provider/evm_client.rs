//! JSON-RPC client for EVM nodes.
//!
//! Implements [`EvmProvider`] on an `ethers` HTTP provider. Transport failures, timeouts and
//! node-side rate limiting are retried with exponential backoff; JSON-RPC errors that are not
//! transient are returned immediately.

use super::abi;
use super::{EvmProvider, LogFilter, ProviderError, RawLog, TransactionReceipt};

use backoff::{ExponentialBackoff, future::retry};
use ethers::abi::ParamType;
use ethers::providers::{Http, Middleware, Provider, ProviderError as RpcClientError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, TransactionRequest, U256};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// JSON-RPC error codes worth retrying (limit exceeded, resource unavailable).
const TRANSIENT_RPC_CODES: [i64; 3] = [-32005, -32002, 429];

/// Retry policy for a single JSON-RPC call.
#[derive(Debug, Clone)]
pub struct RpcRetryConfig {
	pub initial_interval: Duration,
	pub max_elapsed_time: Duration,
}

impl Default for RpcRetryConfig {
	fn default() -> Self {
		Self {
			initial_interval: Duration::from_millis(250),
			max_elapsed_time: Duration::from_secs(20),
		}
	}
}

/// EVM JSON-RPC client
pub struct EvmRpcClient {
	provider: Provider<Http>,
	timeout: Duration,
	retry: RpcRetryConfig,
	/// Signature of the transfer contract's nonce getter.
	nonce_method: String,
}

/// Whether a failed call is worth repeating.
fn is_transient(error: &RpcClientError) -> bool {
	match error.as_error_response() {
		Some(response) => TRANSIENT_RPC_CODES.contains(&response.code),
		None => error.as_serde_error().is_none(),
	}
}

impl EvmRpcClient {
	/// Create a new client for the node at `rpc_url`.
	pub fn new(rpc_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
		let provider = Provider::<Http>::try_from(rpc_url).map_err(|e| {
			ProviderError::Unavailable(format!("invalid RPC URL {rpc_url}: {e}"))
		})?;

		Ok(Self {
			provider,
			timeout,
			retry: RpcRetryConfig::default(),
			nonce_method: "getNonce(address)".to_string(),
		})
	}

	pub fn with_retry(mut self, retry: RpcRetryConfig) -> Self {
		self.retry = retry;
		self
	}

	/// Use a different nonce getter, e.g. `nonces(address)` for EIP-2612 style contracts.
	pub fn with_nonce_method(mut self, signature: impl Into<String>) -> Self {
		self.nonce_method = signature.into();
		self
	}

	/// Run one provider call under the timeout and retry policy.
	async fn request<T, F, Fut>(&self, method: &'static str, call: F) -> Result<T, ProviderError>
	where
		F: Fn() -> Fut,
		Fut: Future<Output = Result<T, RpcClientError>>,
	{
		let backoff = ExponentialBackoff {
			initial_interval: self.retry.initial_interval,
			max_elapsed_time: Some(self.retry.max_elapsed_time),
			..ExponentialBackoff::default()
		};
		let call = &call;
		let timeout = self.timeout;

		retry(backoff, move || async move {
			match tokio::time::timeout(timeout, call()).await {
				Ok(Ok(value)) => Ok(value),
				Ok(Err(e)) if is_transient(&e) => {
					warn!("{} failed, retrying: {}", method, e);
					Err(backoff::Error::transient(ProviderError::from(e)))
				}
				Ok(Err(e)) => Err(backoff::Error::permanent(ProviderError::from(e))),
				Err(_) => {
					warn!("{} timed out after {:?}", method, timeout);
					Err(backoff::Error::transient(ProviderError::RpcError {
						method: method.to_string(),
						message: format!("timed out after {timeout:?}"),
					}))
				}
			}
		})
		.await
	}

	/// `eth_call` returning a single uint256; an empty result (no contract) reads as zero.
	async fn call_uint(&self, to: Address, calldata: Bytes) -> Result<U256, ProviderError> {
		let tx: TypedTransaction = TransactionRequest::new().to(to).data(calldata).into();
		let output = self
			.request("eth_call", || self.provider.call(&tx, None))
			.await?;
		if output.is_empty() {
			return Ok(U256::zero());
		}
		let tokens = abi::decode(&[ParamType::Uint(256)], &output)?;
		Ok(abi::uint_at(&tokens, 0)?)
	}
}

#[async_trait::async_trait]
impl EvmProvider for EvmRpcClient {
	async fn block_number(&self) -> Result<u64, ProviderError> {
		let number = self
			.request("eth_blockNumber", || self.provider.get_block_number())
			.await?;
		Ok(number.as_u64())
	}

	async fn query_logs(
		&self,
		filter: &LogFilter,
		from_block: u64,
		to_block: u64,
	) -> Result<Vec<RawLog>, ProviderError> {
		let filter = filter.to_filter(from_block, to_block);
		debug!("eth_getLogs [{}..={}] {:?}", from_block, to_block, filter);

		let logs = self
			.request("eth_getLogs", || self.provider.get_logs(&filter))
			.await?;
		logs.into_iter()
			.map(|log| RawLog::try_from(log).map_err(ProviderError::from))
			.collect()
	}

	async fn transaction_receipt(
		&self,
		hash: H256,
	) -> Result<Option<TransactionReceipt>, ProviderError> {
		let receipt = self
			.request("eth_getTransactionReceipt", || {
				self.provider.get_transaction_receipt(hash)
			})
			.await?;
		receipt
			.map(|receipt| TransactionReceipt::try_from(receipt).map_err(ProviderError::from))
			.transpose()
	}

	async fn block_timestamp(&self, number: u64) -> Result<u64, ProviderError> {
		let block = self
			.request("eth_getBlockByNumber", || self.provider.get_block(number))
			.await?
			.ok_or(ProviderError::NoData)?;
		Ok(abi::to_u64(block.timestamp)?)
	}

	async fn erc20_balance(&self, token: Address, owner: Address) -> Result<U256, ProviderError> {
		self.call_uint(token, abi::address_call("balanceOf(address)", &[owner]))
			.await
	}

	async fn erc20_allowance(
		&self,
		token: Address,
		owner: Address,
		spender: Address,
	) -> Result<U256, ProviderError> {
		self.call_uint(
			token,
			abi::address_call("allowance(address,address)", &[owner, spender]),
		)
		.await
	}

	async fn transfer_nonce(&self, contract: Address, owner: Address) -> Result<u64, ProviderError> {
		let nonce = self
			.call_uint(contract, abi::address_call(&self.nonce_method, &[owner]))
			.await?;
		Ok(abi::to_u64(nonce)?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use ethers::providers::{HttpClientError, JsonRpcError};

	fn rpc_error(code: i64) -> RpcClientError {
		RpcClientError::JsonRpcClientError(Box::new(HttpClientError::JsonRpcError(JsonRpcError {
			code,
			message: "node error".to_string(),
			data: None,
		})))
	}

	#[test]
	fn rate_limits_and_transport_failures_are_retried() {
		assert!(is_transient(&rpc_error(-32005)));
		assert!(is_transient(&rpc_error(429)));
		assert!(is_transient(&RpcClientError::CustomError("connection reset".to_string())));
	}

	#[test]
	fn execution_and_parse_errors_are_permanent() {
		assert!(!is_transient(&rpc_error(-32000)));
		let parse = serde_json::from_str::<u64>("not a number").unwrap_err();
		assert!(!is_transient(&RpcClientError::SerdeJson(parse)));
	}

	#[test]
	fn malformed_url_is_rejected() {
		assert!(matches!(
			EvmRpcClient::new("not a url", Duration::from_secs(1)),
			Err(ProviderError::Unavailable(_))
		));
	}

	#[tokio::test]
	async fn unreachable_node_fails_after_the_retry_budget() {
		let client = EvmRpcClient::new("http://127.0.0.1:9", Duration::from_millis(200))
			.unwrap()
			.with_retry(RpcRetryConfig {
				initial_interval: Duration::from_millis(10),
				max_elapsed_time: Duration::from_millis(100),
			});

		assert!(client.block_number().await.is_err());
	}
}
