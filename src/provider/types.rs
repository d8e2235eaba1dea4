//! Wire types shared by the remote chain-data providers.

use ethers::types::{Address, Bytes, Filter, H256, Log};
use serde::{Deserialize, Serialize};

use super::abi::DecodeError;

/// Consensus state reported by the UTXO chain-data provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusState {
	/// Initial catch-up, no usable head yet
	Syncing,
	/// Connected and following the chain head
	Established,
	/// Connection lost, reconnecting
	Connecting,
}

/// Chain head as last announced by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadInfo {
	pub height: u64,
	pub timestamp: u64,
}

/// Transaction input as returned by the UTXO indexer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexedInput {
	/// Hash of the transaction holding the spent output.
	pub prev_hash: String,
	/// Index of the spent output.
	pub prev_index: u32,
	/// Address that owned the spent output, when the indexer resolved it.
	pub address: Option<String>,
	/// Value of the spent output, when the indexer resolved it.
	pub value: Option<u64>,
}

/// Transaction output as returned by the UTXO indexer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexedOutput {
	pub index: u32,
	pub address: Option<String>,
	/// Hex encoded locking script.
	pub script: String,
	pub value: u64,
}

/// Transaction data from the UTXO indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedTransaction {
	pub hash: String,
	/// Height of the including block, absent while in the mempool.
	pub block_height: Option<u64>,
	pub timestamp: Option<u64>,
	#[serde(default)]
	pub confirmations: u64,
	#[serde(default)]
	pub fee: Option<u64>,
	#[serde(default)]
	pub inputs: Vec<IndexedInput>,
	#[serde(default)]
	pub outputs: Vec<IndexedOutput>,
}

/// Log filter for `eth_getLogs`. Topics are positional; `None` matches anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
	pub address: Address,
	pub topics: Vec<Option<H256>>,
}

impl LogFilter {
	pub fn new(address: Address) -> Self {
		Self {
			address,
			topics: Vec::new(),
		}
	}

	/// Set the topic at `position`, padding earlier positions with wildcards.
	pub fn topic(mut self, position: usize, topic: Option<H256>) -> Self {
		if self.topics.len() <= position {
			self.topics.resize(position + 1, None);
		}
		self.topics[position] = topic;
		self
	}

	/// The `ethers` filter for the inclusive block range `[from_block, to_block]`.
	pub fn to_filter(&self, from_block: u64, to_block: u64) -> Filter {
		let mut filter = Filter::new()
			.from_block(from_block)
			.to_block(to_block)
			.address(self.address);
		for (position, topic) in self.topics.iter().enumerate() {
			let Some(topic) = *topic else { continue };
			filter = match position {
				0 => filter.topic0(topic),
				1 => filter.topic1(topic),
				2 => filter.topic2(topic),
				_ => filter.topic3(topic),
			};
		}
		filter
	}

	/// Whether `log` passes this filter, ignoring block numbers.
	pub fn matches(&self, log: &RawLog) -> bool {
		log.address == self.address
			&& self
				.topics
				.iter()
				.enumerate()
				.all(|(position, topic)| topic.is_none_or(|t| log.topics.get(position) == Some(&t)))
	}
}

/// An EVM log whose position fields are known to be present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
	/// Emitting contract.
	pub address: Address,
	pub topics: Vec<H256>,
	pub data: Bytes,
	pub block_number: u64,
	pub transaction_hash: H256,
	pub log_index: u64,
}

impl TryFrom<Log> for RawLog {
	type Error = DecodeError;

	fn try_from(log: Log) -> Result<Self, Self::Error> {
		Ok(RawLog {
			address: log.address,
			topics: log.topics,
			data: log.data,
			block_number: log
				.block_number
				.ok_or(DecodeError::Incomplete("block number"))?
				.as_u64(),
			transaction_hash: log
				.transaction_hash
				.ok_or(DecodeError::Incomplete("transaction hash"))?,
			log_index: log.log_index.map(|index| index.low_u64()).unwrap_or_default(),
		})
	}
}

/// Transaction receipt with its logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
	pub transaction_hash: H256,
	pub block_number: u64,
	/// `true` when the transaction executed successfully.
	pub status: bool,
	pub logs: Vec<RawLog>,
}

impl TryFrom<ethers::types::TransactionReceipt> for TransactionReceipt {
	type Error = DecodeError;

	fn try_from(receipt: ethers::types::TransactionReceipt) -> Result<Self, Self::Error> {
		Ok(TransactionReceipt {
			transaction_hash: receipt.transaction_hash,
			block_number: receipt
				.block_number
				.ok_or(DecodeError::Incomplete("block number"))?
				.as_u64(),
			status: receipt.status.is_none_or(|status| !status.is_zero()),
			logs: receipt
				.logs
				.into_iter()
				.map(RawLog::try_from)
				.collect::<Result<_, _>>()?,
		})
	}
}

/// Error types for provider operations
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
	#[error("GraphQL error: {0}")]
	GraphQLError(String),

	#[error("No data returned")]
	NoData,

	#[error("WebSocket error: {0}")]
	WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

	#[error("HTTP error: {0}")]
	HttpError(#[from] reqwest::Error),

	#[error("JSON parse error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Session error: {0}")]
	SessionError(String),

	#[error("RPC error in {method}: {message}")]
	RpcError { method: String, message: String },

	#[error("EVM provider error: {0}")]
	EvmProvider(#[from] ethers::providers::ProviderError),

	#[error("Decode error: {0}")]
	DecodeError(#[from] DecodeError),

	#[error("Provider unavailable: {0}")]
	Unavailable(String),
}

#[cfg(test)]
mod tests {
	use super::*;
	use ethers::types::{U64, U256, ValueOrArray};

	#[test]
	fn filter_places_topics_by_position() {
		let token = Address::repeat_byte(0x66);
		let owner = H256::repeat_byte(0x11);
		let filter = LogFilter::new(token).topic(2, Some(owner)).to_filter(100, 200);

		assert_eq!(filter.get_from_block(), Some(U64::from(100)));
		assert_eq!(filter.get_to_block(), Some(U64::from(200)));
		assert_eq!(filter.address, Some(ValueOrArray::Value(token)));
		assert_eq!(filter.topics[0], None);
		assert_eq!(filter.topics[1], None);
		assert_eq!(filter.topics[2], Some(ValueOrArray::Value(Some(owner))));
	}

	#[test]
	fn log_without_position_is_rejected() {
		let log = Log {
			address: Address::repeat_byte(0xaa),
			block_number: Some(U64::from(16)),
			transaction_hash: Some(H256::repeat_byte(0xab)),
			log_index: Some(U256::from(2)),
			..Log::default()
		};

		let raw = RawLog::try_from(log.clone()).unwrap();
		assert_eq!(raw.block_number, 16);
		assert_eq!(raw.log_index, 2);
		assert!(LogFilter::new(Address::repeat_byte(0xaa)).matches(&raw));
		assert!(!LogFilter::new(Address::repeat_byte(0xaa))
			.topic(0, Some(H256::zero()))
			.matches(&raw));

		let pending = Log {
			block_number: None,
			..log
		};
		assert!(matches!(
			RawLog::try_from(pending),
			Err(DecodeError::Incomplete("block number"))
		));
	}
}
