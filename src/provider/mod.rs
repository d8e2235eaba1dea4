//! Remote chain-data providers.
//!
//! The synchronizer only ever talks to the traits defined here. Concrete clients are provided for
//! a GraphQL UTXO indexer (HTTP queries plus `graphql-transport-ws` subscriptions) and for an EVM
//! JSON-RPC node reached through `ethers`. The address-provisioning collaborator (the external
//! signer) lives in `hub`.

/// Solidity ABI helpers
pub mod abi;
/// EVM JSON-RPC client on `ethers`
mod evm_client;
/// Address-provisioning collaborator
pub mod hub;
/// Type definitions for provider data structures
mod types;
/// GraphQL client for the UTXO indexer
mod utxo_client;

pub use evm_client::{EvmRpcClient, RpcRetryConfig};
pub use hub::{AddressProvider, PreloadedAddressProvider};
pub use types::*;
pub use utxo_client::UtxoIndexerClient;

use crate::wallet::Transaction;
use ethers::types::{Address, H256, U256};
use std::collections::HashSet;
use tokio::sync::{mpsc, watch};

/// Read access to a UTXO chain.
#[async_trait::async_trait]
pub trait UtxoProvider: Send + Sync {
	/// Fetch transactions touching `address` since `since_height`.
	///
	/// `known_hints` lists transaction hashes the caller already holds; providers may omit them.
	async fn transactions_by_address(
		&self,
		address: &str,
		since_height: u64,
		known_hints: &HashSet<String>,
	) -> Result<Vec<Transaction>, ProviderError>;

	/// Push transactions touching any of `addresses` into `sink` as they appear.
	async fn add_transaction_listener(
		&self,
		addresses: Vec<String>,
		sink: mpsc::UnboundedSender<Transaction>,
	) -> Result<(), ProviderError>;

	/// Resolve once consensus is established.
	async fn wait_for_consensus_established(&self) -> Result<(), ProviderError> {
		let mut consensus = self.consensus();
		consensus
			.wait_for(|state| *state == ConsensusState::Established)
			.await
			.map_err(|_| ProviderError::Unavailable("consensus channel closed".to_string()))?;
		Ok(())
	}

	fn consensus(&self) -> watch::Receiver<ConsensusState>;

	fn head(&self) -> watch::Receiver<HeadInfo>;
}

/// Read access to an EVM chain.
#[async_trait::async_trait]
pub trait EvmProvider: Send + Sync {
	async fn block_number(&self) -> Result<u64, ProviderError>;

	async fn query_logs(
		&self,
		filter: &LogFilter,
		from_block: u64,
		to_block: u64,
	) -> Result<Vec<RawLog>, ProviderError>;

	async fn transaction_receipt(
		&self,
		hash: H256,
	) -> Result<Option<TransactionReceipt>, ProviderError>;

	async fn block_timestamp(&self, number: u64) -> Result<u64, ProviderError>;

	/// `balanceOf(owner)` on an ERC-20 token.
	async fn erc20_balance(&self, token: Address, owner: Address) -> Result<U256, ProviderError>;

	/// `allowance(owner, spender)` on an ERC-20 token.
	async fn erc20_allowance(
		&self,
		token: Address,
		owner: Address,
		spender: Address,
	) -> Result<U256, ProviderError>;

	/// Meta-transaction nonce of `owner` in the transfer contract.
	async fn transfer_nonce(&self, contract: Address, owner: Address) -> Result<u64, ProviderError>;
}
