use crate::provider::{IndexedTransaction, ProviderError};

use serde::{Deserialize, Serialize};

/// Derivation branch of a UTXO-chain address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainRole {
	/// Receiving addresses handed out to payers
	External,
	/// Change addresses
	Internal,
}

impl std::fmt::Display for ChainRole {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ChainRole::External => write!(f, "external"),
			ChainRole::Internal => write!(f, "internal"),
		}
	}
}

/// An unspent output owned by one of our addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Utxo {
	pub tx_hash: String,
	pub output_index: u32,
	/// Hex encoded locking script.
	pub locking_script: String,
	pub value: u64,
}

/// A derived UTXO-chain address and what we know about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
	pub address: String,
	pub role: ChainRole,
	/// Number of distinct transactions seen touching this address.
	pub usage_count: u32,
	pub utxos: Vec<Utxo>,
}

impl AddressRecord {
	pub fn new(address: impl Into<String>, role: ChainRole) -> Self {
		Self {
			address: address.into(),
			role,
			usage_count: 0,
			utxos: Vec::new(),
		}
	}

	pub fn is_used(&self) -> bool {
		self.usage_count > 0 || !self.utxos.is_empty()
	}

	pub fn balance(&self) -> u64 {
		self.utxos.iter().map(|utxo| utxo.value).sum()
	}
}

/// Lifecycle of a canonical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
	Pending,
	Mined,
	Confirmed,
	Failed,
}

impl TransactionState {
	/// Pending and mined entries may still change state.
	pub fn is_final(&self) -> bool {
		matches!(self, TransactionState::Confirmed | TransactionState::Failed)
	}
}

/// Phase of a hash time-locked contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum HtlcEvent {
	Open {
		id: String,
		token: String,
		amount: u128,
		recipient: String,
		hash: String,
		timeout: u128,
	},
	Redeem {
		id: String,
		secret: String,
	},
	Refund {
		id: String,
	},
}

impl HtlcEvent {
	pub fn id(&self) -> &str {
		match self {
			HtlcEvent::Open { id, .. } | HtlcEvent::Redeem { id, .. } | HtlcEvent::Refund { id } => id,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapEvent {
	pub amount_in: u128,
	pub amount_out: u128,
}

/// Contract-level meaning attached to a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEvent {
	Htlc(HtlcEvent),
	Swap(SwapEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoInput {
	pub prev_hash: String,
	pub prev_index: u32,
	pub address: Option<String>,
	pub value: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoOutput {
	pub index: u32,
	pub address: Option<String>,
	pub script: String,
	pub value: u64,
}

/// Raw input/output structure kept for UTXO-chain transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoDetails {
	pub inputs: Vec<UtxoInput>,
	pub outputs: Vec<UtxoOutput>,
}

/// Identity under which a transaction is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxKey {
	pub hash: String,
	/// Present for EVM log-derived entries.
	pub log_index: Option<u64>,
}

/// Canonical, chain-agnostic transaction record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
	pub hash: String,
	pub log_index: Option<u64>,
	/// Token contract for EVM entries.
	pub token: Option<String>,
	pub involved_addresses: Vec<String>,
	pub sender: Option<String>,
	pub recipient: Option<String>,
	pub value: u128,
	pub fee: u128,
	pub state: TransactionState,
	pub block_height: Option<u64>,
	pub timestamp: Option<u64>,
	pub event: Option<ChainEvent>,
	pub utxo: Option<UtxoDetails>,
}

impl Transaction {
	pub fn key(&self) -> TxKey {
		TxKey {
			hash: self.hash.clone(),
			log_index: self.log_index,
		}
	}

	pub fn involves(&self, address: &str) -> bool {
		self.involved_addresses.iter().any(|a| a == address)
	}

	/// Build the canonical form of an indexer transaction.
	pub fn from_indexed(indexed: IndexedTransaction, min_confirmations: u64) -> Self {
		let state = match indexed.block_height {
			None => TransactionState::Pending,
			Some(_) if indexed.confirmations >= min_confirmations => TransactionState::Confirmed,
			Some(_) => TransactionState::Mined,
		};

		let mut involved: Vec<String> = indexed
			.inputs
			.iter()
			.filter_map(|input| input.address.clone())
			.chain(
				indexed
					.outputs
					.iter()
					.filter_map(|output| output.address.clone()),
			)
			.collect();
		involved.sort();
		involved.dedup();

		let value = indexed.outputs.iter().map(|o| o.value as u128).sum();

		Self {
			hash: indexed.hash,
			log_index: None,
			token: None,
			involved_addresses: involved,
			sender: indexed.inputs.first().and_then(|i| i.address.clone()),
			recipient: indexed.outputs.first().and_then(|o| o.address.clone()),
			value,
			fee: indexed.fee.unwrap_or_default() as u128,
			state,
			block_height: indexed.block_height,
			timestamp: indexed.timestamp,
			event: None,
			utxo: Some(UtxoDetails {
				inputs: indexed
					.inputs
					.into_iter()
					.map(|i| UtxoInput {
						prev_hash: i.prev_hash,
						prev_index: i.prev_index,
						address: i.address,
						value: i.value,
					})
					.collect(),
				outputs: indexed
					.outputs
					.into_iter()
					.map(|o| UtxoOutput {
						index: o.index,
						address: o.address,
						script: o.script,
						value: o.value,
					})
					.collect(),
			}),
		}
	}
}

/// Errors raised while synchronizing wallet history
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum WalletSyncError {
	#[error("Provider error: {0}")]
	ProviderError(#[from] ProviderError),

	#[error(
		"Derivation continuity violated for {role} chain: expected {expected}, provider returned {found}"
	)]
	DerivationMismatch {
		role: ChainRole,
		expected: String,
		found: String,
	},

	#[error("Address provider returned no new {0} addresses")]
	NoNewAddresses(ChainRole),

	#[error("Reconcile error: {0}")]
	ReconcileError(#[from] crate::wallet::sync::log_classifier::ReconcileError),

	#[error("Persistence error: {0}")]
	PersistenceError(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("Sync error: {0}")]
	SyncError(String),

	#[error("Scan aborted: {0}")]
	Aborted(String),
}

impl WalletSyncError {
	/// Errors that must be surfaced to the user rather than retried on the next trigger.
	pub fn is_fatal(&self) -> bool {
		matches!(
			self,
			WalletSyncError::DerivationMismatch { .. } | WalletSyncError::NoNewAddresses(_)
		)
	}
}
