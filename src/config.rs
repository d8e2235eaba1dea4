//! Runtime configuration for the synchronization engine.
//!
//! Every section has defaults, so a config file only needs to name what differs. The file is JSON
//! and is located through the `CHAIN_SYNC_CONFIG` environment variable.

use crate::provider::abi::{self, DecodeError};
use crate::transaction::FeeWeights;

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable naming the JSON config file.
pub const CONFIG_ENV: &str = "CHAIN_SYNC_CONFIG";

const DEFAULT_EXTERNAL_GAP_LIMIT: usize = 10;
const DEFAULT_INTERNAL_GAP_LIMIT: usize = 5;
const DEFAULT_DUST_LIMIT: u64 = 546;
const DEFAULT_FETCH_DEBOUNCE_MS: u64 = 1_000;
const DEFAULT_VISIBILITY_RESYNC_SECS: u64 = 60;
const DEFAULT_BLOCK_STEP: u64 = 2_000;
const DEFAULT_EVM_CONFIRMATIONS: u64 = 12;
const DEFAULT_RELAY_LOOKBACK_BLOCKS: u64 = 60_000;
const DEFAULT_RELAY_BATCH_BLOCKS: u64 = 5_000;
const DEFAULT_RELAY_MAX_CANDIDATES: usize = 10;
const DEFAULT_RELAY_HEALTH_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("Failed to read config file {path:?}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("Failed to parse config: {0}")]
	Parse(#[from] serde_json::Error),

	#[error("Invalid config: {0}")]
	Invalid(String),
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WalletSyncConfig {
	pub account: AccountConfig,
	pub utxo: UtxoSyncConfig,
	pub evm: EvmSyncConfig,
	pub relay: RelayConfig,
	pub storage: StorageConfig,
}

/// The account being synchronized and the addresses exported for it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AccountConfig {
	pub id: String,
	/// Receiving addresses exported by the signer, in derivation order.
	pub external_addresses: Vec<String>,
	/// Change addresses exported by the signer, in derivation order.
	pub internal_addresses: Vec<String>,
	/// Leading external addresses already tracked before this run.
	pub known_external: usize,
	pub known_internal: usize,
	/// EVM owner address; token scanning is idle without one.
	pub evm_address: Option<String>,
}

impl Default for AccountConfig {
	fn default() -> Self {
		Self {
			id: "default".to_string(),
			external_addresses: Vec::new(),
			internal_addresses: Vec::new(),
			known_external: 0,
			known_internal: 0,
			evm_address: None,
		}
	}
}

impl AccountConfig {
	/// Addresses tracked from the start, per role.
	pub fn tracked(&self) -> (Vec<String>, Vec<String>) {
		let take = |addresses: &[String], known: usize| {
			addresses.iter().take(known).cloned().collect::<Vec<_>>()
		};
		(
			take(&self.external_addresses, self.known_external),
			take(&self.internal_addresses, self.known_internal),
		)
	}
}

/// UTXO-chain discovery, history and spending parameters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UtxoSyncConfig {
	/// GraphQL HTTP endpoint of the indexer.
	pub indexer_url: String,
	/// GraphQL WebSocket endpoint of the indexer.
	pub indexer_ws_url: String,
	/// Consecutive unused receiving addresses that end discovery.
	pub external_gap_limit: usize,
	/// Consecutive unused change addresses that end discovery.
	pub internal_gap_limit: usize,
	pub dust_limit: u64,
	pub fee_weights: FeeWeights,
	/// Depth at which indexer transactions count as confirmed.
	pub min_confirmations: u64,
	/// Delay before a finished fetch stops counting as in flight.
	pub fetch_debounce_ms: u64,
	/// Hidden period after which becoming visible forces a resync.
	pub visibility_resync_secs: u64,
}

impl Default for UtxoSyncConfig {
	fn default() -> Self {
		Self {
			indexer_url: "http://localhost:8088/api/v1/graphql".to_string(),
			indexer_ws_url: "ws://localhost:8088/api/v1/graphql/ws".to_string(),
			external_gap_limit: DEFAULT_EXTERNAL_GAP_LIMIT,
			internal_gap_limit: DEFAULT_INTERNAL_GAP_LIMIT,
			dust_limit: DEFAULT_DUST_LIMIT,
			fee_weights: FeeWeights::default(),
			min_confirmations: 1,
			fetch_debounce_ms: DEFAULT_FETCH_DEBOUNCE_MS,
			visibility_resync_secs: DEFAULT_VISIBILITY_RESYNC_SECS,
		}
	}
}

/// Per-token ledger settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TokenConfig {
	/// ERC-20 contract address.
	pub address: String,
	pub symbol: String,
	/// Lowest block worth scanning, usually the token deployment block.
	pub earliest_scan_height: u64,
	/// DEX pools and similar addresses whose incoming transfers are fees.
	pub fee_sinks: Vec<String>,
	/// Pre-upgrade transfer contracts; transfers to them are fees as well.
	pub legacy_contracts: Vec<String>,
}

impl TokenConfig {
	/// Fee sinks and legacy contracts.
	pub fn fee_sink_addresses(&self) -> Result<Vec<Address>, DecodeError> {
		self.fee_sinks
			.iter()
			.chain(self.legacy_contracts.iter())
			.map(|address| abi::parse_address(address))
			.collect()
	}
}

/// EVM ledger scanning parameters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EvmSyncConfig {
	pub rpc_url: String,
	pub rpc_timeout_secs: u64,
	/// Width of one backward log-query window.
	pub block_step: u64,
	/// Depth at which a mined transfer is final.
	pub confirmations: u64,
	/// Meta-transaction transfer contract.
	pub transfer_contract: String,
	/// Signature of the transfer contract's nonce getter.
	pub nonce_method: String,
	pub htlc_contract: String,
	/// Swap/conversion contracts that pay out the native token.
	pub swap_contracts: Vec<String>,
	/// Token paid out by swap contracts.
	pub native_token: String,
	pub tokens: Vec<TokenConfig>,
}

impl Default for EvmSyncConfig {
	fn default() -> Self {
		Self {
			rpc_url: "http://localhost:8545".to_string(),
			rpc_timeout_secs: 15,
			block_step: DEFAULT_BLOCK_STEP,
			confirmations: DEFAULT_EVM_CONFIRMATIONS,
			transfer_contract: String::new(),
			nonce_method: "getNonce(address)".to_string(),
			htlc_contract: String::new(),
			swap_contracts: Vec::new(),
			native_token: String::new(),
			tokens: Vec::new(),
		}
	}
}

/// Gasless relay discovery and acceptance limits.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
	/// Contract emitting `RelayServerRegistered`.
	pub relay_hub: String,
	pub lookback_blocks: u64,
	pub batch_blocks: u64,
	pub max_candidates: usize,
	pub health_timeout_ms: u64,
	/// Highest acceptable percentage fee.
	pub max_pct_fee: u128,
	/// Highest acceptable base fee, in wei.
	pub max_base_fee: u128,
	/// Network id relays must report.
	pub network_id: String,
	/// Required prefix of the relay's protocol version.
	pub version_prefix: String,
	/// Minimum acceptance budget a relay must advertise.
	pub min_acceptance_budget: u128,
}

impl Default for RelayConfig {
	fn default() -> Self {
		Self {
			relay_hub: String::new(),
			lookback_blocks: DEFAULT_RELAY_LOOKBACK_BLOCKS,
			batch_blocks: DEFAULT_RELAY_BATCH_BLOCKS,
			max_candidates: DEFAULT_RELAY_MAX_CANDIDATES,
			health_timeout_ms: DEFAULT_RELAY_HEALTH_TIMEOUT_MS,
			max_pct_fee: 70,
			max_base_fee: 0,
			network_id: "1".to_string(),
			version_prefix: "2.".to_string(),
			min_acceptance_budget: 0,
		}
	}
}

/// Where synchronized state is kept.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
	pub data_dir: PathBuf,
	pub enable_persistence: bool,
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self {
			data_dir: PathBuf::from("./data/sync"),
			enable_persistence: true,
		}
	}
}

impl WalletSyncConfig {
	/// Load from the file named by `CHAIN_SYNC_CONFIG`, or defaults when it is unset.
	pub fn load() -> Result<Self, ConfigError> {
		match std::env::var_os(CONFIG_ENV) {
			Some(path) => Self::from_file(Path::new(&path)),
			None => {
				info!("{} not set, using default configuration", CONFIG_ENV);
				let config = Self::default();
				config.validate()?;
				Ok(config)
			}
		}
	}

	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
			path: path.to_path_buf(),
			source,
		})?;
		let config: Self = serde_json::from_str(&content)?;
		config.validate()?;
		info!("Loaded configuration from {:?}", path);
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.utxo.external_gap_limit == 0 || self.utxo.internal_gap_limit == 0 {
			return Err(ConfigError::Invalid(
				"gap limits must be greater than zero".to_string(),
			));
		}
		if self.account.id.is_empty() {
			return Err(ConfigError::Invalid("account.id must not be empty".to_string()));
		}
		if self.account.known_external > self.account.external_addresses.len()
			|| self.account.known_internal > self.account.internal_addresses.len()
		{
			return Err(ConfigError::Invalid(
				"account knows more addresses than it exports".to_string(),
			));
		}
		if self.evm.block_step == 0 {
			return Err(ConfigError::Invalid(
				"evm.block_step must be greater than zero".to_string(),
			));
		}
		if self.relay.batch_blocks == 0 {
			return Err(ConfigError::Invalid(
				"relay.batch_blocks must be greater than zero".to_string(),
			));
		}
		for token in &self.evm.tokens {
			if token.address.is_empty() {
				return Err(ConfigError::Invalid(format!(
					"token {:?} has no contract address",
					token.symbol
				)));
			}
			check_address("token address", &token.address)?;
			token.fee_sink_addresses().map_err(invalid_address)?;
		}

		let optional = [
			("evm.transfer_contract", &self.evm.transfer_contract),
			("evm.htlc_contract", &self.evm.htlc_contract),
			("evm.native_token", &self.evm.native_token),
			("relay.relay_hub", &self.relay.relay_hub),
		];
		for (name, address) in optional {
			if !address.is_empty() {
				check_address(name, address)?;
			}
		}
		for address in &self.evm.swap_contracts {
			check_address("evm.swap_contracts", address)?;
		}
		if let Some(address) = &self.account.evm_address {
			check_address("account.evm_address", address)?;
		}
		Ok(())
	}
}

fn invalid_address(error: DecodeError) -> ConfigError {
	ConfigError::Invalid(error.to_string())
}

fn check_address(name: &str, address: &str) -> Result<(), ConfigError> {
	abi::parse_address(address)
		.map(|_| ())
		.map_err(|e| ConfigError::Invalid(format!("{name}: {e}")))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn defaults_are_valid() {
		let config = WalletSyncConfig::default();
		assert!(config.validate().is_ok());
		assert_eq!(config.utxo.external_gap_limit, 10);
		assert_eq!(config.utxo.internal_gap_limit, 5);
		assert_eq!(config.utxo.dust_limit, 546);
	}

	#[test]
	fn partial_file_keeps_defaults() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(
			file,
			r#"{{
				"evm": {{
					"block_step": 500,
					"tokens": [{{
						"address": "0x6666666666666666666666666666666666666666",
						"fee_sinks": ["0x2222222222222222222222222222222222222AbC"]
					}}]
				}}
			}}"#
		)
		.unwrap();

		let config = WalletSyncConfig::from_file(file.path()).unwrap();
		assert_eq!(config.evm.block_step, 500);
		assert_eq!(config.evm.confirmations, 12);
		assert_eq!(config.utxo.external_gap_limit, 10);
		assert_eq!(
			config.evm.tokens[0].fee_sink_addresses().unwrap(),
			vec![abi::parse_address("0x2222222222222222222222222222222222222abc").unwrap()]
		);
	}

	#[test]
	fn malformed_contract_addresses_are_rejected() {
		let mut config = WalletSyncConfig::default();
		config.evm.tokens.push(TokenConfig {
			address: "0x6666666666666666666666666666666666666666".to_string(),
			fee_sinks: vec!["0xPOOL".to_string()],
			..TokenConfig::default()
		});
		assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

		let mut config = WalletSyncConfig::default();
		config.relay.relay_hub = "hub".to_string();
		assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

		let mut config = WalletSyncConfig::default();
		config.account.evm_address = Some("0x1234".to_string());
		assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
	}

	#[test]
	fn account_tracks_known_prefix() {
		let config: WalletSyncConfig = serde_json::from_str(
			r#"{
				"account": {
					"id": "alice",
					"external_addresses": ["e0", "e1", "e2"],
					"internal_addresses": ["i0"],
					"known_external": 2
				}
			}"#,
		)
		.unwrap();

		assert!(config.validate().is_ok());
		let (external, internal) = config.account.tracked();
		assert_eq!(external, vec!["e0", "e1"]);
		assert!(internal.is_empty());
		assert_eq!(config.account.evm_address, None);
	}

	#[test]
	fn knowing_unexported_addresses_is_rejected() {
		let mut config = WalletSyncConfig::default();
		config.account.known_internal = 1;
		assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
	}

	#[test]
	fn zero_gap_limit_is_rejected() {
		let mut config = WalletSyncConfig::default();
		config.utxo.internal_gap_limit = 0;
		assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
	}
}
