//! Backward EVM log scanning with balance reconciliation.
//!
//! A scan session starts from the chain head with the owner's current balance, transfer nonce and
//! outstanding allowances as counters. Each window of Transfer logs is walked back out of those
//! counters; the scan stops once nothing is left to explain or the floor height is reached.

use super::log_classifier::{self, ClassifierConfig, DecodedEvent, LogClass, TransferLog};
use super::progress_tracker::{SyncProgressTracker, SyncStats};
use crate::config::{EvmSyncConfig, TokenConfig};
use crate::provider::abi::{self, DecodeError};
use crate::provider::{EvmProvider, LogFilter, ProviderError, TransactionReceipt};
use crate::wallet::{ChainEvent, Transaction, TransactionState, TransactionStore, WalletSyncError};

use ethers::types::{Address, H256, U256};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Spend still covered by an allowance.
///
/// Only a max approval (upper half saturated) can be walked back; anything else counts as zero.
pub fn outstanding_allowance(allowance: U256) -> U256 {
	if abi::is_max_approval(allowance) {
		U256::MAX - allowance
	} else {
		U256::zero()
	}
}

/// Persisted scan position of one token/owner pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorCheckpoint {
	pub token: String,
	pub owner: String,
	pub last_confirmed_height: u64,
}

/// Block range `[from, to]` plus the height scanning resumes below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
	pub from: u64,
	pub to: u64,
	pub lower: u64,
}

/// Scan state of one token/owner pair for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
	pub token: Address,
	pub owner: Address,
	pub head_height: u64,
	pub last_confirmed_height: u64,
	pub earliest_scan_height: u64,
	pub remaining_height: u64,
	pub known_tx_hashes: HashSet<String>,
	pub outstanding_balance: U256,
	pub outstanding_nonce: u64,
	pub outstanding_transfer_allowance: U256,
	pub outstanding_htlc_allowance: U256,
	/// Lowest block holding a transfer whose receipt could not be fetched
	pub lowest_unresolved_height: Option<u64>,
}

impl SyncCursor {
	pub fn floor(&self) -> u64 {
		self.earliest_scan_height.max(self.last_confirmed_height)
	}

	/// Every counter has been walked back to zero.
	pub fn is_exhausted(&self) -> bool {
		self.outstanding_balance.is_zero()
			&& self.outstanding_nonce == 0
			&& self.outstanding_transfer_allowance.is_zero()
			&& self.outstanding_htlc_allowance.is_zero()
	}

	/// The next window to scan, if any.
	///
	/// The floor block itself is only scanned when it is the earliest configured height; a
	/// checkpointed height was covered by the previous session.
	pub fn next_window(&self, step: u64) -> Option<ScanWindow> {
		let floor = self.floor();
		if self.remaining_height <= floor || self.is_exhausted() {
			return None;
		}

		let lower = self.remaining_height.saturating_sub(step).max(floor);
		let include_floor = lower == floor && self.last_confirmed_height < self.earliest_scan_height;
		let from = if include_floor { lower } else { lower + 1 };

		Some(ScanWindow {
			from,
			to: self.remaining_height,
			lower,
		})
	}

	/// Position for the next session: the confirmed depth, kept below any unresolved transfer.
	pub fn checkpoint(&self, confirmations: u64) -> CursorCheckpoint {
		let mut height = self.head_height.saturating_sub(confirmations);
		if let Some(unresolved) = self.lowest_unresolved_height {
			height = height.min(unresolved.saturating_sub(1));
		}
		CursorCheckpoint {
			token: abi::format_address(&self.token),
			owner: abi::format_address(&self.owner),
			last_confirmed_height: height.max(self.last_confirmed_height),
		}
	}
}

/// Receives each reconciled window as one batch.
#[async_trait::async_trait]
pub trait BatchSink: Send {
	async fn commit(&mut self, batch: Vec<Transaction>) -> Result<(), WalletSyncError>;
}

#[async_trait::async_trait]
impl BatchSink for TransactionStore {
	async fn commit(&mut self, batch: Vec<Transaction>) -> Result<(), WalletSyncError> {
		self.merge_all(batch);
		Ok(())
	}
}

/// Reconciles the history of one token.
pub struct EvmScanner {
	provider: Arc<dyn EvmProvider>,
	token: Address,
	/// Token address as stored on wallet entries
	token_key: String,
	earliest_scan_height: u64,
	block_step: u64,
	confirmations: u64,
	transfer_contract: Option<Address>,
	htlc_contract: Option<Address>,
	classifier: ClassifierConfig,
	progress: SyncProgressTracker,
}

fn configured(address: &str) -> Result<Option<Address>, DecodeError> {
	if address.is_empty() {
		return Ok(None);
	}
	abi::parse_address(address).map(Some)
}

impl EvmScanner {
	pub fn new(
		provider: Arc<dyn EvmProvider>,
		config: &EvmSyncConfig,
		token: &TokenConfig,
	) -> Result<Self, DecodeError> {
		let htlc_contract = configured(&config.htlc_contract)?;
		let classifier = ClassifierConfig {
			fee_sinks: token.fee_sink_addresses()?.into_iter().collect(),
			htlc_contract,
			swap_contracts: config
				.swap_contracts
				.iter()
				.map(|address| abi::parse_address(address))
				.collect::<Result<_, _>>()?,
			native_token: configured(&config.native_token)?,
		};
		let address = abi::parse_address(&token.address)?;

		Ok(Self {
			provider,
			token: address,
			token_key: abi::format_address(&address),
			earliest_scan_height: token.earliest_scan_height,
			block_step: config.block_step.max(1),
			confirmations: config.confirmations,
			transfer_contract: configured(&config.transfer_contract)?,
			htlc_contract,
			classifier,
			progress: SyncProgressTracker::new(),
		})
	}

	pub fn token(&self) -> &str {
		&self.token_key
	}

	/// Read the owner's on-chain counters and position a cursor at the head.
	pub async fn init_cursor(
		&self,
		owner: &str,
		last_confirmed_height: u64,
		known_tx_hashes: HashSet<String>,
	) -> Result<SyncCursor, WalletSyncError> {
		let owner = abi::parse_address(owner).map_err(ProviderError::from)?;
		let provider = self.provider.as_ref();

		let (head, balance, nonce, transfer_allowance, htlc_allowance) = tokio::try_join!(
			provider.block_number(),
			provider.erc20_balance(self.token, owner),
			async {
				match self.transfer_contract {
					Some(contract) => provider.transfer_nonce(contract, owner).await,
					None => Ok(0),
				}
			},
			async {
				match self.transfer_contract {
					Some(contract) => provider.erc20_allowance(self.token, owner, contract).await,
					None => Ok(U256::zero()),
				}
			},
			async {
				match self.htlc_contract {
					Some(contract) => provider.erc20_allowance(self.token, owner, contract).await,
					None => Ok(U256::zero()),
				}
			},
		)?;

		let cursor = SyncCursor {
			token: self.token,
			owner,
			head_height: head,
			last_confirmed_height,
			earliest_scan_height: self.earliest_scan_height,
			remaining_height: head,
			known_tx_hashes,
			outstanding_balance: balance,
			outstanding_nonce: nonce,
			outstanding_transfer_allowance: outstanding_allowance(transfer_allowance),
			outstanding_htlc_allowance: outstanding_allowance(htlc_allowance),
			lowest_unresolved_height: None,
		};
		debug!(
			"Cursor for {:#x} on {}: head {}, floor {}, balance {}, nonce {}",
			cursor.owner,
			self.token_key,
			head,
			cursor.floor(),
			balance,
			nonce
		);
		Ok(cursor)
	}

	/// Scan backward until the cursor is exhausted or the floor is reached.
	///
	/// Each window is committed to `sink` before the cursor moves past it. Returns the checkpoint
	/// to persist for the next session.
	pub async fn scan(
		&mut self,
		cursor: &mut SyncCursor,
		sink: &mut dyn BatchSink,
	) -> Result<CursorCheckpoint, WalletSyncError> {
		self.progress = SyncProgressTracker::new();

		while let Some(window) = cursor.next_window(self.block_step) {
			let (batch, logs) = self.process_window(cursor, window.from, window.to).await?;
			let count = batch.len();
			sink.commit(batch).await?;
			self.progress.record_window(window.from, window.to, logs, count);
			cursor.remaining_height = window.lower;
		}

		if cursor.is_exhausted() {
			info!("History of {:#x} on {} fully reconciled", cursor.owner, self.token_key);
		} else {
			info!(
				"Reached floor {} for {:#x} on {} with counters left",
				cursor.floor(),
				cursor.owner,
				self.token_key
			);
		}
		self.progress.log_progress();
		Ok(cursor.checkpoint(self.confirmations))
	}

	pub fn stats(&self) -> SyncStats {
		self.progress.get_stats()
	}

	async fn process_window(
		&self,
		cursor: &mut SyncCursor,
		from: u64,
		to: u64,
	) -> Result<(Vec<Transaction>, usize), WalletSyncError> {
		let transfer_topic = Some(abi::event_topic(abi::TRANSFER_EVENT));
		let owner_topic = Some(abi::address_topic(cursor.owner));
		let incoming = LogFilter::new(self.token)
			.topic(0, transfer_topic)
			.topic(2, owner_topic);
		let outgoing = LogFilter::new(self.token)
			.topic(0, transfer_topic)
			.topic(1, owner_topic);

		let (incoming_logs, outgoing_logs) = tokio::try_join!(
			self.provider.query_logs(&incoming, from, to),
			self.provider.query_logs(&outgoing, from, to),
		)?;
		let log_count = incoming_logs.len() + outgoing_logs.len();

		let mut seen = HashSet::new();
		let mut transfers = Vec::new();
		for raw in incoming_logs.iter().chain(outgoing_logs.iter()) {
			if !seen.insert((raw.transaction_hash, raw.log_index)) {
				continue;
			}
			match log_classifier::decode_log(raw) {
				Ok(DecodedEvent::Transfer(transfer)) if transfer.value > 0 => transfers.push(transfer),
				Ok(_) => {}
				Err(e) => warn!(
					"Skipping undecodable log {:#x}:{}: {}",
					raw.transaction_hash, raw.log_index, e
				),
			}
		}

		walk_back_counters(cursor, self.htlc_contract, &transfers);
		let batch = self.reconcile(cursor, transfers).await?;
		Ok((batch, log_count))
	}

	/// Turn a window's transfers into canonical entries, fetching receipts and block timestamps.
	///
	/// Transfers already known are skipped. A hash whose receipt cannot be fetched is left out of
	/// the batch entirely and recorded on the cursor, so the next session scans it again.
	async fn reconcile(
		&self,
		cursor: &mut SyncCursor,
		transfers: Vec<TransferLog>,
	) -> Result<Vec<Transaction>, WalletSyncError> {
		let mut entries = Vec::new();
		let mut fee_logs = Vec::new();
		let mut needs_receipt = Vec::new();

		for transfer in transfers {
			if cursor.known_tx_hashes.contains(&transfer.hash_key()) {
				continue;
			}
			let class = self.classifier.classify(&transfer);
			match class {
				LogClass::FeeSink => fee_logs.push(transfer),
				LogClass::Htlc | LogClass::Swap => {
					entries.push(transfer.to_transaction(self.state_at(cursor, transfer.block_number)));
					needs_receipt.push((entries.len() - 1, class, transfer));
				}
				LogClass::Plain => {
					entries.push(transfer.to_transaction(self.state_at(cursor, transfer.block_number)))
				}
			}
		}
		log_classifier::merge_fees(&mut entries, fee_logs)?;

		let receipt_hashes: Vec<H256> = needs_receipt
			.iter()
			.map(|(_, _, transfer)| transfer.hash)
			.collect::<HashSet<_>>()
			.into_iter()
			.collect();
		let blocks: Vec<u64> = entries
			.iter()
			.filter_map(|entry| entry.block_height)
			.collect::<HashSet<_>>()
			.into_iter()
			.collect();

		let (receipts, timestamps) = tokio::join!(
			join_all(receipt_hashes.iter().map(|hash| self.fetch_receipt(*hash))),
			join_all(blocks.iter().map(|block| self.fetch_timestamp(*block))),
		);
		let receipts: HashMap<H256, TransactionReceipt> = receipt_hashes
			.iter()
			.copied()
			.zip(receipts)
			.filter_map(|(hash, receipt)| receipt.map(|receipt| (hash, receipt)))
			.collect();
		let timestamps: HashMap<u64, u64> = blocks
			.iter()
			.copied()
			.zip(timestamps)
			.filter_map(|(block, timestamp)| timestamp.map(|timestamp| (block, timestamp)))
			.collect();

		let mut unresolved: HashMap<String, u64> = HashMap::new();
		for (index, class, transfer) in &needs_receipt {
			let Some(receipt) = receipts.get(&transfer.hash) else {
				unresolved.insert(transfer.hash_key(), transfer.block_number);
				continue;
			};
			let entry = &mut entries[*index];
			if !receipt.status {
				entry.state = TransactionState::Failed;
			}
			entry.event = match class {
				LogClass::Htlc => self.classifier.htlc_event(receipt).map(ChainEvent::Htlc),
				LogClass::Swap => self
					.classifier
					.swap_event(receipt, transfer)
					.map(ChainEvent::Swap),
				_ => None,
			};
		}

		for entry in &mut entries {
			if let Some(block) = entry.block_height {
				entry.timestamp = timestamps.get(&block).copied();
			}
		}

		if let Some(lowest) = unresolved.values().copied().min() {
			warn!(
				"{} transactions of {:#x} left for the next scan, lowest at block {}",
				unresolved.len(),
				cursor.owner,
				lowest
			);
			cursor.lowest_unresolved_height = Some(
				cursor
					.lowest_unresolved_height
					.map_or(lowest, |height| height.min(lowest)),
			);
			entries.retain(|entry| !unresolved.contains_key(&entry.hash));
		}
		cursor
			.known_tx_hashes
			.extend(entries.iter().map(|entry| entry.hash.clone()));
		Ok(entries)
	}

	fn state_at(&self, cursor: &SyncCursor, block: u64) -> TransactionState {
		if cursor.head_height >= block.saturating_add(self.confirmations) {
			TransactionState::Confirmed
		} else {
			TransactionState::Mined
		}
	}

	async fn fetch_receipt(&self, hash: H256) -> Option<TransactionReceipt> {
		match self.provider.transaction_receipt(hash).await {
			Ok(Some(receipt)) => Some(receipt),
			Ok(None) => {
				warn!("No receipt for {:#x}", hash);
				None
			}
			Err(e) => {
				warn!("Failed to fetch receipt for {:#x}: {}", hash, e);
				None
			}
		}
	}

	async fn fetch_timestamp(&self, block: u64) -> Option<u64> {
		match self.provider.block_timestamp(block).await {
			Ok(timestamp) => Some(timestamp),
			Err(e) => {
				warn!("Failed to fetch timestamp of block {}: {}", block, e);
				None
			}
		}
	}
}

/// Walk one window's transfers back out of the cursor's counters.
///
/// Spends are undone before receipts are subtracted, so the window's net change applies whatever
/// order the logs arrived in.
fn walk_back_counters(cursor: &mut SyncCursor, htlc_contract: Option<Address>, transfers: &[TransferLog]) {
	let owner = cursor.owner;
	let sent_hashes: HashSet<H256> = transfers
		.iter()
		.filter(|t| t.from == owner)
		.map(|t| t.hash)
		.collect();
	cursor.outstanding_nonce = cursor
		.outstanding_nonce
		.saturating_sub(sent_hashes.len() as u64);

	for transfer in transfers.iter().filter(|t| t.from == owner) {
		let value = U256::from(transfer.value);
		cursor.outstanding_balance = cursor.outstanding_balance.saturating_add(value);
		if htlc_contract == Some(transfer.to) {
			cursor.outstanding_htlc_allowance = cursor.outstanding_htlc_allowance.saturating_sub(value);
		} else {
			cursor.outstanding_transfer_allowance =
				cursor.outstanding_transfer_allowance.saturating_sub(value);
		}
	}
	for transfer in transfers.iter().filter(|t| t.to == owner) {
		cursor.outstanding_balance = cursor
			.outstanding_balance
			.saturating_sub(U256::from(transfer.value));
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::provider::{ProviderError, RawLog};
	use crate::wallet::{HtlcEvent, SwapEvent, TxKey};
	use ethers::abi::Token;
	use std::sync::Mutex;

	fn token() -> Address {
		Address::repeat_byte(0x66)
	}

	fn owner() -> Address {
		Address::repeat_byte(0x11)
	}

	fn other() -> Address {
		Address::repeat_byte(0x77)
	}

	fn pool() -> Address {
		Address::repeat_byte(0x22)
	}

	fn htlc() -> Address {
		Address::repeat_byte(0x33)
	}

	fn swap() -> Address {
		Address::repeat_byte(0x44)
	}

	fn native() -> Address {
		Address::repeat_byte(0x55)
	}

	fn transfer_contract() -> Address {
		Address::repeat_byte(0x88)
	}

	fn key(hash: u8) -> String {
		abi::format_hash(&H256::repeat_byte(hash))
	}

	#[derive(Default)]
	struct MockEvmProvider {
		head: u64,
		balance: u64,
		nonce: u64,
		transfer_allowance: U256,
		htlc_allowance: U256,
		logs: Vec<RawLog>,
		receipts: HashMap<H256, TransactionReceipt>,
		/// Number of receipt requests answered with an error before the node recovers
		failing_receipts: Mutex<usize>,
		queries: Mutex<Vec<(u64, u64)>>,
		receipt_calls: Mutex<Vec<H256>>,
	}

	#[async_trait::async_trait]
	impl EvmProvider for MockEvmProvider {
		async fn block_number(&self) -> Result<u64, ProviderError> {
			Ok(self.head)
		}

		async fn query_logs(
			&self,
			filter: &LogFilter,
			from_block: u64,
			to_block: u64,
		) -> Result<Vec<RawLog>, ProviderError> {
			self.queries.lock().unwrap().push((from_block, to_block));
			Ok(self
				.logs
				.iter()
				.filter(|log| (from_block..=to_block).contains(&log.block_number))
				.filter(|log| filter.matches(log))
				.cloned()
				.collect())
		}

		async fn transaction_receipt(
			&self,
			hash: H256,
		) -> Result<Option<TransactionReceipt>, ProviderError> {
			self.receipt_calls.lock().unwrap().push(hash);
			let mut failing = self.failing_receipts.lock().unwrap();
			if *failing > 0 {
				*failing -= 1;
				return Err(ProviderError::Unavailable("connection reset".to_string()));
			}
			Ok(self.receipts.get(&hash).cloned())
		}

		async fn block_timestamp(&self, number: u64) -> Result<u64, ProviderError> {
			Ok(number * 10)
		}

		async fn erc20_balance(&self, _token: Address, _owner: Address) -> Result<U256, ProviderError> {
			Ok(U256::from(self.balance))
		}

		async fn erc20_allowance(
			&self,
			_token: Address,
			_owner: Address,
			spender: Address,
		) -> Result<U256, ProviderError> {
			Ok(if spender == htlc() {
				self.htlc_allowance
			} else {
				self.transfer_allowance
			})
		}

		async fn transfer_nonce(&self, _contract: Address, _owner: Address) -> Result<u64, ProviderError> {
			Ok(self.nonce)
		}
	}

	/// Records the size of every committed batch.
	#[derive(Default)]
	struct RecordingSink {
		batches: Vec<usize>,
		store: TransactionStore,
	}

	#[async_trait::async_trait]
	impl BatchSink for RecordingSink {
		async fn commit(&mut self, batch: Vec<Transaction>) -> Result<(), WalletSyncError> {
			self.batches.push(batch.len());
			self.store.merge_all(batch);
			Ok(())
		}
	}

	fn transfer(
		token: Address,
		hash: u8,
		log_index: u64,
		block: u64,
		from: Address,
		to: Address,
		value: u64,
	) -> RawLog {
		RawLog {
			address: token,
			topics: vec![
				abi::event_topic(abi::TRANSFER_EVENT),
				abi::address_topic(from),
				abi::address_topic(to),
			],
			data: ethers::abi::encode(&[Token::Uint(U256::from(value))]).into(),
			block_number: block,
			transaction_hash: H256::repeat_byte(hash),
			log_index,
		}
	}

	fn transfer_log(hash: u8, from: Address, to: Address, value: u128) -> TransferLog {
		TransferLog {
			token: token(),
			hash: H256::repeat_byte(hash),
			log_index: 0,
			block_number: 10,
			from,
			to,
			value,
		}
	}

	fn max_approval_minus(spent: u64) -> U256 {
		U256::MAX - U256::from(spent)
	}

	fn scanner(provider: Arc<MockEvmProvider>, step: u64) -> EvmScanner {
		let config = EvmSyncConfig {
			block_step: step,
			confirmations: 12,
			transfer_contract: abi::format_address(&transfer_contract()),
			htlc_contract: abi::format_address(&htlc()),
			swap_contracts: vec![abi::format_address(&swap())],
			native_token: abi::format_address(&native()),
			..EvmSyncConfig::default()
		};
		let token = TokenConfig {
			address: abi::format_address(&token()),
			symbol: "TKN".to_string(),
			fee_sinks: vec![abi::format_address(&pool())],
			..TokenConfig::default()
		};
		EvmScanner::new(provider, &config, &token).unwrap()
	}

	fn owner_key() -> String {
		abi::format_address(&owner())
	}

	fn cursor(earliest: u64, last_confirmed: u64, remaining: u64) -> SyncCursor {
		SyncCursor {
			token: token(),
			owner: owner(),
			head_height: remaining,
			last_confirmed_height: last_confirmed,
			earliest_scan_height: earliest,
			remaining_height: remaining,
			known_tx_hashes: HashSet::new(),
			outstanding_balance: U256::one(),
			outstanding_nonce: 0,
			outstanding_transfer_allowance: U256::zero(),
			outstanding_htlc_allowance: U256::zero(),
			lowest_unresolved_height: None,
		}
	}

	fn windows(mut cursor: SyncCursor, step: u64) -> Vec<(u64, u64)> {
		let mut out = Vec::new();
		while let Some(window) = cursor.next_window(step) {
			out.push((window.from, window.to));
			cursor.remaining_height = window.lower;
		}
		out
	}

	#[test]
	fn only_max_approvals_count_as_outstanding() {
		assert_eq!(outstanding_allowance(max_approval_minus(330)), U256::from(330u64));
		assert_eq!(outstanding_allowance(U256::from(5_000u64)), U256::zero());
		assert_eq!(
			outstanding_allowance(U256::from(u128::MAX - 1) << 128usize),
			U256::zero()
		);
	}

	#[test]
	fn malformed_token_address_is_rejected() {
		let token = TokenConfig {
			address: "0xnot-a-token".to_string(),
			..TokenConfig::default()
		};
		let provider = Arc::new(MockEvmProvider::default());
		assert!(matches!(
			EvmScanner::new(provider, &EvmSyncConfig::default(), &token),
			Err(DecodeError::InvalidAddress(_))
		));
	}

	#[test]
	fn windows_reach_the_earliest_height_inclusive() {
		assert_eq!(
			windows(cursor(5_500, 0, 10_000), 2_000),
			vec![(8_001, 10_000), (6_001, 8_000), (5_500, 6_000)]
		);
	}

	#[test]
	fn windows_stop_above_a_checkpoint() {
		assert_eq!(
			windows(cursor(0, 7_000, 10_000), 2_000),
			vec![(8_001, 10_000), (7_001, 8_000)]
		);
	}

	#[test]
	fn exhausted_cursor_has_no_window() {
		let mut exhausted = cursor(0, 0, 10_000);
		exhausted.outstanding_balance = U256::zero();
		assert_eq!(exhausted.next_window(100), None);
	}

	#[test]
	fn checkpoint_stays_below_unresolved_transfers() {
		let mut resolved = cursor(0, 100, 1_000);
		assert_eq!(resolved.checkpoint(12).last_confirmed_height, 988);

		resolved.lowest_unresolved_height = Some(900);
		assert_eq!(resolved.checkpoint(12).last_confirmed_height, 899);

		// never moves below the previous session's checkpoint
		resolved.lowest_unresolved_height = Some(50);
		assert_eq!(resolved.checkpoint(12).last_confirmed_height, 100);
	}

	#[test]
	fn walk_back_is_independent_of_log_order() {
		// window received 500 and sent 400; only 100 is left at the head
		let received = transfer_log(0xa1, other(), owner(), 500);
		let sent = transfer_log(0xa2, owner(), other(), 400);

		for transfers in [
			vec![received.clone(), sent.clone()],
			vec![sent.clone(), received.clone()],
		] {
			let mut cursor = cursor(0, 0, 1_000);
			cursor.outstanding_balance = U256::from(100u64);
			cursor.outstanding_nonce = 1;
			cursor.outstanding_transfer_allowance = U256::from(400u64);

			walk_back_counters(&mut cursor, Some(htlc()), &transfers);

			assert!(cursor.is_exhausted(), "{cursor:?}");
		}
	}

	#[test]
	fn htlc_lock_draws_on_its_own_allowance() {
		let mut cursor = cursor(0, 0, 1_000);
		cursor.outstanding_balance = U256::zero();
		cursor.outstanding_nonce = 2;
		cursor.outstanding_htlc_allowance = U256::from(500u64);
		cursor.outstanding_transfer_allowance = U256::from(70u64);

		walk_back_counters(
			&mut cursor,
			Some(htlc()),
			&[
				transfer_log(0xb1, owner(), htlc(), 500),
				transfer_log(0xb2, owner(), other(), 70),
			],
		);

		assert_eq!(cursor.outstanding_htlc_allowance, U256::zero());
		assert_eq!(cursor.outstanding_transfer_allowance, U256::zero());
		assert_eq!(cursor.outstanding_nonce, 0);
		assert_eq!(cursor.outstanding_balance, U256::from(570u64));
	}

	#[tokio::test]
	async fn zero_counters_perform_no_queries() {
		let provider = Arc::new(MockEvmProvider {
			head: 5_000,
			..MockEvmProvider::default()
		});
		let mut scanner = scanner(provider.clone(), 1_000);
		let mut cursor = scanner.init_cursor(&owner_key(), 0, HashSet::new()).await.unwrap();
		let mut store = TransactionStore::new();

		let checkpoint = scanner.scan(&mut cursor, &mut store).await.unwrap();

		assert!(provider.queries.lock().unwrap().is_empty());
		assert!(store.is_empty());
		assert_eq!(checkpoint.last_confirmed_height, 4_988);
		assert_eq!(checkpoint.owner, owner_key());
	}

	#[tokio::test]
	async fn counters_explain_history_and_pool_fee_is_merged() {
		let provider = Arc::new(MockEvmProvider {
			head: 1_000,
			// received 1000, then sent 300 plus a 30 pool fee in one meta-transaction
			balance: 670,
			nonce: 1,
			transfer_allowance: max_approval_minus(330),
			logs: vec![
				transfer(token(), 0xa, 0, 100, other(), owner(), 1_000),
				transfer(token(), 0xb, 4, 200, owner(), other(), 300),
				transfer(token(), 0xb, 5, 200, owner(), pool(), 30),
				transfer(token(), 0xc, 0, 50, other(), owner(), 0),
			],
			..MockEvmProvider::default()
		});
		let mut scanner = scanner(provider.clone(), 500);
		let mut cursor = scanner.init_cursor(&owner_key(), 0, HashSet::new()).await.unwrap();
		let mut store = TransactionStore::new();

		scanner.scan(&mut cursor, &mut store).await.unwrap();

		assert!(cursor.is_exhausted());
		assert_eq!(provider.queries.lock().unwrap().len(), 4);
		assert_eq!(store.len(), 2);

		let sent = store
			.get(&TxKey {
				hash: key(0xb),
				log_index: Some(4),
			})
			.unwrap();
		assert_eq!(sent.value, 300);
		assert_eq!(sent.fee, 30);
		assert_eq!(sent.state, TransactionState::Confirmed);
		assert_eq!(sent.timestamp, Some(2_000));
		assert!(store.contains_hash(&key(0xa)));
		assert!(!store.contains_hash(&key(0xc)));
		assert_eq!(scanner.stats().windows_scanned, 2);
	}

	#[tokio::test]
	async fn window_receiving_more_than_the_balance_still_exhausts() {
		let provider = Arc::new(MockEvmProvider {
			head: 10_000,
			balance: 100,
			nonce: 1,
			transfer_allowance: max_approval_minus(400),
			logs: vec![
				transfer(token(), 0xa, 0, 9_900, other(), owner(), 500),
				transfer(token(), 0xb, 0, 9_950, owner(), other(), 400),
			],
			..MockEvmProvider::default()
		});
		let mut scanner = scanner(provider.clone(), 1_000);
		let mut cursor = scanner.init_cursor(&owner_key(), 0, HashSet::new()).await.unwrap();
		let mut store = TransactionStore::new();

		scanner.scan(&mut cursor, &mut store).await.unwrap();

		assert!(cursor.is_exhausted());
		assert_eq!(cursor.remaining_height, 9_000);
		assert_eq!(provider.queries.lock().unwrap().len(), 2);
		assert_eq!(store.len(), 2);
	}

	#[tokio::test]
	async fn scan_stops_once_counters_are_exhausted() {
		let provider = Arc::new(MockEvmProvider {
			head: 10_000,
			balance: 500,
			logs: vec![transfer(token(), 0xa, 0, 9_500, other(), owner(), 500)],
			..MockEvmProvider::default()
		});
		let mut scanner = scanner(provider.clone(), 1_000);
		let mut cursor = scanner.init_cursor(&owner_key(), 0, HashSet::new()).await.unwrap();
		let mut store = TransactionStore::new();

		scanner.scan(&mut cursor, &mut store).await.unwrap();

		assert_eq!(*provider.queries.lock().unwrap(), vec![(9_001, 10_000), (9_001, 10_000)]);
		assert_eq!(cursor.remaining_height, 9_000);
	}

	fn htlc_lock_receipt(lock: &RawLog, id: H256) -> TransactionReceipt {
		let data = ethers::abi::encode(&[
			Token::Address(token()),
			Token::Uint(U256::from(500u64)),
			Token::Address(other()),
			Token::FixedBytes(vec![0xcd; 32]),
			Token::Uint(U256::from(99u64)),
		]);
		TransactionReceipt {
			transaction_hash: lock.transaction_hash,
			block_number: lock.block_number,
			status: true,
			logs: vec![
				lock.clone(),
				RawLog {
					address: htlc(),
					topics: vec![abi::event_topic(abi::HTLC_OPEN_EVENT), id],
					data: data.into(),
					block_number: lock.block_number,
					transaction_hash: lock.transaction_hash,
					log_index: 1,
				},
			],
		}
	}

	#[tokio::test]
	async fn htlc_open_is_attached_from_receipt() {
		let id = H256::repeat_byte(0xab);
		let lock = transfer(token(), 0xe, 0, 995, owner(), htlc(), 500);
		let provider = Arc::new(MockEvmProvider {
			head: 1_000,
			nonce: 1,
			htlc_allowance: max_approval_minus(500),
			receipts: HashMap::from([(lock.transaction_hash, htlc_lock_receipt(&lock, id))]),
			logs: vec![lock],
			..MockEvmProvider::default()
		});
		let mut scanner = scanner(provider.clone(), 100);
		let mut cursor = scanner.init_cursor(&owner_key(), 0, HashSet::new()).await.unwrap();
		let mut store = TransactionStore::new();

		scanner.scan(&mut cursor, &mut store).await.unwrap();

		// balance walks back up to 500; nothing received it, so the floor ends the scan
		assert_eq!(cursor.outstanding_htlc_allowance, U256::zero());
		assert_eq!(cursor.outstanding_nonce, 0);
		assert_eq!(cursor.outstanding_balance, U256::from(500u64));
		assert_eq!(cursor.remaining_height, 0);

		let hash = key(0xe);
		let entry = store.by_hash(&hash).next().unwrap();
		assert_eq!(entry.state, TransactionState::Mined);
		match &entry.event {
			Some(ChainEvent::Htlc(HtlcEvent::Open { id: decoded, amount, .. })) => {
				assert_eq!(*decoded, abi::format_hash(&id));
				assert_eq!(*amount, 500);
			}
			other => panic!("unexpected event {other:?}"),
		}
		assert!(cursor.known_tx_hashes.contains(&key(0xe)));
	}

	#[tokio::test]
	async fn failed_receipt_is_retried_by_the_next_scan() {
		let id = H256::repeat_byte(0xab);
		let lock = transfer(token(), 0xe, 0, 900, owner(), htlc(), 500);
		let provider = Arc::new(MockEvmProvider {
			head: 1_000,
			nonce: 1,
			htlc_allowance: max_approval_minus(500),
			receipts: HashMap::from([(lock.transaction_hash, htlc_lock_receipt(&lock, id))]),
			logs: vec![lock],
			failing_receipts: Mutex::new(1),
			..MockEvmProvider::default()
		});
		let mut scanner = scanner(provider.clone(), 1_000);
		let mut store = TransactionStore::new();

		let mut cursor = scanner.init_cursor(&owner_key(), 0, HashSet::new()).await.unwrap();
		let checkpoint = scanner.scan(&mut cursor, &mut store).await.unwrap();

		assert!(!store.contains_hash(&key(0xe)));
		assert!(!cursor.known_tx_hashes.contains(&key(0xe)));
		assert_eq!(cursor.lowest_unresolved_height, Some(900));
		assert_eq!(checkpoint.last_confirmed_height, 899);

		let known = store.final_hashes_for_token(scanner.token());
		let mut cursor = scanner
			.init_cursor(&owner_key(), checkpoint.last_confirmed_height, known)
			.await
			.unwrap();
		let checkpoint = scanner.scan(&mut cursor, &mut store).await.unwrap();

		assert_eq!(provider.receipt_calls.lock().unwrap().len(), 2);
		assert_eq!(checkpoint.last_confirmed_height, 988);
		let hash = key(0xe);
		let entry = store.by_hash(&hash).next().unwrap();
		assert_eq!(entry.state, TransactionState::Confirmed);
		assert!(matches!(entry.event, Some(ChainEvent::Htlc(HtlcEvent::Open { .. }))));
	}

	#[tokio::test]
	async fn known_plain_transfers_are_not_emitted_again() {
		let provider = Arc::new(MockEvmProvider {
			head: 1_000,
			balance: 500,
			logs: vec![transfer(token(), 0xa, 0, 900, other(), owner(), 500)],
			..MockEvmProvider::default()
		});
		let mut scanner = scanner(provider.clone(), 1_000);
		let mut sink = RecordingSink::default();

		let mut cursor = scanner.init_cursor(&owner_key(), 0, HashSet::new()).await.unwrap();
		scanner.scan(&mut cursor, &mut sink).await.unwrap();
		assert_eq!(sink.batches, vec![1]);

		// a fresh session seeded from the store re-reads the window without emitting it
		let known = sink.store.final_hashes_for_token(scanner.token());
		let mut cursor = scanner.init_cursor(&owner_key(), 0, known).await.unwrap();
		scanner.scan(&mut cursor, &mut sink).await.unwrap();

		assert_eq!(sink.batches, vec![1, 0]);
		assert!(cursor.is_exhausted());
	}

	#[tokio::test]
	async fn reverted_swap_is_failed_and_known_hashes_skip_receipts() {
		let swap_log = transfer(token(), 0x5, 0, 900, owner(), swap(), 700);
		let receipt = TransactionReceipt {
			transaction_hash: swap_log.transaction_hash,
			block_number: 900,
			status: false,
			logs: vec![swap_log.clone(), transfer(native(), 0x5, 1, 900, swap(), owner(), 7)],
		};
		let provider = Arc::new(MockEvmProvider {
			head: 1_000,
			balance: 1,
			receipts: HashMap::from([(swap_log.transaction_hash, receipt)]),
			logs: vec![swap_log],
			..MockEvmProvider::default()
		});

		let mut scanner = scanner(provider.clone(), 1_000);
		let mut cursor = scanner.init_cursor(&owner_key(), 0, HashSet::new()).await.unwrap();
		let mut sink = RecordingSink::default();
		scanner.scan(&mut cursor, &mut sink).await.unwrap();

		let hash = key(0x5);
		let entry = sink.store.by_hash(&hash).next().unwrap();
		assert_eq!(entry.state, TransactionState::Failed);
		assert_eq!(
			entry.event,
			Some(ChainEvent::Swap(SwapEvent {
				amount_in: 700,
				amount_out: 7
			}))
		);
		assert_eq!(provider.receipt_calls.lock().unwrap().len(), 1);

		let known = sink.store.final_hashes_for_token(scanner.token());
		let mut cursor = scanner.init_cursor(&owner_key(), 0, known).await.unwrap();
		scanner.scan(&mut cursor, &mut sink).await.unwrap();
		assert_eq!(provider.receipt_calls.lock().unwrap().len(), 1);
		assert_eq!(sink.batches.last(), Some(&0));
	}
}
