//! UTXO-chain history synchronization.
//!
//! Walks both derivation chains with a gap scan, fetching each address from the indexer at most
//! once per session. Fetch results are merged into the canonical [`TransactionStore`], from which
//! address usage and unspent outputs are recomputed. Funded addresses are subscribed for live
//! updates once their chain has been scanned.

use super::discovery::{self, GapScan, ScanStep};
use super::progress_tracker::{FetchTracker, SyncProgressTracker, SyncStats};
use crate::config::UtxoSyncConfig;
use crate::provider::{AddressProvider, ConsensusState, UtxoProvider};
use crate::transaction::{FeeWeights, SpendPlan, SpendPlanBuilder, TransactionError};
use crate::wallet::{
	AddressDirectory, AddressRecord, ChainRole, Transaction, TransactionStore, TxKey,
	WalletSyncError,
};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct UtxoSynchronizer {
	account_id: String,
	provider: Arc<dyn UtxoProvider>,
	hub: Arc<dyn AddressProvider>,
	directory: AddressDirectory,
	store: TransactionStore,
	/// Addresses fetched since the last invalidation
	fetched: HashSet<String>,
	/// Addresses with a live listener; only grows until the address set changes
	subscribed: HashSet<String>,
	live_sink: mpsc::UnboundedSender<Transaction>,
	fetch_tracker: FetchTracker,
	external_gap: usize,
	internal_gap: usize,
	min_confirmations: u64,
	fee_weights: FeeWeights,
	dust_limit: u64,
	progress: SyncProgressTracker,
}

impl UtxoSynchronizer {
	pub fn new(
		account_id: impl Into<String>,
		provider: Arc<dyn UtxoProvider>,
		hub: Arc<dyn AddressProvider>,
		directory: AddressDirectory,
		store: TransactionStore,
		config: &UtxoSyncConfig,
		live_sink: mpsc::UnboundedSender<Transaction>,
	) -> Self {
		let mut directory = directory;
		directory.refresh_all(&store);

		Self {
			account_id: account_id.into(),
			provider,
			hub,
			directory,
			store,
			fetched: HashSet::new(),
			subscribed: HashSet::new(),
			live_sink,
			fetch_tracker: FetchTracker::new(Duration::from_millis(config.fetch_debounce_ms)),
			external_gap: config.external_gap_limit,
			internal_gap: config.internal_gap_limit,
			min_confirmations: config.min_confirmations,
			fee_weights: config.fee_weights,
			dust_limit: config.dust_limit,
			progress: SyncProgressTracker::new(),
		}
	}

	pub fn account_id(&self) -> &str {
		&self.account_id
	}

	pub fn directory(&self) -> &AddressDirectory {
		&self.directory
	}

	pub fn store(&self) -> &TransactionStore {
		&self.store
	}

	pub fn fetch_tracker(&self) -> &FetchTracker {
		&self.fetch_tracker
	}

	pub fn is_fetched(&self, address: &str) -> bool {
		self.fetched.contains(address)
	}

	pub fn is_subscribed(&self, address: &str) -> bool {
		self.subscribed.contains(address)
	}

	fn gap_limit(&self, role: ChainRole) -> usize {
		match role {
			ChainRole::External => self.external_gap,
			ChainRole::Internal => self.internal_gap,
		}
	}

	/// Synchronize both chains.
	///
	/// Requires established consensus. If consensus is lost while running, the sync stops at the
	/// next await point, the session is invalidated and `Aborted` is returned.
	pub async fn sync_all(&mut self) -> Result<SyncStats, WalletSyncError> {
		let mut consensus = self.provider.consensus();
		if *consensus.borrow() != ConsensusState::Established {
			return Err(WalletSyncError::Aborted(
				"consensus not established".to_string(),
			));
		}

		self.progress = SyncProgressTracker::new();
		info!("Starting UTXO sync for account {}", self.account_id);

		let outcome = tokio::select! {
			biased;
			_ = async {
				consensus
					.wait_for(|state| *state != ConsensusState::Established)
					.await
					.map(|_| ())
			} => None,
			result = self.sync_roles() => Some(result),
		};

		match outcome {
			Some(result) => {
				result?;
				self.progress.log_progress();
				Ok(self.progress.get_stats())
			}
			None => {
				warn!("Consensus lost during UTXO sync of {}", self.account_id);
				self.connection_lost();
				Err(WalletSyncError::Aborted("consensus lost".to_string()))
			}
		}
	}

	async fn sync_roles(&mut self) -> Result<(), WalletSyncError> {
		for role in [ChainRole::External, ChainRole::Internal] {
			self.sync_role(role).await?;
		}
		Ok(())
	}

	/// Gap-scan one chain, fetching each inspected address.
	pub async fn sync_role(&mut self, role: ChainRole) -> Result<(), WalletSyncError> {
		let mut scan = GapScan::new(role, self.gap_limit(role));

		loop {
			match scan.next_step(self.directory.len(role)) {
				ScanStep::Inspect(index) => {
					let address = self.directory.records(role)[index].address.clone();
					let used = self.inspect(&address, false).await;
					scan.record(used);
				}
				ScanStep::Extend(count) => {
					discovery::extend_addresses(
						self.hub.as_ref(),
						&self.account_id,
						&mut self.directory,
						role,
						count,
					)
					.await?;
				}
				ScanStep::Complete => break,
			}
		}

		debug!(
			"{} chain complete with {} addresses, trailing gap {}",
			role,
			self.directory.len(role),
			scan.gap()
		);
		self.subscribe_funded(role).await;
		Ok(())
	}

	/// Fetch `address` unless it is already settled, and report whether it is used.
	async fn inspect(&mut self, address: &str, force: bool) -> bool {
		let pending = self.store.pending_references(address);
		let (used, funded) = self
			.directory
			.get(address)
			.map(|record| (record.is_used(), !record.utxos.is_empty()))
			.unwrap_or_default();

		let settled = used && funded && !pending;
		if !force && (self.fetched.contains(address) || settled) {
			return used || pending;
		}

		self.fetched.insert(address.to_string());
		let hints = self.store.hashes_for(address);
		let result = {
			let _guard = self.fetch_tracker.begin();
			self.provider
				.transactions_by_address(address, 0, &hints)
				.await
		};

		match result {
			Ok(transactions) => {
				let merged = self.store.merge_all(transactions);
				self.directory.refresh(address, &self.store);
				self.progress.record_address_fetch(merged);
				if merged > 0 {
					debug!("Merged {} transactions for {}", merged, address);
				}
				merged > 0
					|| pending
					|| self.directory.get(address).is_some_and(AddressRecord::is_used)
			}
			Err(e) => {
				warn!("Failed to fetch history of {}: {}", address, e);
				self.fetched.remove(address);
				self.progress.record_fetch_failure();
				used || pending
			}
		}
	}

	async fn subscribe_funded(&mut self, role: ChainRole) {
		let fresh: Vec<String> = self
			.directory
			.funded_addresses(role)
			.into_iter()
			.filter(|address| !self.subscribed.contains(address))
			.collect();
		if fresh.is_empty() {
			return;
		}

		match self
			.provider
			.add_transaction_listener(fresh.clone(), self.live_sink.clone())
			.await
		{
			Ok(()) => {
				debug!("Listening to {} newly funded {} addresses", fresh.len(), role);
				self.subscribed.extend(fresh);
			}
			Err(e) => warn!("Failed to subscribe {} addresses: {}", role, e),
		}
	}

	/// Forget which addresses were fetched this session.
	pub fn invalidate(&mut self) {
		info!(
			"Invalidating {} fetched addresses of {}",
			self.fetched.len(),
			self.account_id
		);
		self.fetched.clear();
	}

	/// Invalidate and drop the live listeners, which did not survive the disconnect.
	///
	/// Funded addresses are subscribed again by the next completed sync.
	pub fn connection_lost(&mut self) {
		debug!(
			"Dropping {} live subscriptions of {}",
			self.subscribed.len(),
			self.account_id
		);
		self.invalidate();
		self.subscribed.clear();
	}

	/// Replace the tracked address set.
	pub fn reset_addresses(&mut self, external: Vec<String>, internal: Vec<String>) {
		self.directory = AddressDirectory::from_addresses(external, internal);
		self.directory.refresh_all(&self.store);
		self.fetched.clear();
		self.subscribed.clear();
	}

	/// Merge a transaction pushed by a live listener.
	///
	/// Returns whether anything changed. The gap is then restored from local knowledge so a
	/// payment to the last unused address immediately yields a fresh one.
	pub async fn apply_live(&mut self, transaction: Transaction) -> Result<bool, WalletSyncError> {
		let involved: Vec<String> = transaction
			.involved_addresses
			.iter()
			.filter(|address| self.directory.contains(address))
			.cloned()
			.collect();
		if involved.is_empty() {
			debug!("Ignoring live transaction {} for unknown addresses", transaction.hash);
			return Ok(false);
		}

		if !self.store.merge(transaction).is_change() {
			return Ok(false);
		}
		for address in &involved {
			self.directory.refresh(address, &self.store);
		}

		for role in [ChainRole::External, ChainRole::Internal] {
			let gap_limit = self.gap_limit(role);
			discovery::discover_local(
				self.hub.as_ref(),
				&self.account_id,
				&mut self.directory,
				role,
				gap_limit,
				AddressRecord::is_used,
			)
			.await?;
		}
		Ok(true)
	}

	/// Promote mined transactions that reached the confirmation depth at `head`.
	pub fn promote(&mut self, head: u64) -> Vec<TxKey> {
		let depth = self.min_confirmations.saturating_sub(1);
		let promoted = self.store.promote_confirmations(head, depth);
		if !promoted.is_empty() {
			debug!("Promoted {} transactions at height {}", promoted.len(), head);
			self.directory.refresh_all(&self.store);
		}
		promoted
	}

	/// Plan a payment from the spendable outputs, sending change to the next unused change address.
	pub fn plan_spend(
		&self,
		recipient: &str,
		amount: u64,
		fee_rate: u64,
	) -> Result<SpendPlan, TransactionError> {
		let mut builder = SpendPlanBuilder::new()
			.with_utxos(self.directory.spendable_utxos(&self.store))
			.with_recipient(recipient, amount)
			.with_fee_rate(fee_rate)
			.with_weights(self.fee_weights, self.dust_limit);
		if let Some(change) = self.directory.next_unused(ChainRole::Internal) {
			builder = builder.with_change_address(change.address.clone());
		}
		builder.build()
	}

	/// Re-fetch recently used addresses of `role` to pick up address reuse by payers.
	pub async fn recheck_reused(&mut self, role: ChainRole) -> usize {
		let candidates =
			discovery::reuse_check_candidates(self.directory.records(role), self.gap_limit(role));
		let mut used = 0;
		for address in &candidates {
			if self.inspect(address, true).await {
				used += 1;
			}
		}
		debug!("Re-checked {} {} addresses for reuse", candidates.len(), role);
		used
	}
}
