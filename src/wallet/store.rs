//! Canonical transaction store.
//!
//! Every transaction is held exactly once per [`TxKey`]. Merging the same record again is a no-op;
//! merging a fresher version advances its state. Confirmed and failed records only accept late
//! fee and event reclassification.

use super::types::{Transaction, TransactionState, TxKey};

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};

/// Result of merging one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
	Inserted,
	Updated,
	Unchanged,
}

impl MergeOutcome {
	pub fn is_change(&self) -> bool {
		!matches!(self, MergeOutcome::Unchanged)
	}
}

fn state_rank(state: TransactionState) -> u8 {
	match state {
		TransactionState::Pending => 0,
		TransactionState::Mined => 1,
		TransactionState::Confirmed | TransactionState::Failed => 2,
	}
}

#[derive(Debug, Clone, Default)]
pub struct TransactionStore {
	transactions: BTreeMap<TxKey, Transaction>,
}

impl TransactionStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_transactions(transactions: impl IntoIterator<Item = Transaction>) -> Self {
		let mut store = Self::new();
		store.merge_all(transactions);
		store
	}

	pub fn merge(&mut self, incoming: Transaction) -> MergeOutcome {
		let existing = match self.transactions.entry(incoming.key()) {
			Entry::Vacant(slot) => {
				slot.insert(incoming);
				return MergeOutcome::Inserted;
			}
			Entry::Occupied(slot) => slot.into_mut(),
		};

		let mut changed = false;

		if !existing.state.is_final() && state_rank(incoming.state) >= state_rank(existing.state) {
			if existing.state != incoming.state
				|| existing.block_height != incoming.block_height
				|| existing.utxo != incoming.utxo
			{
				existing.state = incoming.state;
				existing.block_height = incoming.block_height;
				existing.utxo = incoming.utxo.or(existing.utxo.take());
				changed = true;
			}
		}

		if existing.timestamp.is_none() && incoming.timestamp.is_some() {
			existing.timestamp = incoming.timestamp;
			changed = true;
		}
		if incoming.fee > existing.fee {
			existing.fee = incoming.fee;
			changed = true;
		}
		if incoming.event.is_some() && existing.event != incoming.event {
			existing.event = incoming.event;
			changed = true;
		}

		if changed {
			MergeOutcome::Updated
		} else {
			MergeOutcome::Unchanged
		}
	}

	/// Merge a batch, returning how many records were inserted or updated.
	pub fn merge_all(&mut self, transactions: impl IntoIterator<Item = Transaction>) -> usize {
		transactions
			.into_iter()
			.map(|tx| self.merge(tx))
			.filter(MergeOutcome::is_change)
			.count()
	}

	pub fn get(&self, key: &TxKey) -> Option<&Transaction> {
		self.transactions.get(key)
	}

	pub fn by_hash<'a>(&'a self, hash: &'a str) -> impl Iterator<Item = &'a Transaction> + 'a {
		self.transactions
			.values()
			.filter(move |tx| tx.hash == hash)
	}

	pub fn contains_hash(&self, hash: &str) -> bool {
		self.by_hash(hash).next().is_some()
	}

	pub fn known_hashes(&self) -> HashSet<String> {
		self.transactions
			.values()
			.map(|tx| tx.hash.clone())
			.collect()
	}

	/// Hashes of transactions touching `address`.
	pub fn hashes_for(&self, address: &str) -> HashSet<String> {
		self.involving(address).map(|tx| tx.hash.clone()).collect()
	}

	/// Hashes of EVM entries for `token` that can no longer change state.
	///
	/// Mined entries are left out so a later scan re-emits and promotes them.
	pub fn final_hashes_for_token(&self, token: &str) -> HashSet<String> {
		self.transactions
			.values()
			.filter(|tx| tx.token.as_deref() == Some(token) && tx.state.is_final())
			.map(|tx| tx.hash.clone())
			.collect()
	}

	pub fn involving<'a>(&'a self, address: &'a str) -> impl Iterator<Item = &'a Transaction> + 'a {
		self.transactions
			.values()
			.filter(move |tx| tx.involves(address))
	}

	/// Whether an unconfirmed transaction references `address`.
	pub fn pending_references(&self, address: &str) -> bool {
		self.involving(address)
			.any(|tx| tx.state == TransactionState::Pending)
	}

	/// Outpoints consumed by transactions in the given states.
	pub fn spent_outpoints(&self, states: &[TransactionState]) -> HashSet<(String, u32)> {
		self.transactions
			.values()
			.filter(|tx| states.contains(&tx.state))
			.filter_map(|tx| tx.utxo.as_ref())
			.flat_map(|details| {
				details
					.inputs
					.iter()
					.map(|input| (input.prev_hash.clone(), input.prev_index))
			})
			.collect()
	}

	/// Promote mined transactions buried at least `depth` blocks below `head`.
	///
	/// Returns the keys of promoted transactions.
	pub fn promote_confirmations(&mut self, head: u64, depth: u64) -> Vec<TxKey> {
		let mut promoted = Vec::new();
		for (key, tx) in self.transactions.iter_mut() {
			if tx.state != TransactionState::Mined {
				continue;
			}
			if let Some(height) = tx.block_height {
				if head >= height.saturating_add(depth) {
					tx.state = TransactionState::Confirmed;
					promoted.push(key.clone());
				}
			}
		}
		promoted
	}

	pub fn len(&self) -> usize {
		self.transactions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.transactions.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
		self.transactions.values()
	}

	/// All transactions, newest block first, pending ones on top.
	pub fn history(&self) -> Vec<&Transaction> {
		let mut history: Vec<&Transaction> = self.transactions.values().collect();
		history.sort_by(|a, b| {
			b.block_height
				.unwrap_or(u64::MAX)
				.cmp(&a.block_height.unwrap_or(u64::MAX))
				.then_with(|| b.log_index.cmp(&a.log_index))
		});
		history
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn tx(hash: &str, log_index: Option<u64>, state: TransactionState) -> Transaction {
		Transaction {
			hash: hash.to_string(),
			log_index,
			token: None,
			involved_addresses: vec!["addr".to_string()],
			sender: None,
			recipient: None,
			value: 10,
			fee: 0,
			state,
			block_height: match state {
				TransactionState::Pending => None,
				_ => Some(100),
			},
			timestamp: None,
			event: None,
			utxo: None,
		}
	}

	#[test]
	fn merging_twice_is_idempotent() {
		let mut store = TransactionStore::new();
		assert_eq!(store.merge(tx("a", None, TransactionState::Mined)), MergeOutcome::Inserted);
		assert_eq!(store.merge(tx("a", None, TransactionState::Mined)), MergeOutcome::Unchanged);
		assert_eq!(store.len(), 1);
	}

	#[test]
	fn log_index_is_part_of_identity() {
		let mut store = TransactionStore::new();
		store.merge(tx("a", Some(0), TransactionState::Mined));
		store.merge(tx("a", Some(1), TransactionState::Mined));
		assert_eq!(store.len(), 2);
		assert_eq!(store.by_hash("a").count(), 2);
	}

	#[test]
	fn state_only_moves_forward() {
		let mut store = TransactionStore::new();
		store.merge(tx("a", None, TransactionState::Pending));
		assert!(store.pending_references("addr"));

		assert_eq!(store.merge(tx("a", None, TransactionState::Mined)), MergeOutcome::Updated);
		assert_eq!(store.merge(tx("a", None, TransactionState::Pending)), MergeOutcome::Unchanged);
		assert!(!store.pending_references("addr"));

		let key = TxKey {
			hash: "a".to_string(),
			log_index: None,
		};
		assert_eq!(store.get(&key).unwrap().state, TransactionState::Mined);
	}

	#[test]
	fn confirmed_records_accept_late_fee() {
		let mut store = TransactionStore::new();
		store.merge(tx("a", Some(0), TransactionState::Confirmed));

		let mut with_fee = tx("a", Some(0), TransactionState::Confirmed);
		with_fee.fee = 7;
		assert_eq!(store.merge(with_fee), MergeOutcome::Updated);

		let key = TxKey {
			hash: "a".to_string(),
			log_index: Some(0),
		};
		assert_eq!(store.get(&key).unwrap().fee, 7);
	}

	#[test]
	fn promotion_requires_depth() {
		let mut store = TransactionStore::new();
		store.merge(tx("a", None, TransactionState::Mined));

		assert!(store.promote_confirmations(105, 6).is_empty());
		assert_eq!(store.promote_confirmations(106, 6).len(), 1);
		assert!(store.iter().all(|t| t.state == TransactionState::Confirmed));
	}

	#[test]
	fn only_final_token_entries_count_as_known() {
		let mut store = TransactionStore::new();
		for (hash, state) in [
			("mined", TransactionState::Mined),
			("confirmed", TransactionState::Confirmed),
			("failed", TransactionState::Failed),
		] {
			let mut entry = tx(hash, Some(0), state);
			entry.token = Some("0xtoken".to_string());
			store.merge(entry);
		}
		store.merge(tx("utxo", None, TransactionState::Confirmed));

		let known = store.final_hashes_for_token("0xtoken");
		assert_eq!(
			known,
			HashSet::from(["confirmed".to_string(), "failed".to_string()])
		);
	}
}
