//! Address directory for the UTXO chain.
//!
//! Holds the derived addresses of both roles in derivation order. Usage counts and unspent
//! outputs are derived from the canonical transaction store, never edited by hand.

use super::store::TransactionStore;
use super::types::{AddressRecord, ChainRole, TransactionState, Utxo};

use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct AddressDirectory {
	external: Vec<AddressRecord>,
	internal: Vec<AddressRecord>,
}

impl AddressDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_addresses(external: Vec<String>, internal: Vec<String>) -> Self {
		let mut directory = Self::new();
		directory.append(ChainRole::External, external);
		directory.append(ChainRole::Internal, internal);
		directory
	}

	pub fn records(&self, role: ChainRole) -> &[AddressRecord] {
		match role {
			ChainRole::External => &self.external,
			ChainRole::Internal => &self.internal,
		}
	}

	fn records_mut(&mut self, role: ChainRole) -> &mut Vec<AddressRecord> {
		match role {
			ChainRole::External => &mut self.external,
			ChainRole::Internal => &mut self.internal,
		}
	}

	pub fn len(&self, role: ChainRole) -> usize {
		self.records(role).len()
	}

	pub fn last_address(&self, role: ChainRole) -> Option<&str> {
		self.records(role).last().map(|record| record.address.as_str())
	}

	/// Append newly derived addresses at the end of `role`'s derivation order.
	pub fn append(&mut self, role: ChainRole, addresses: Vec<String>) {
		let records = self.records_mut(role);
		records.extend(
			addresses
				.into_iter()
				.map(|address| AddressRecord::new(address, role)),
		);
	}

	pub fn get(&self, address: &str) -> Option<&AddressRecord> {
		self.external
			.iter()
			.chain(self.internal.iter())
			.find(|record| record.address == address)
	}

	pub fn contains(&self, address: &str) -> bool {
		self.get(address).is_some()
	}

	pub fn all_addresses(&self) -> Vec<String> {
		self.external
			.iter()
			.chain(self.internal.iter())
			.map(|record| record.address.clone())
			.collect()
	}

	/// Recompute usage and unspent outputs of `address` from the store.
	pub fn refresh(&mut self, address: &str, store: &TransactionStore) {
		let spent = store.spent_outpoints(&[TransactionState::Mined, TransactionState::Confirmed]);
		self.refresh_with(address, store, &spent);
	}

	/// Recompute every record from the store.
	pub fn refresh_all(&mut self, store: &TransactionStore) {
		let spent = store.spent_outpoints(&[TransactionState::Mined, TransactionState::Confirmed]);
		for address in self.all_addresses() {
			self.refresh_with(&address, store, &spent);
		}
	}

	fn refresh_with(
		&mut self,
		address: &str,
		store: &TransactionStore,
		spent: &HashSet<(String, u32)>,
	) {
		let mut usage_count = 0u32;
		let mut utxos = Vec::new();

		for tx in store.involving(address) {
			usage_count += 1;
			if tx.state == TransactionState::Failed {
				continue;
			}
			let Some(details) = &tx.utxo else {
				continue;
			};
			for output in &details.outputs {
				if output.address.as_deref() != Some(address) {
					continue;
				}
				if spent.contains(&(tx.hash.clone(), output.index)) {
					continue;
				}
				utxos.push(Utxo {
					tx_hash: tx.hash.clone(),
					output_index: output.index,
					locking_script: output.script.clone(),
					value: output.value,
				});
			}
		}

		if let Some(record) = self
			.external
			.iter_mut()
			.chain(self.internal.iter_mut())
			.find(|record| record.address == address)
		{
			record.usage_count = usage_count;
			record.utxos = utxos;
		}
	}

	/// Addresses of `role` holding at least one unspent output.
	pub fn funded_addresses(&self, role: ChainRole) -> Vec<String> {
		self.records(role)
			.iter()
			.filter(|record| !record.utxos.is_empty())
			.map(|record| record.address.clone())
			.collect()
	}

	/// First address of `role` without any recorded usage.
	pub fn next_unused(&self, role: ChainRole) -> Option<&AddressRecord> {
		self.records(role).iter().find(|record| !record.is_used())
	}

	pub fn total_balance(&self) -> u64 {
		self.external
			.iter()
			.chain(self.internal.iter())
			.map(AddressRecord::balance)
			.sum()
	}

	/// Unspent outputs not consumed by, or created by, a pending transaction.
	pub fn spendable_utxos(&self, store: &TransactionStore) -> Vec<Utxo> {
		let pending_spent = store.spent_outpoints(&[TransactionState::Pending]);
		let pending_hashes: HashSet<String> = store
			.iter()
			.filter(|tx| tx.state == TransactionState::Pending)
			.map(|tx| tx.hash.clone())
			.collect();

		self.external
			.iter()
			.chain(self.internal.iter())
			.flat_map(|record| record.utxos.iter())
			.filter(|utxo| !pending_spent.contains(&(utxo.tx_hash.clone(), utxo.output_index)))
			.filter(|utxo| !pending_hashes.contains(&utxo.tx_hash))
			.cloned()
			.collect()
	}

	pub fn spendable_balance(&self, store: &TransactionStore) -> u64 {
		self.spendable_utxos(store).iter().map(|utxo| utxo.value).sum()
	}
}
