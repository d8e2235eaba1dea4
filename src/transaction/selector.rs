//! Coin selection over the wallet's unspent outputs.
//!
//! Outputs sharing a locking script are always spent together, so selection works on
//! script groups. Groups are consumed smallest-first until the target plus fee is covered.

use super::fee::{FeeWeights, estimate_fee};
use crate::wallet::Utxo;

use itertools::Itertools;

/// Parameters of a selection run.
#[derive(Debug, Clone, Copy)]
pub struct SelectionParams {
	pub weights: FeeWeights,
	/// Satoshis per vbyte.
	pub fee_rate: u64,
	pub extra_weight_units: u64,
	pub protocol_dust_limit: u64,
}

impl Default for SelectionParams {
	fn default() -> Self {
		Self {
			weights: FeeWeights::default(),
			fee_rate: 1,
			extra_weight_units: 0,
			protocol_dust_limit: 546,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
	pub selected: Vec<Utxo>,
	/// Value of the change output, zero when no change output is created.
	pub change: u64,
	pub fee: u64,
	/// Target the selection was run for.
	pub amount: u64,
}

impl Selection {
	pub fn total_value(&self) -> u64 {
		self.selected.iter().map(|utxo| utxo.value).sum()
	}

	pub fn has_change(&self) -> bool {
		self.change > 0
	}

	/// Whether the selected outputs pay for `amount`, the fee and the change.
	pub fn is_sufficient(&self) -> bool {
		!self.selected.is_empty()
			&& self.total_value() >= self.amount.saturating_add(self.fee).saturating_add(self.change)
	}
}

/// Select outputs covering `amount`.
///
/// When the available outputs are exhausted the returned selection holds all of them and
/// reports `is_sufficient() == false`.
pub fn select_outputs(utxos: &[Utxo], amount: u64, params: &SelectionParams) -> Selection {
	let dust = params.weights.dust_threshold(params.protocol_dust_limit);

	let mut groups: Vec<(u64, String, Vec<Utxo>)> = utxos
		.iter()
		.cloned()
		.into_group_map_by(|utxo| utxo.locking_script.clone())
		.into_iter()
		.map(|(script, group)| (group.iter().map(|utxo| utxo.value).sum(), script, group))
		.collect();
	groups.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

	let mut selected = Vec::new();
	let mut sum = 0u64;
	for (value, _, mut group) in groups {
		sum = sum.saturating_add(value);
		group.sort_by(|a, b| {
			a.tx_hash
				.cmp(&b.tx_hash)
				.then(a.output_index.cmp(&b.output_index))
		});
		selected.extend(group);

		let fee_with_change = estimate_fee(
			&params.weights,
			selected.len(),
			2,
			params.fee_rate,
			params.extra_weight_units,
		);
		let fee_without_change = estimate_fee(
			&params.weights,
			selected.len(),
			1,
			params.fee_rate,
			params.extra_weight_units,
		);

		if sum > amount.saturating_add(fee_with_change).saturating_add(dust) {
			return Selection {
				selected,
				change: sum - amount - fee_with_change,
				fee: fee_with_change,
				amount,
			};
		}
		if sum >= amount.saturating_add(fee_without_change) {
			return Selection {
				selected,
				change: 0,
				fee: fee_without_change,
				amount,
			};
		}
	}

	let fee = estimate_fee(
		&params.weights,
		selected.len().max(1),
		1,
		params.fee_rate,
		params.extra_weight_units,
	);
	Selection {
		selected,
		change: 0,
		fee,
		amount,
	}
}
