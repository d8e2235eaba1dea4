//! Weight-based fee estimation for UTXO-chain transactions.

use serde::{Deserialize, Serialize};

/// Size of each transaction component in weight units (4 weight units per vbyte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeWeights {
	pub header: u64,
	pub input: u64,
	pub output: u64,
}

impl Default for FeeWeights {
	fn default() -> Self {
		Self {
			header: 43,
			input: 271,
			output: 136,
		}
	}
}

impl FeeWeights {
	/// Total weight of a transaction with the given shape.
	pub fn weight(&self, num_inputs: usize, num_outputs: usize, extra_weight_units: u64) -> u64 {
		self.header
			.saturating_add(self.input.saturating_mul(num_inputs as u64))
			.saturating_add(self.output.saturating_mul(num_outputs as u64))
			.saturating_add(extra_weight_units)
	}

	/// Virtual size in vbytes, rounded up.
	pub fn vsize(&self, num_inputs: usize, num_outputs: usize, extra_weight_units: u64) -> u64 {
		self.weight(num_inputs, num_outputs, extra_weight_units)
			.div_ceil(4)
	}

	/// Smallest output worth creating: twice the cost of spending it, or the protocol limit.
	pub fn dust_threshold(&self, protocol_dust_limit: u64) -> u64 {
		(self.input.div_ceil(4) * 2).max(protocol_dust_limit)
	}
}

/// Fee for a transaction with `num_inputs` inputs and `num_outputs` outputs at `fee_rate`
/// satoshis per vbyte.
pub fn estimate_fee(
	weights: &FeeWeights,
	num_inputs: usize,
	num_outputs: usize,
	fee_rate: u64,
	extra_weight_units: u64,
) -> u64 {
	weights
		.vsize(num_inputs, num_outputs, extra_weight_units)
		.saturating_mul(fee_rate)
}
