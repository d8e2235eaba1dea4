//! Spend planning for UTXO-chain transactions
//!
//! This module provides a builder that turns a payment request and the wallet's spendable outputs
//! into an unsigned spend plan. Signing happens in the external signer; the plan only fixes inputs,
//! outputs and the fee.

use super::fee::FeeWeights;
use super::selector::{SelectionParams, select_outputs};
use crate::wallet::Utxo;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Serialize)]
pub enum TransactionError {
	#[error("Transaction validation error: {0}")]
	ValidationError(String),

	#[error("Insufficient balance: {0}")]
	InsufficientBalance(String),
}

/// Output of a spend plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedOutput {
	pub address: String,
	pub value: u64,
	pub is_change: bool,
}

/// Unsigned transaction layout handed to the signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpendPlan {
	pub inputs: Vec<Utxo>,
	pub outputs: Vec<PlannedOutput>,
	pub fee: u64,
	pub change: u64,
}

impl SpendPlan {
	pub fn input_value(&self) -> u64 {
		self.inputs.iter().map(|utxo| utxo.value).sum()
	}
}

/// Builder for constructing spend plans
pub struct SpendPlanBuilder {
	/// Spendable outputs to select from
	utxos: Vec<Utxo>,
	/// Payment destination and amount
	recipient: Option<(String, u64)>,
	/// Address receiving change, usually the next unused internal address
	change_address: Option<String>,
	fee_rate: u64,
	params: SelectionParams,
}

impl SpendPlanBuilder {
	/// Creates a new spend plan builder
	pub fn new() -> Self {
		Self {
			utxos: Vec::new(),
			recipient: None,
			change_address: None,
			fee_rate: 1,
			params: SelectionParams::default(),
		}
	}

	/// Sets the outputs available for spending
	pub fn with_utxos(mut self, utxos: Vec<Utxo>) -> Self {
		self.utxos = utxos;
		self
	}

	/// Sets the payment
	pub fn with_recipient(mut self, address: impl Into<String>, amount: u64) -> Self {
		self.recipient = Some((address.into(), amount));
		self
	}

	pub fn with_change_address(mut self, address: impl Into<String>) -> Self {
		self.change_address = Some(address.into());
		self
	}

	/// Sets the fee rate in satoshis per vbyte
	pub fn with_fee_rate(mut self, fee_rate: u64) -> Self {
		self.fee_rate = fee_rate;
		self
	}

	pub fn with_weights(mut self, weights: FeeWeights, protocol_dust_limit: u64) -> Self {
		self.params.weights = weights;
		self.params.protocol_dust_limit = protocol_dust_limit;
		self
	}

	/// Adds weight for script data beyond the standard input/output layout
	pub fn with_extra_weight(mut self, extra_weight_units: u64) -> Self {
		self.params.extra_weight_units = extra_weight_units;
		self
	}

	/// Builds the spend plan
	pub fn build(self) -> Result<SpendPlan, TransactionError> {
		let (recipient, amount) = self.recipient.ok_or_else(|| {
			TransactionError::ValidationError("No recipient specified".to_string())
		})?;
		if amount == 0 {
			return Err(TransactionError::ValidationError(
				"Amount must be greater than zero".to_string(),
			));
		}

		let params = SelectionParams {
			fee_rate: self.fee_rate,
			..self.params
		};
		let dust = params.weights.dust_threshold(params.protocol_dust_limit);
		if amount < dust {
			return Err(TransactionError::ValidationError(format!(
				"Amount {} is below the dust threshold {}",
				amount, dust
			)));
		}

		let selection = select_outputs(&self.utxos, amount, &params);
		if !selection.is_sufficient() {
			return Err(TransactionError::InsufficientBalance(format!(
				"need {} plus fee {}, have {}",
				amount,
				selection.fee,
				selection.total_value()
			)));
		}
		debug!(
			"Selected {} inputs worth {} for a spend of {}",
			selection.selected.len(),
			selection.total_value(),
			amount
		);

		let mut outputs = vec![PlannedOutput {
			address: recipient,
			value: amount,
			is_change: false,
		}];
		if selection.has_change() {
			let change_address = self.change_address.ok_or_else(|| {
				TransactionError::ValidationError(
					"Change output required but no change address given".to_string(),
				)
			})?;
			outputs.push(PlannedOutput {
				address: change_address,
				value: selection.change,
				is_change: true,
			});
		}

		info!(
			"Planned spend: {} inputs, {} outputs, fee {}",
			selection.selected.len(),
			outputs.len(),
			selection.fee
		);

		Ok(SpendPlan {
			inputs: selection.selected,
			outputs,
			fee: selection.fee,
			change: selection.change,
		})
	}
}

impl Default for SpendPlanBuilder {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn utxo(hash: &str, script: &str, value: u64) -> Utxo {
		Utxo {
			tx_hash: hash.to_string(),
			output_index: 0,
			locking_script: script.to_string(),
			value,
		}
	}

	#[test]
	fn plan_balances_inputs_outputs_and_fee() {
		let plan = SpendPlanBuilder::new()
			.with_utxos(vec![utxo("a", "s1", 1000), utxo("b", "s2", 10_000)])
			.with_recipient("dest", 2500)
			.with_change_address("change0")
			.build()
			.unwrap();

		let output_value: u64 = plan.outputs.iter().map(|o| o.value).sum();
		assert_eq!(plan.input_value(), output_value + plan.fee);
		assert_eq!(plan.outputs.len(), 2);
		assert!(plan.outputs[1].is_change);
		assert_eq!(plan.outputs[1].address, "change0");
	}

	#[test]
	fn change_requires_an_address() {
		let result = SpendPlanBuilder::new()
			.with_utxos(vec![utxo("a", "s1", 100_000)])
			.with_recipient("dest", 2500)
			.build();
		assert!(matches!(result, Err(TransactionError::ValidationError(_))));
	}

	#[test]
	fn insufficient_funds_are_reported() {
		let result = SpendPlanBuilder::new()
			.with_utxos(vec![utxo("a", "s1", 1000)])
			.with_recipient("dest", 2500)
			.with_change_address("change0")
			.build();
		assert!(matches!(result, Err(TransactionError::InsufficientBalance(_))));
	}

	#[test]
	fn dust_payments_are_rejected() {
		let result = SpendPlanBuilder::new()
			.with_utxos(vec![utxo("a", "s1", 100_000)])
			.with_recipient("dest", 100)
			.build();
		assert!(matches!(result, Err(TransactionError::ValidationError(_))));
	}
}
