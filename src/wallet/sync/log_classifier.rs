//! Decoding and classification of ERC-20 transfer logs.
//!
//! Raw logs are decoded into [`DecodedEvent`] values; undecodable logs surface as `DecodeError`
//! and are skipped by the caller. Decoded transfers are then classified by their counterparty:
//! fee sinks, the HTLC contract, swap contracts, or none of these.

use crate::provider::abi::{self, DecodeError};
use crate::provider::{RawLog, TransactionReceipt};
use crate::wallet::{HtlcEvent, SwapEvent, Transaction, TransactionState};

use ethers::abi::ParamType;
use ethers::types::{Address, H256};
use itertools::Itertools;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
	#[error("transaction {hash} has {count} fee transfers but no primary transfer")]
	OrphanFee { hash: String, count: usize },
}

/// A decoded `Transfer` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLog {
	pub token: Address,
	pub hash: H256,
	pub log_index: u64,
	pub block_number: u64,
	pub from: Address,
	pub to: Address,
	pub value: u128,
}

impl TransferLog {
	/// Hash in the form wallet entries are keyed by.
	pub fn hash_key(&self) -> String {
		abi::format_hash(&self.hash)
	}

	/// Canonical entry for this transfer, without fee or event.
	pub fn to_transaction(&self, state: TransactionState) -> Transaction {
		let from = abi::format_address(&self.from);
		let to = abi::format_address(&self.to);
		Transaction {
			hash: self.hash_key(),
			log_index: Some(self.log_index),
			token: Some(abi::format_address(&self.token)),
			involved_addresses: vec![from.clone(), to.clone()].into_iter().unique().collect(),
			sender: Some(from),
			recipient: Some(to),
			value: self.value,
			fee: 0,
			state,
			block_height: Some(self.block_number),
			timestamp: None,
			event: None,
			utxo: None,
		}
	}
}

/// Events this crate knows how to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
	Transfer(TransferLog),
	Htlc(HtlcEvent),
}

/// Decode a log by its first topic.
pub fn decode_log(log: &RawLog) -> Result<DecodedEvent, DecodeError> {
	let topic0 = *log.topics.first().ok_or(DecodeError::MissingTopic(0))?;

	if topic0 == abi::event_topic(abi::TRANSFER_EVENT) {
		let tokens = abi::decode(&[ParamType::Uint(256)], &log.data)?;
		return Ok(DecodedEvent::Transfer(TransferLog {
			token: log.address,
			hash: log.transaction_hash,
			log_index: log.log_index,
			block_number: log.block_number,
			from: abi::topic_address(&log.topics, 1)?,
			to: abi::topic_address(&log.topics, 2)?,
			value: abi::to_u128(abi::uint_at(&tokens, 0)?)?,
		}));
	}

	if topic0 == abi::event_topic(abi::HTLC_OPEN_EVENT)
		|| topic0 == abi::event_topic(abi::HTLC_REDEEM_EVENT)
		|| topic0 == abi::event_topic(abi::HTLC_REFUND_EVENT)
	{
		return decode_htlc(topic0, log).map(DecodedEvent::Htlc);
	}

	Err(DecodeError::UnknownEvent(topic0))
}

/// HTLC ids may be indexed; when they are not they lead the data section.
fn decode_htlc(topic0: H256, log: &RawLog) -> Result<HtlcEvent, DecodeError> {
	let indexed_id = log.topics.get(1).copied();
	let mut types = Vec::new();
	if indexed_id.is_none() {
		types.push(ParamType::FixedBytes(32));
	}
	let first = types.len();

	let open = topic0 == abi::event_topic(abi::HTLC_OPEN_EVENT);
	let redeem = topic0 == abi::event_topic(abi::HTLC_REDEEM_EVENT);
	if open {
		types.extend([
			ParamType::Address,
			ParamType::Uint(256),
			ParamType::Address,
			ParamType::FixedBytes(32),
			ParamType::Uint(256),
		]);
	} else if redeem {
		types.push(ParamType::FixedBytes(32));
	}

	let tokens = abi::decode(&types, &log.data)?;
	let id = match indexed_id {
		Some(topic) => abi::format_hash(&topic),
		None => abi::format_hash(&abi::bytes32_at(&tokens, 0)?),
	};

	if open {
		Ok(HtlcEvent::Open {
			id,
			token: abi::format_address(&abi::address_at(&tokens, first)?),
			amount: abi::to_u128(abi::uint_at(&tokens, first + 1)?)?,
			recipient: abi::format_address(&abi::address_at(&tokens, first + 2)?),
			hash: abi::format_hash(&abi::bytes32_at(&tokens, first + 3)?),
			timeout: abi::to_u128(abi::uint_at(&tokens, first + 4)?)?,
		})
	} else if redeem {
		Ok(HtlcEvent::Redeem {
			id,
			secret: abi::format_hash(&abi::bytes32_at(&tokens, first)?),
		})
	} else {
		Ok(HtlcEvent::Refund { id })
	}
}

/// How a transfer is reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogClass {
	/// Relay or pool fee belonging to a sibling transfer
	FeeSink,
	Htlc,
	Swap,
	Plain,
}

/// Addresses the classifier matches transfers against.
#[derive(Debug, Clone, Default)]
pub struct ClassifierConfig {
	pub fee_sinks: HashSet<Address>,
	pub htlc_contract: Option<Address>,
	pub swap_contracts: HashSet<Address>,
	pub native_token: Option<Address>,
}

impl ClassifierConfig {
	pub fn classify(&self, transfer: &TransferLog) -> LogClass {
		if self.fee_sinks.contains(&transfer.to) {
			LogClass::FeeSink
		} else if self
			.htlc_contract
			.is_some_and(|htlc| htlc == transfer.to || htlc == transfer.from)
		{
			LogClass::Htlc
		} else if self.swap_contracts.contains(&transfer.to) {
			LogClass::Swap
		} else {
			LogClass::Plain
		}
	}

	/// The HTLC event emitted by the HTLC contract in `receipt`.
	pub fn htlc_event(&self, receipt: &TransactionReceipt) -> Option<HtlcEvent> {
		let htlc = self.htlc_contract?;
		receipt
			.logs
			.iter()
			.filter(|log| log.address == htlc)
			.find_map(|log| match decode_log(log) {
				Ok(DecodedEvent::Htlc(event)) => Some(event),
				Ok(_) => None,
				Err(e) => {
					debug!("Skipping undecodable HTLC log in {:#x}: {}", receipt.transaction_hash, e);
					None
				}
			})
	}

	/// Pair a transfer into a swap contract with the native-token payout in the same receipt.
	pub fn swap_event(&self, receipt: &TransactionReceipt, transfer: &TransferLog) -> Option<SwapEvent> {
		let native = self.native_token?;
		receipt
			.logs
			.iter()
			.filter(|log| log.address == native)
			.filter_map(|log| match decode_log(log) {
				Ok(DecodedEvent::Transfer(payout)) => Some(payout),
				_ => None,
			})
			.find(|payout| payout.from == transfer.to)
			.map(|payout| SwapEvent {
				amount_in: transfer.value,
				amount_out: payout.value,
			})
	}
}

/// Fold fee-sink transfers into their same-hash siblings.
///
/// A lone fee transfer without a sibling is the only trace of a failed meta-transaction and is
/// kept as a `Failed` entry carrying the fee. Several fee transfers without a sibling cannot be
/// attributed and are rejected.
pub fn merge_fees(
	entries: &mut Vec<Transaction>,
	fee_logs: Vec<TransferLog>,
) -> Result<(), ReconcileError> {
	let grouped = fee_logs.into_iter().into_group_map_by(TransferLog::hash_key);

	for hash in grouped.keys().sorted() {
		let fees = &grouped[hash];
		let fee_indices: HashSet<u64> = fees.iter().map(|log| log.log_index).collect();
		let total: u128 = fees.iter().map(|log| log.value).sum();

		let primary = entries.iter_mut().find(|entry| {
			entry.hash == *hash
				&& entry
					.log_index
					.is_some_and(|index| !fee_indices.contains(&index))
		});

		match (primary, fees.as_slice()) {
			(Some(primary), _) => {
				debug!("Merging fee {} into {}", total, hash);
				primary.fee = primary.fee.saturating_add(total);
			}
			(None, [lone]) => {
				debug!("Fee transfer {} has no primary transfer, keeping it as failed", hash);
				let mut failed = lone.to_transaction(TransactionState::Failed);
				failed.value = 0;
				failed.fee = lone.value;
				entries.push(failed);
			}
			(None, _) => {
				return Err(ReconcileError::OrphanFee {
					hash: hash.clone(),
					count: fees.len(),
				});
			}
		}
	}
	Ok(())
}
