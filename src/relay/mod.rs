//! Discovery and ranking of gasless meta-transaction relays.
//!
//! Relays announce themselves through `RelayServerRegistered` events on the relay hub. Recent
//! registrations are streamed newest first, health checked over HTTP, and the first relay within the fee
//! ceilings is chosen; otherwise the cheapest usable one.

/// HTTP health check
pub mod health;
/// Candidate ranking
pub mod selector;

pub use health::{HttpRelayHealthCheck, RelayHealthCheck, RelayPing};
pub use selector::{RelayRequirements, RelaySelector, SelectedRelay, select_relay};

use crate::config::RelayConfig;
use crate::provider::abi::{self, DecodeError};
use crate::provider::{EvmProvider, LogFilter, ProviderError, RawLog};

use ethers::abi::ParamType;
use futures::Stream;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
	#[error("No usable relay found")]
	NoRelayAvailable,

	#[error("Provider error: {0}")]
	Provider(#[from] ProviderError),

	#[error("Relay unreachable: {0}")]
	Unreachable(String),

	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("Decode error: {0}")]
	Decode(#[from] DecodeError),
}

/// A relay registration read from the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCandidate {
	pub manager: String,
	pub base_fee: u128,
	pub pct_fee: u128,
	pub url: String,
	pub block_number: u64,
}

impl RelayCandidate {
	pub fn from_log(log: &RawLog) -> Result<Self, DecodeError> {
		let tokens = abi::decode(
			&[ParamType::Uint(256), ParamType::Uint(256), ParamType::String],
			&log.data,
		)?;
		Ok(Self {
			manager: abi::format_address(&abi::topic_address(&log.topics, 1)?),
			base_fee: abi::to_u128(abi::uint_at(&tokens, 0)?)?,
			pct_fee: abi::to_u128(abi::uint_at(&tokens, 1)?)?,
			url: abi::string_at(&tokens, 2)?,
			block_number: log.block_number,
		})
	}
}

struct CandidateScan {
	provider: Arc<dyn EvmProvider>,
	filter: LogFilter,
	batch_blocks: u64,
	lookback_blocks: u64,
	max_candidates: usize,
	/// Next batch ends here; unknown until the head is read
	next_to: Option<u64>,
	stop_at: u64,
	seen_urls: HashSet<String>,
	buffer: VecDeque<RelayCandidate>,
	emitted: usize,
	done: bool,
}

impl CandidateScan {
	async fn next(&mut self) -> Option<Result<RelayCandidate, RelayError>> {
		loop {
			if self.emitted >= self.max_candidates {
				return None;
			}
			if let Some(candidate) = self.buffer.pop_front() {
				self.emitted += 1;
				return Some(Ok(candidate));
			}
			if self.done {
				return None;
			}
			if let Err(e) = self.fetch_batch().await {
				self.done = true;
				return Some(Err(e));
			}
		}
	}

	async fn fetch_batch(&mut self) -> Result<(), RelayError> {
		let to = match self.next_to {
			Some(to) => to,
			None => {
				let head = self.provider.block_number().await?;
				self.stop_at = head.saturating_sub(self.lookback_blocks);
				head
			}
		};
		let from = to
			.saturating_sub(self.batch_blocks.saturating_sub(1))
			.max(self.stop_at);

		let mut logs = self.provider.query_logs(&self.filter, from, to).await?;
		logs.sort_by(|a, b| {
			b.block_number
				.cmp(&a.block_number)
				.then(b.log_index.cmp(&a.log_index))
		});

		for log in &logs {
			match RelayCandidate::from_log(log) {
				Ok(candidate) => {
					if self.seen_urls.insert(candidate.url.clone()) {
						self.buffer.push_back(candidate);
					}
				}
				Err(e) => warn!("Skipping undecodable relay registration: {}", e),
			}
		}
		debug!(
			"Relay registrations in [{}, {}]: {} logs, {} new candidates",
			from,
			to,
			logs.len(),
			self.buffer.len()
		);

		if from <= self.stop_at {
			self.done = true;
		} else {
			self.next_to = Some(from - 1);
		}
		Ok(())
	}
}

/// Stream recent relay registrations, newest first, one per URL.
///
/// Fails up front when the configured hub is not an address.
pub fn relay_candidates(
	provider: Arc<dyn EvmProvider>,
	config: &RelayConfig,
) -> Result<impl Stream<Item = Result<RelayCandidate, RelayError>> + Send + 'static, RelayError> {
	let filter = LogFilter::new(abi::parse_address(&config.relay_hub)?).topic(
		0,
		Some(abi::event_topic(abi::RELAY_SERVER_REGISTERED_EVENT)),
	);
	let scan = CandidateScan {
		provider,
		filter,
		batch_blocks: config.batch_blocks.max(1),
		lookback_blocks: config.lookback_blocks,
		max_candidates: config.max_candidates,
		next_to: None,
		stop_at: 0,
		seen_urls: HashSet::new(),
		buffer: VecDeque::new(),
		emitted: 0,
		done: false,
	};

	Ok(futures::stream::unfold(scan, |mut scan| async move {
		let item = scan.next().await?;
		Some((item, scan))
	}))
}
