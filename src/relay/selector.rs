use super::{RelayCandidate, RelayError, RelayHealthCheck, RelayPing, relay_candidates};
use crate::config::RelayConfig;
use crate::provider::EvmProvider;

use futures::{Stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a relay must offer to be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequirements {
	pub max_pct_fee: u128,
	pub max_base_fee: u128,
	pub network_id: String,
	pub version_prefix: String,
	pub min_acceptance_budget: u128,
}

impl From<&RelayConfig> for RelayRequirements {
	fn from(config: &RelayConfig) -> Self {
		Self {
			max_pct_fee: config.max_pct_fee,
			max_base_fee: config.max_base_fee,
			network_id: config.network_id.clone(),
			version_prefix: config.version_prefix.clone(),
			min_acceptance_budget: config.min_acceptance_budget,
		}
	}
}

impl RelayRequirements {
	/// Why a relay cannot be used, if it cannot.
	pub fn rejection(&self, ping: &RelayPing) -> Option<String> {
		if !ping.ready {
			Some("not ready".to_string())
		} else if ping.network_id != self.network_id {
			Some(format!("network {} instead of {}", ping.network_id, self.network_id))
		} else if !ping.version.starts_with(&self.version_prefix) {
			Some(format!("incompatible version {}", ping.version))
		} else if ping.acceptance_budget() < self.min_acceptance_budget {
			Some(format!("acceptance budget {}", ping.acceptance_budget()))
		} else {
			None
		}
	}

	pub fn within_ceilings(&self, candidate: &RelayCandidate) -> bool {
		candidate.pct_fee <= self.max_pct_fee && candidate.base_fee <= self.max_base_fee
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedRelay {
	pub candidate: RelayCandidate,
	pub ping: RelayPing,
}

/// Check candidates in order and pick a relay.
///
/// The first usable relay within the fee ceilings wins. Otherwise the usable relay with the lowest
/// `(base_fee, pct_fee)` is returned once the candidates run out.
pub async fn select_relay<S>(
	candidates: S,
	health: &dyn RelayHealthCheck,
	requirements: &RelayRequirements,
) -> Result<SelectedRelay, RelayError>
where
	S: Stream<Item = Result<RelayCandidate, RelayError>>,
{
	let mut candidates = std::pin::pin!(candidates);
	let mut cheapest: Option<SelectedRelay> = None;

	while let Some(item) = candidates.next().await {
		let candidate = match item {
			Ok(candidate) => candidate,
			Err(e) => {
				warn!("Relay discovery interrupted: {}", e);
				break;
			}
		};

		let ping = match health.check(&candidate.url).await {
			Ok(ping) => ping,
			Err(e) => {
				debug!("Relay {} unreachable: {}", candidate.url, e);
				continue;
			}
		};
		if let Some(reason) = requirements.rejection(&ping) {
			debug!("Discarding relay {}: {}", candidate.url, reason);
			continue;
		}

		if requirements.within_ceilings(&candidate) {
			info!("Selected relay {}", candidate.url);
			return Ok(SelectedRelay { candidate, ping });
		}

		let cheaper = cheapest.as_ref().is_none_or(|best| {
			(candidate.base_fee, candidate.pct_fee) < (best.candidate.base_fee, best.candidate.pct_fee)
		});
		if cheaper {
			cheapest = Some(SelectedRelay { candidate, ping });
		}
	}

	match cheapest {
		Some(selected) => {
			info!(
				"No relay within fee ceilings, using cheapest {} (base {}, pct {})",
				selected.candidate.url, selected.candidate.base_fee, selected.candidate.pct_fee
			);
			Ok(selected)
		}
		None => Err(RelayError::NoRelayAvailable),
	}
}

/// Relay discovery bound to a provider, a health check and a config.
pub struct RelaySelector {
	provider: Arc<dyn EvmProvider>,
	health: Box<dyn RelayHealthCheck>,
	config: RelayConfig,
}

impl RelaySelector {
	pub fn new(provider: Arc<dyn EvmProvider>, health: Box<dyn RelayHealthCheck>, config: RelayConfig) -> Self {
		Self {
			provider,
			health,
			config,
		}
	}

	pub async fn select(&self) -> Result<SelectedRelay, RelayError> {
		let requirements = RelayRequirements::from(&self.config);
		select_relay(
			relay_candidates(self.provider.clone(), &self.config)?,
			self.health.as_ref(),
			&requirements,
		)
		.await
	}
}
