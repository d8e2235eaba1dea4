//! Consensus and visibility tracking for the UTXO synchronizer.
//!
//! A lost connection invalidates what was fetched during the session exactly once; the next time
//! consensus is established a full resync runs. Coming back to the foreground after a long pause
//! forces the same invalidation.

use crate::provider::ConsensusState;

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// What the synchronizer has to do after a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusAction {
	None,
	/// Clear the fetched-this-session markers and wait for consensus.
	Invalidate,
	/// Clear the markers and run a full sync now.
	Resync,
}

#[derive(Debug, Clone)]
pub struct ConsensusTracker {
	state: ConsensusState,
	invalidation_pending: bool,
	hidden_since: Option<Instant>,
	resync_after_hidden: Duration,
}

impl ConsensusTracker {
	pub fn new(resync_after_hidden: Duration) -> Self {
		Self {
			state: ConsensusState::Syncing,
			invalidation_pending: false,
			hidden_since: None,
			resync_after_hidden,
		}
	}

	pub fn state(&self) -> ConsensusState {
		self.state
	}

	pub fn is_established(&self) -> bool {
		self.state == ConsensusState::Established
	}

	pub fn invalidation_pending(&self) -> bool {
		self.invalidation_pending
	}

	pub fn on_consensus(&mut self, next: ConsensusState) -> ConsensusAction {
		let previous = std::mem::replace(&mut self.state, next);
		if previous == next {
			return ConsensusAction::None;
		}
		debug!("Consensus {:?} -> {:?}", previous, next);

		match (previous, next) {
			(ConsensusState::Established, _) => {
				if self.invalidation_pending {
					return ConsensusAction::None;
				}
				info!("Consensus lost, invalidating session");
				self.invalidation_pending = true;
				ConsensusAction::Invalidate
			}
			(ConsensusState::Syncing, ConsensusState::Established) => {
				self.invalidation_pending = false;
				ConsensusAction::Resync
			}
			(_, ConsensusState::Established) if self.invalidation_pending => {
				info!("Consensus re-established, resyncing");
				self.invalidation_pending = false;
				ConsensusAction::Resync
			}
			_ => ConsensusAction::None,
		}
	}

	pub fn on_visibility(&mut self, visible: bool, now: Instant) -> ConsensusAction {
		if !visible {
			self.hidden_since.get_or_insert(now);
			return ConsensusAction::None;
		}

		let Some(hidden_since) = self.hidden_since.take() else {
			return ConsensusAction::None;
		};
		if now.saturating_duration_since(hidden_since) <= self.resync_after_hidden
			|| self.invalidation_pending
		{
			return ConsensusAction::None;
		}

		info!("Visible again after a long pause, forcing resync");
		if self.is_established() {
			ConsensusAction::Resync
		} else {
			self.invalidation_pending = true;
			ConsensusAction::Invalidate
		}
	}
}
