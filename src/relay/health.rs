use super::RelayError;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Response of a relay's `/getaddr` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayPing {
	pub relay_worker_address: String,
	pub ready: bool,
	pub network_id: String,
	pub version: String,
	pub min_gas_price: String,
	pub max_acceptance_budget: String,
}

impl RelayPing {
	/// Advertised acceptance budget; unparsable values count as zero.
	pub fn acceptance_budget(&self) -> u128 {
		self.max_acceptance_budget.trim().parse().unwrap_or(0)
	}
}

/// Health check of a relay server.
#[async_trait::async_trait]
pub trait RelayHealthCheck: Send + Sync {
	async fn check(&self, url: &str) -> Result<RelayPing, RelayError>;
}

/// Checks relays over HTTP with a short timeout.
#[derive(Clone)]
pub struct HttpRelayHealthCheck {
	http_client: reqwest::Client,
}

impl HttpRelayHealthCheck {
	pub fn new(timeout: Duration) -> Result<Self, RelayError> {
		let http_client = reqwest::Client::builder().timeout(timeout).build()?;
		Ok(Self { http_client })
	}
}

#[async_trait::async_trait]
impl RelayHealthCheck for HttpRelayHealthCheck {
	async fn check(&self, url: &str) -> Result<RelayPing, RelayError> {
		let endpoint = format!("{}/getaddr", url.trim_end_matches('/'));
		debug!("Checking relay {}", endpoint);

		let response = self.http_client.get(&endpoint).send().await?;
		if !response.status().is_success() {
			return Err(RelayError::Unreachable(format!(
				"{} answered {}",
				endpoint,
				response.status()
			)));
		}
		Ok(response.json::<RelayPing>().await?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ping_parses_camel_case_and_tolerates_missing_fields() {
		let ping: RelayPing = serde_json::from_str(
			r#"{
				"relayWorkerAddress": "0xabc",
				"ready": true,
				"networkId": "100",
				"version": "2.2.0",
				"maxAcceptanceBudget": "285252"
			}"#,
		)
		.unwrap();

		assert!(ping.ready);
		assert_eq!(ping.network_id, "100");
		assert_eq!(ping.acceptance_budget(), 285_252);
		assert_eq!(ping.min_gas_price, "");
	}

	#[test]
	fn garbage_budget_counts_as_zero() {
		let ping = RelayPing {
			max_acceptance_budget: "lots".to_string(),
			..RelayPing::default()
		};
		assert_eq!(ping.acceptance_budget(), 0);
	}
}
