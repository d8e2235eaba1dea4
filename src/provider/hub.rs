//! Address provisioning by the external signer.
//!
//! Keys never leave the signer. It hands out derived addresses in strict derivation order, and the
//! caller checks continuity against the addresses it already knows.

use super::ProviderError;
use crate::wallet::ChainRole;

use std::collections::HashMap;
use tokio::sync::Mutex;

#[async_trait::async_trait]
pub trait AddressProvider: Send + Sync {
	/// Derive `count` further addresses for `role`.
	///
	/// The returned list starts with the last address previously handed out for that role (or
	/// with index 0 when none was), followed by the new ones.
	async fn add_addresses(
		&self,
		account_id: &str,
		role: ChainRole,
		count: usize,
	) -> Result<Vec<String>, ProviderError>;
}

/// Serves addresses exported ahead of time by the signer.
pub struct PreloadedAddressProvider {
	addresses: HashMap<ChainRole, Vec<String>>,
	/// Index of the last address already handed out per role.
	cursors: Mutex<HashMap<ChainRole, usize>>,
}

impl PreloadedAddressProvider {
	/// `known_*` is the number of leading addresses the caller already tracks.
	pub fn new(
		external: Vec<String>,
		internal: Vec<String>,
		known_external: usize,
		known_internal: usize,
	) -> Self {
		let mut cursors = HashMap::new();
		if known_external > 0 {
			cursors.insert(ChainRole::External, known_external - 1);
		}
		if known_internal > 0 {
			cursors.insert(ChainRole::Internal, known_internal - 1);
		}

		Self {
			addresses: HashMap::from([
				(ChainRole::External, external),
				(ChainRole::Internal, internal),
			]),
			cursors: Mutex::new(cursors),
		}
	}
}

#[async_trait::async_trait]
impl AddressProvider for PreloadedAddressProvider {
	async fn add_addresses(
		&self,
		_account_id: &str,
		role: ChainRole,
		count: usize,
	) -> Result<Vec<String>, ProviderError> {
		let all = self.addresses.get(&role).map(Vec::as_slice).unwrap_or(&[]);
		let mut cursors = self.cursors.lock().await;

		let (start, skip_anchor) = match cursors.get(&role) {
			Some(last) => (*last, 1),
			None => (0, 0),
		};
		let end = (start + skip_anchor + count).min(all.len());
		if end <= start + skip_anchor {
			return Err(ProviderError::Unavailable(format!(
				"no preloaded {} addresses left after index {}",
				role, start
			)));
		}

		cursors.insert(role, end - 1);
		Ok(all[start..end].to_vec())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn addresses(prefix: &str, n: usize) -> Vec<String> {
		(0..n).map(|i| format!("{prefix}{i}")).collect()
	}

	#[tokio::test]
	async fn returns_anchor_followed_by_new_addresses() {
		let provider = PreloadedAddressProvider::new(addresses("e", 10), addresses("i", 10), 3, 0);

		let batch = provider
			.add_addresses("acc", ChainRole::External, 2)
			.await
			.unwrap();
		assert_eq!(batch, vec!["e2", "e3", "e4"]);

		let batch = provider
			.add_addresses("acc", ChainRole::External, 1)
			.await
			.unwrap();
		assert_eq!(batch, vec!["e4", "e5"]);
	}

	#[tokio::test]
	async fn first_request_without_known_addresses_starts_at_zero() {
		let provider = PreloadedAddressProvider::new(vec![], addresses("i", 4), 0, 0);
		let batch = provider
			.add_addresses("acc", ChainRole::Internal, 2)
			.await
			.unwrap();
		assert_eq!(batch, vec!["i0", "i1"]);
	}

	#[tokio::test]
	async fn exhausted_list_is_an_error() {
		let provider = PreloadedAddressProvider::new(addresses("e", 2), vec![], 2, 0);
		assert!(
			provider
				.add_addresses("acc", ChainRole::External, 5)
				.await
				.is_err()
		);
	}
}
