//! Gap-limit address discovery.
//!
//! Addresses of one role are inspected in derivation order while counting consecutive unused
//! ones. Once every known address has been inspected and fewer than the allowed gap are unused at
//! the tail, more addresses are requested from the signer until the gap is filled.

use crate::provider::AddressProvider;
use crate::wallet::{AddressDirectory, AddressRecord, ChainRole, WalletSyncError};

use tracing::{debug, info};

/// Next thing a gap scan needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStep {
	/// Inspect the address at this derivation index.
	Inspect(usize),
	/// Request this many further addresses.
	Extend(usize),
	Complete,
}

/// Gap counter for one role.
#[derive(Debug, Clone)]
pub struct GapScan {
	role: ChainRole,
	allowed_gap: usize,
	gap: usize,
	next_index: usize,
}

impl GapScan {
	pub fn new(role: ChainRole, allowed_gap: usize) -> Self {
		Self {
			role,
			allowed_gap,
			gap: 0,
			next_index: 0,
		}
	}

	pub fn role(&self) -> ChainRole {
		self.role
	}

	pub fn gap(&self) -> usize {
		self.gap
	}

	/// Decide the next step given how many addresses are currently known.
	pub fn next_step(&self, known: usize) -> ScanStep {
		if self.next_index < known {
			ScanStep::Inspect(self.next_index)
		} else if self.gap >= self.allowed_gap {
			ScanStep::Complete
		} else {
			ScanStep::Extend(self.allowed_gap - self.gap)
		}
	}

	/// Record the outcome of inspecting the current address.
	pub fn record(&mut self, used: bool) {
		if used {
			self.gap = 0;
		} else {
			self.gap += 1;
		}
		self.next_index += 1;
	}
}

/// Check derivation continuity of a signer response and return the new addresses.
///
/// The response must start with `last_known` when one exists.
pub fn verify_continuity(
	role: ChainRole,
	last_known: Option<&str>,
	mut returned: Vec<String>,
) -> Result<Vec<String>, WalletSyncError> {
	if let Some(expected) = last_known {
		match returned.first() {
			Some(first) if first == expected => {
				returned.remove(0);
			}
			found => {
				return Err(WalletSyncError::DerivationMismatch {
					role,
					expected: expected.to_string(),
					found: found.cloned().unwrap_or_else(|| "nothing".to_string()),
				});
			}
		}
	}

	if returned.is_empty() {
		return Err(WalletSyncError::NoNewAddresses(role));
	}
	Ok(returned)
}

/// Request `count` more addresses for `role`, verify them and append them to the directory.
pub async fn extend_addresses(
	hub: &dyn AddressProvider,
	account_id: &str,
	directory: &mut AddressDirectory,
	role: ChainRole,
	count: usize,
) -> Result<Vec<String>, WalletSyncError> {
	debug!("Requesting {} more {} addresses", count, role);
	let returned = hub.add_addresses(account_id, role, count).await?;
	let new_addresses = verify_continuity(role, directory.last_address(role), returned)?;

	info!(
		"Derived {} new {} addresses (now {})",
		new_addresses.len(),
		role,
		directory.len(role) + new_addresses.len()
	);
	directory.append(role, new_addresses.clone());
	Ok(new_addresses)
}

/// Run a gap scan over `role` using only local knowledge of usage.
///
/// `is_used` decides for each record whether it counts as used. Returns the number of addresses
/// derived along the way.
pub async fn discover_local(
	hub: &dyn AddressProvider,
	account_id: &str,
	directory: &mut AddressDirectory,
	role: ChainRole,
	allowed_gap: usize,
	is_used: impl Fn(&AddressRecord) -> bool,
) -> Result<usize, WalletSyncError> {
	let mut scan = GapScan::new(role, allowed_gap);
	let mut derived = 0;

	loop {
		match scan.next_step(directory.len(role)) {
			ScanStep::Inspect(index) => {
				let used = is_used(&directory.records(role)[index]);
				scan.record(used);
			}
			ScanStep::Extend(count) => {
				derived +=
					extend_addresses(hub, account_id, directory, role, count)
						.await?
						.len();
			}
			ScanStep::Complete => return Ok(derived),
		}
	}
}

/// Addresses worth re-checking for reuse, newest first.
///
/// Unused addresses are skipped. The walk stops at the first singly-used address once more than
/// twice the gap limit has been inspected.
pub fn reuse_check_candidates(records: &[AddressRecord], allowed_gap: usize) -> Vec<String> {
	let mut inspected = 0;
	let mut candidates = Vec::new();

	for record in records.iter().rev() {
		if record.usage_count == 0 {
			continue;
		}
		inspected += 1;
		if inspected > 2 * allowed_gap && record.usage_count == 1 {
			break;
		}
		candidates.push(record.address.clone());
	}
	candidates
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::provider::PreloadedAddressProvider;

	fn addresses(n: usize) -> Vec<String> {
		(0..n).map(|i| format!("e{i}")).collect()
	}

	#[test]
	fn scan_steps_follow_the_gap() {
		let mut scan = GapScan::new(ChainRole::External, 3);
		assert_eq!(scan.next_step(2), ScanStep::Inspect(0));
		scan.record(false);
		scan.record(true);
		assert_eq!(scan.next_step(2), ScanStep::Extend(3));
		scan.record(false);
		scan.record(false);
		assert_eq!(scan.next_step(4), ScanStep::Extend(1));
		scan.record(false);
		assert_eq!(scan.next_step(5), ScanStep::Complete);
	}

	#[test]
	fn continuity_requires_the_last_known_address_first() {
		let ok = verify_continuity(
			ChainRole::External,
			Some("e4"),
			vec!["e4".into(), "e5".into()],
		)
		.unwrap();
		assert_eq!(ok, vec!["e5"]);

		let err = verify_continuity(
			ChainRole::External,
			Some("e4"),
			vec!["e6".into(), "e7".into()],
		)
		.unwrap_err();
		assert!(matches!(err, WalletSyncError::DerivationMismatch { .. }));
		assert!(err.is_fatal());

		let err = verify_continuity(ChainRole::Internal, Some("i0"), vec!["i0".into()]).unwrap_err();
		assert!(matches!(err, WalletSyncError::NoNewAddresses(ChainRole::Internal)));

		assert_eq!(
			verify_continuity(ChainRole::Internal, None, vec!["i0".into()]).unwrap(),
			vec!["i0"]
		);
	}

	#[tokio::test]
	async fn gap_minus_one_unused_tail_requests_one_more() {
		// e0 used, e1..e9 unused: gap 9 of 10
		let mut directory = AddressDirectory::from_addresses(addresses(10), vec![]);
		let used = ["e0".to_string()];
		let hub = PreloadedAddressProvider::new(addresses(30), vec![], 10, 0);

		let derived = discover_local(
			&hub,
			"acc",
			&mut directory,
			ChainRole::External,
			10,
			|record| used.contains(&record.address),
		)
		.await
		.unwrap();

		assert_eq!(derived, 1);
		assert_eq!(directory.len(ChainRole::External), 11);
		assert_eq!(directory.last_address(ChainRole::External), Some("e10"));
	}

	#[tokio::test]
	async fn full_gap_completes_without_requests() {
		// e0 used, e1..e10 unused: gap exactly 10
		let mut directory = AddressDirectory::from_addresses(addresses(11), vec![]);
		let used = ["e0".to_string()];
		let hub = PreloadedAddressProvider::new(vec![], vec![], 0, 0);

		let derived = discover_local(
			&hub,
			"acc",
			&mut directory,
			ChainRole::External,
			10,
			|record| used.contains(&record.address),
		)
		.await
		.unwrap();

		assert_eq!(derived, 0);
		assert_eq!(directory.len(ChainRole::External), 11);
	}

	#[tokio::test]
	async fn mismatching_signer_is_fatal() {
		let mut directory = AddressDirectory::from_addresses(vec!["e0".into(), "e1".into()], vec![]);
		// the signer believes only e0 is known and anchors its answer at e0
		let hub = PreloadedAddressProvider::new(addresses(10), vec![], 1, 0);

		let err = discover_local(&hub, "acc", &mut directory, ChainRole::External, 5, |_| false)
			.await
			.unwrap_err();
		assert!(matches!(err, WalletSyncError::DerivationMismatch { .. }));
	}

	#[test]
	fn reuse_check_walks_newest_first_and_stops_at_old_single_use() {
		let mut records: Vec<AddressRecord> = (0..12)
			.map(|i| AddressRecord::new(format!("e{i}"), ChainRole::External))
			.collect();
		for (i, record) in records.iter_mut().enumerate() {
			record.usage_count = if i == 11 { 0 } else if i == 5 { 3 } else { 1 };
		}

		let candidates = reuse_check_candidates(&records, 2);

		// e11 skipped, e10..e7 inspected, e6 is the fifth used address and singly used
		assert_eq!(candidates, vec!["e10", "e9", "e8", "e7"]);
	}
}
