use crate::wallet::WalletSyncError;
use crate::wallet::sync::evm_scanner::CursorCheckpoint;
use crate::wallet::{Transaction, TransactionStore};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Repository for synchronized transaction history
#[async_trait::async_trait]
pub trait TransactionRepository {
	/// Merge `batch` into the history stored under `scope`.
	async fn save_batch(&self, scope: &str, batch: &[Transaction]) -> Result<(), WalletSyncError>;
	async fn load(&self, scope: &str) -> Result<Vec<Transaction>, WalletSyncError>;
}

/// Repository for EVM scan checkpoints
#[async_trait::async_trait]
pub trait CursorRepository {
	async fn save(&self, checkpoint: &CursorCheckpoint) -> Result<(), WalletSyncError>;
	async fn load(
		&self,
		token: &str,
		owner: &str,
	) -> Result<Option<CursorCheckpoint>, WalletSyncError>;
	async fn remove(&self, token: &str, owner: &str) -> Result<(), WalletSyncError>;
}

#[derive(Serialize, Deserialize)]
struct TransactionFile {
	updated_at: String,
	transactions: Vec<Transaction>,
}

#[derive(Serialize, Deserialize)]
struct CursorFile {
	updated_at: String,
	checkpoint: CursorCheckpoint,
}

/// Keep file names portable whatever the account id looks like.
fn file_key(raw: &str) -> String {
	raw.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
				c
			} else {
				'_'
			}
		})
		.collect()
}

fn persistence_error(context: &str, e: impl std::fmt::Display) -> WalletSyncError {
	WalletSyncError::PersistenceError(format!("{}: {}", context, e))
}

/// File-based implementation of TransactionRepository
pub struct FileTransactionRepository {
	data_dir: PathBuf,
}

impl FileTransactionRepository {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn get_history_filename(&self, scope: &str) -> PathBuf {
		self.data_dir
			.join(format!("transactions_{}.json", file_key(scope)))
	}
}

#[async_trait::async_trait]
impl TransactionRepository for FileTransactionRepository {
	async fn save_batch(&self, scope: &str, batch: &[Transaction]) -> Result<(), WalletSyncError> {
		if batch.is_empty() {
			return Ok(());
		}

		let mut store = TransactionStore::from_transactions(self.load(scope).await?);
		let changed = store.merge_all(batch.iter().cloned());
		if changed == 0 {
			debug!("Nothing new to persist for {}", scope);
			return Ok(());
		}

		let file = TransactionFile {
			updated_at: chrono::Utc::now().to_rfc3339(),
			transactions: store.iter().cloned().collect(),
		};
		let content = serde_json::to_string_pretty(&file)
			.map_err(|e| persistence_error("Failed to serialize transactions", e))?;

		tokio::fs::create_dir_all(&self.data_dir).await?;
		let filename = self.get_history_filename(scope);
		tokio::fs::write(&filename, content)
			.await
			.map_err(|e| persistence_error("Failed to write transaction file", e))?;

		info!(
			"Saved {} transactions ({} changed) to {:?}",
			file.transactions.len(),
			changed,
			filename
		);
		Ok(())
	}

	async fn load(&self, scope: &str) -> Result<Vec<Transaction>, WalletSyncError> {
		let filename = self.get_history_filename(scope);

		// Check if file exists
		if !tokio::fs::try_exists(&filename).await? {
			return Ok(Vec::new());
		}

		let content = tokio::fs::read_to_string(&filename)
			.await
			.map_err(|e| persistence_error("Failed to read transaction file", e))?;
		let file: TransactionFile = serde_json::from_str(&content)
			.map_err(|e| persistence_error("Failed to parse transaction file", e))?;

		info!(
			"Loaded {} transactions from {:?} (saved {})",
			file.transactions.len(),
			filename,
			file.updated_at
		);
		Ok(file.transactions)
	}
}

/// File-based implementation of CursorRepository
pub struct FileCursorRepository {
	data_dir: PathBuf,
}

impl FileCursorRepository {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn get_cursor_filename(&self, token: &str, owner: &str) -> PathBuf {
		self.data_dir.join(format!(
			"cursor_{}_{}.json",
			file_key(token),
			file_key(owner)
		))
	}
}

#[async_trait::async_trait]
impl CursorRepository for FileCursorRepository {
	async fn save(&self, checkpoint: &CursorCheckpoint) -> Result<(), WalletSyncError> {
		let file = CursorFile {
			updated_at: chrono::Utc::now().to_rfc3339(),
			checkpoint: checkpoint.clone(),
		};
		let content = serde_json::to_string_pretty(&file)
			.map_err(|e| persistence_error("Failed to serialize cursor", e))?;

		tokio::fs::create_dir_all(&self.data_dir).await?;
		let filename = self.get_cursor_filename(&checkpoint.token, &checkpoint.owner);
		tokio::fs::write(&filename, content)
			.await
			.map_err(|e| persistence_error("Failed to write cursor file", e))?;

		info!(
			"Checkpoint saved: {} on {} confirmed up to {}",
			checkpoint.owner, checkpoint.token, checkpoint.last_confirmed_height
		);
		Ok(())
	}

	async fn load(
		&self,
		token: &str,
		owner: &str,
	) -> Result<Option<CursorCheckpoint>, WalletSyncError> {
		let filename = self.get_cursor_filename(token, owner);
		if !tokio::fs::try_exists(&filename).await? {
			return Ok(None);
		}

		let content = tokio::fs::read_to_string(&filename)
			.await
			.map_err(|e| persistence_error("Failed to read cursor file", e))?;
		let file: CursorFile = serde_json::from_str(&content)
			.map_err(|e| persistence_error("Failed to parse cursor file", e))?;
		Ok(Some(file.checkpoint))
	}

	async fn remove(&self, token: &str, owner: &str) -> Result<(), WalletSyncError> {
		let filename = self.get_cursor_filename(token, owner);
		match tokio::fs::remove_file(&filename).await {
			Ok(()) => {
				info!("Removed cursor {:?}", filename);
				Ok(())
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(persistence_error("Failed to remove cursor file", e)),
		}
	}
}

/// In-memory implementation of both repositories
#[derive(Default)]
pub struct InMemoryRepository {
	transactions: Mutex<HashMap<String, TransactionStore>>,
	cursors: Mutex<HashMap<(String, String), CursorCheckpoint>>,
}

impl InMemoryRepository {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl TransactionRepository for InMemoryRepository {
	async fn save_batch(&self, scope: &str, batch: &[Transaction]) -> Result<(), WalletSyncError> {
		self.transactions
			.lock()
			.await
			.entry(scope.to_string())
			.or_default()
			.merge_all(batch.iter().cloned());
		Ok(())
	}

	async fn load(&self, scope: &str) -> Result<Vec<Transaction>, WalletSyncError> {
		Ok(self
			.transactions
			.lock()
			.await
			.get(scope)
			.map(|store| store.iter().cloned().collect())
			.unwrap_or_default())
	}
}

#[async_trait::async_trait]
impl CursorRepository for InMemoryRepository {
	async fn save(&self, checkpoint: &CursorCheckpoint) -> Result<(), WalletSyncError> {
		self.cursors.lock().await.insert(
			(checkpoint.token.clone(), checkpoint.owner.clone()),
			checkpoint.clone(),
		);
		Ok(())
	}

	async fn load(
		&self,
		token: &str,
		owner: &str,
	) -> Result<Option<CursorCheckpoint>, WalletSyncError> {
		Ok(self
			.cursors
			.lock()
			.await
			.get(&(token.to_string(), owner.to_string()))
			.cloned())
	}

	async fn remove(&self, token: &str, owner: &str) -> Result<(), WalletSyncError> {
		self.cursors
			.lock()
			.await
			.remove(&(token.to_string(), owner.to_string()));
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wallet::TransactionState;

	fn entry(hash: &str, state: TransactionState) -> Transaction {
		Transaction {
			hash: hash.to_string(),
			log_index: Some(0),
			token: Some("0xtoken".to_string()),
			involved_addresses: vec!["0xowner".to_string()],
			sender: Some("0xowner".to_string()),
			recipient: Some("0xother".to_string()),
			value: 10,
			fee: 0,
			state,
			block_height: Some(5),
			timestamp: None,
			event: None,
			utxo: None,
		}
	}

	#[tokio::test]
	async fn file_history_merges_batches() {
		let dir = tempfile::tempdir().unwrap();
		let repo = FileTransactionRepository::new(dir.path().join("nested"));

		assert!(repo.load("acc_evm").await.unwrap().is_empty());

		repo.save_batch("acc_evm", &[entry("0xa", TransactionState::Mined)])
			.await
			.unwrap();
		repo.save_batch(
			"acc_evm",
			&[
				entry("0xa", TransactionState::Confirmed),
				entry("0xb", TransactionState::Mined),
			],
		)
		.await
		.unwrap();

		let loaded = TransactionStore::from_transactions(repo.load("acc_evm").await.unwrap());
		assert_eq!(loaded.len(), 2);
		assert_eq!(
			loaded.by_hash("0xa").next().unwrap().state,
			TransactionState::Confirmed
		);
		assert!(repo.load("other").await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn file_cursor_round_trip_and_remove() {
		let dir = tempfile::tempdir().unwrap();
		let repo = FileCursorRepository::new(dir.path().to_path_buf());
		let checkpoint = CursorCheckpoint {
			token: "0xtoken".to_string(),
			owner: "0xowner".to_string(),
			last_confirmed_height: 1_234,
		};

		repo.save(&checkpoint).await.unwrap();
		assert_eq!(
			repo.load("0xtoken", "0xowner").await.unwrap(),
			Some(checkpoint)
		);

		repo.remove("0xtoken", "0xowner").await.unwrap();
		assert_eq!(repo.load("0xtoken", "0xowner").await.unwrap(), None);
		// removing twice is fine
		repo.remove("0xtoken", "0xowner").await.unwrap();
	}

	#[test]
	fn file_keys_are_portable() {
		assert_eq!(file_key("acc/1 evm"), "acc_1_evm");
		assert_eq!(file_key("0xAbC"), "0xAbC");
	}
}
