//! State persistence service for wallet synchronization.
//!
//! This module provides the `StatePersistenceService`, which saves and restores synchronized
//! transaction history and EVM scan checkpoints. It uses repository traits to abstract the details
//! of file-based persistence, so a restarted process resumes from what it already reconciled.
//!
//! History is kept per scope: `{account}_utxo` for the UTXO chain and `{account}_evm` for EVM
//! tokens.

use crate::config::StorageConfig;
use crate::wallet::sync::evm_scanner::{BatchSink, CursorCheckpoint};
use crate::wallet::sync::repositories::{
    CursorRepository, FileCursorRepository, FileTransactionRepository, InMemoryRepository,
    TransactionRepository,
};
use crate::wallet::{Transaction, TransactionStore, WalletSyncError};

use std::path::PathBuf;
use tracing::info;

/// Service for managing state persistence operations.
///
/// This service coordinates the saving and loading of transaction history and scan checkpoints
/// using the appropriate repository implementations.
pub struct StatePersistenceService {
    transaction_repo: Box<dyn TransactionRepository + Send + Sync>,
    cursor_repo: Box<dyn CursorRepository + Send + Sync>,
}

impl StatePersistenceService {
    /// Create a new state persistence service for the given data directory.
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            transaction_repo: Box::new(FileTransactionRepository::new(data_dir.clone())),
            cursor_repo: Box::new(FileCursorRepository::new(data_dir)),
        }
    }

    /// Keep everything in memory; nothing survives the process.
    pub fn in_memory() -> Self {
        Self {
            transaction_repo: Box::new(InMemoryRepository::new()),
            cursor_repo: Box::new(InMemoryRepository::new()),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        if config.enable_persistence {
            info!("Persisting sync state in {:?}", config.data_dir);
            Self::new(config.data_dir.clone())
        } else {
            info!("Persistence disabled, keeping sync state in memory");
            Self::in_memory()
        }
    }

    pub fn utxo_scope(account_id: &str) -> String {
        format!("{}_utxo", account_id)
    }

    pub fn evm_scope(account_id: &str) -> String {
        format!("{}_evm", account_id)
    }

    /// Merge a batch into the stored history of `scope`.
    pub async fn save_transactions(
        &self,
        scope: &str,
        batch: &[Transaction],
    ) -> Result<(), WalletSyncError> {
        self.transaction_repo.save_batch(scope, batch).await
    }

    /// Restore the history of `scope` as a store.
    pub async fn load_store(&self, scope: &str) -> Result<TransactionStore, WalletSyncError> {
        let transactions = self.transaction_repo.load(scope).await?;
        if !transactions.is_empty() {
            info!("Restored {} transactions for {}", transactions.len(), scope);
        }
        Ok(TransactionStore::from_transactions(transactions))
    }

    pub async fn save_checkpoint(&self, checkpoint: &CursorCheckpoint) -> Result<(), WalletSyncError> {
        self.cursor_repo.save(checkpoint).await
    }

    /// Last confirmed height of a previous session, 0 when none was saved.
    pub async fn last_confirmed_height(
        &self,
        token: &str,
        owner: &str,
    ) -> Result<u64, WalletSyncError> {
        Ok(self
            .cursor_repo
            .load(token, owner)
            .await?
            .map(|checkpoint| checkpoint.last_confirmed_height)
            .unwrap_or(0))
    }

    /// Forget the checkpoint of a token/owner pair.
    pub async fn reset_checkpoint(&self, token: &str, owner: &str) -> Result<(), WalletSyncError> {
        self.cursor_repo.remove(token, owner).await
    }
}

/// Batch sink that merges into a store and persists each batch before the scan moves on.
pub struct PersistingSink<'a> {
    pub store: &'a mut TransactionStore,
    pub persistence: &'a StatePersistenceService,
    pub scope: &'a str,
}

#[async_trait::async_trait]
impl BatchSink for PersistingSink<'_> {
    async fn commit(&mut self, batch: Vec<Transaction>) -> Result<(), WalletSyncError> {
        self.persistence.save_transactions(self.scope, &batch).await?;
        self.store.merge_all(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::TransactionState;

    fn entry(hash: &str) -> Transaction {
        Transaction {
            hash: hash.to_string(),
            log_index: None,
            token: None,
            involved_addresses: vec!["e0".to_string()],
            sender: None,
            recipient: Some("e0".to_string()),
            value: 1,
            fee: 0,
            state: TransactionState::Pending,
            block_height: None,
            timestamp: None,
            event: None,
            utxo: None,
        }
    }

    #[tokio::test]
    async fn sink_persists_before_merging() {
        let persistence = StatePersistenceService::in_memory();
        let mut store = TransactionStore::new();
        let scope = StatePersistenceService::evm_scope("acc");

        {
            let mut sink = PersistingSink {
                store: &mut store,
                persistence: &persistence,
                scope: &scope,
            };
            sink.commit(vec![entry("0xa"), entry("0xb")]).await.unwrap();
        }

        assert_eq!(store.len(), 2);
        assert_eq!(persistence.load_store(&scope).await.unwrap().len(), 2);
        assert!(persistence.load_store("acc_utxo").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn checkpoints_default_to_zero_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = StatePersistenceService::new(dir.path().to_path_buf());

        assert_eq!(persistence.last_confirmed_height("0xt", "0xo").await.unwrap(), 0);

        persistence
            .save_checkpoint(&CursorCheckpoint {
                token: "0xt".to_string(),
                owner: "0xo".to_string(),
                last_confirmed_height: 77,
            })
            .await
            .unwrap();
        assert_eq!(persistence.last_confirmed_height("0xt", "0xo").await.unwrap(), 77);

        persistence.reset_checkpoint("0xt", "0xo").await.unwrap();
        assert_eq!(persistence.last_confirmed_height("0xt", "0xo").await.unwrap(), 0);
    }

    #[test]
    fn scopes_separate_chains() {
        assert_eq!(StatePersistenceService::utxo_scope("acc"), "acc_utxo");
        assert_eq!(StatePersistenceService::evm_scope("acc"), "acc_evm");
    }
}
