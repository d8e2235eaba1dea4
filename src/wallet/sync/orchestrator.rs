//! Wallet sync orchestrator and integration point for all sync services.
//!
//! This module defines the `SyncOrchestrator`, a per-account actor that owns every piece of
//! mutable sync state for that account. Events arrive on an mpsc queue and are dispatched to the
//! registered handlers one at a time:
//! - `UtxoSyncHandler` drives gap-limit discovery, history fetching, live updates and confirmation
//!   promotion for the UTXO chain
//! - `EvmSyncHandler` runs backward log scans for every configured token
//! - `LoggingHandler` traces the event stream
//!
//! `bridge_utxo_provider` turns provider watch channels and live listener pushes into events, so
//! nothing outside the actor mutates account state.

use crate::provider::abi;
use crate::provider::{ConsensusState, ProviderError, UtxoProvider};
use crate::utils::{UTXO_DECIMALS, format_token_amount};
use crate::wallet::sync::{
    consensus::{ConsensusAction, ConsensusTracker},
    events::{EventDispatcher, SyncEvent, SyncEventHandler},
    evm_scanner::EvmScanner,
    state_persistence::{PersistingSink, StatePersistenceService},
    utxo_sync::UtxoSynchronizer,
};
use crate::wallet::{ChainRole, Transaction, TransactionStore, WalletSyncError};

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-account sync actor.
///
/// Processes events serially until every sender is gone or a handler reports a fatal error.
pub struct SyncOrchestrator {
    account_id: String,
    dispatcher: EventDispatcher,
    events: mpsc::Receiver<SyncEvent>,
}

impl SyncOrchestrator {
    /// Create an orchestrator and the sender feeding its queue.
    pub fn new(
        account_id: impl Into<String>,
        dispatcher: EventDispatcher,
        capacity: usize,
    ) -> (Self, mpsc::Sender<SyncEvent>) {
        let (sender, events) = mpsc::channel(capacity.max(1));
        (
            Self {
                account_id: account_id.into(),
                dispatcher,
                events,
            },
            sender,
        )
    }

    /// Process events until the queue closes.
    ///
    /// A fatal handler error stops the actor and is returned.
    pub async fn run(mut self) -> Result<(), WalletSyncError> {
        info!(
            "Starting sync orchestrator for {} with {} handlers",
            self.account_id,
            self.dispatcher.handler_count()
        );

        while let Some(event) = self.events.recv().await {
            if let Err(e) = self.dispatcher.dispatch(&event).await {
                warn!("Stopping sync of {}: {}", self.account_id, e);
                return Err(e);
            }
        }

        info!("Event queue of {} closed, orchestrator finished", self.account_id);
        Ok(())
    }

    pub fn spawn(self) -> JoinHandle<Result<(), WalletSyncError>> {
        tokio::spawn(self.run())
    }
}

/// Forward provider state changes and live transactions into an orchestrator queue.
///
/// Ends when the orchestrator queue closes or every source is gone.
pub fn bridge_utxo_provider(
    provider: Arc<dyn UtxoProvider>,
    mut live: mpsc::UnboundedReceiver<Transaction>,
    events: mpsc::Sender<SyncEvent>,
) -> JoinHandle<()> {
    let mut consensus = provider.consensus();
    let mut head = provider.head();

    tokio::spawn(async move {
        let mut consensus_open = true;
        let mut head_open = true;
        let mut live_open = true;

        while consensus_open || head_open || live_open {
            let event = tokio::select! {
                changed = consensus.changed(), if consensus_open => match changed {
                    Ok(()) => {
                        let state = *consensus.borrow_and_update();
                        Some(SyncEvent::ConsensusChanged(state))
                    }
                    Err(_) => {
                        consensus_open = false;
                        None
                    }
                },
                changed = head.changed(), if head_open => match changed {
                    Ok(()) => {
                        let info = *head.borrow_and_update();
                        Some(SyncEvent::HeadChanged(info))
                    }
                    Err(_) => {
                        head_open = false;
                        None
                    }
                },
                transaction = live.recv(), if live_open => match transaction {
                    Some(transaction) => Some(SyncEvent::TransactionReceived(transaction)),
                    None => {
                        live_open = false;
                        None
                    }
                },
            };

            if let Some(event) = event {
                if events.send(event).await.is_err() {
                    debug!("Orchestrator queue closed, stopping provider bridge");
                    return;
                }
            }
        }
    })
}

/// Event handler for the UTXO chain of one account.
pub struct UtxoSyncHandler {
    synchronizer: UtxoSynchronizer,
    consensus: ConsensusTracker,
    persistence: Arc<StatePersistenceService>,
    scope: String,
}

impl UtxoSyncHandler {
    pub fn new(
        synchronizer: UtxoSynchronizer,
        consensus: ConsensusTracker,
        persistence: Arc<StatePersistenceService>,
    ) -> Self {
        let scope = StatePersistenceService::utxo_scope(synchronizer.account_id());
        Self {
            synchronizer,
            consensus,
            persistence,
            scope,
        }
    }

    pub fn synchronizer(&self) -> &UtxoSynchronizer {
        &self.synchronizer
    }

    async fn run_sync(&mut self, recheck_reuse: bool) -> Result<(), WalletSyncError> {
        match self.synchronizer.sync_all().await {
            Ok(stats) => debug!("UTXO sync finished: {}", stats.summary()),
            Err(WalletSyncError::Aborted(reason)) => {
                warn!("UTXO sync aborted: {}", reason);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if recheck_reuse {
            self.synchronizer.recheck_reused(ChainRole::External).await;
        }
        let spendable = self
            .synchronizer
            .directory()
            .spendable_balance(self.synchronizer.store());
        info!(
            "Spendable balance of {}: {}",
            self.synchronizer.account_id(),
            format_token_amount(u128::from(spendable), UTXO_DECIMALS)
        );
        self.persist_all().await
    }

    async fn persist_all(&self) -> Result<(), WalletSyncError> {
        let snapshot: Vec<Transaction> = self.synchronizer.store().iter().cloned().collect();
        self.persistence
            .save_transactions(&self.scope, &snapshot)
            .await
    }

    async fn apply(&mut self, action: ConsensusAction) -> Result<(), WalletSyncError> {
        match action {
            ConsensusAction::None => Ok(()),
            ConsensusAction::Invalidate => {
                self.synchronizer.connection_lost();
                Ok(())
            }
            ConsensusAction::Resync => {
                self.synchronizer.invalidate();
                self.run_sync(false).await
            }
        }
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for UtxoSyncHandler {
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), WalletSyncError> {
        match event {
            SyncEvent::AddressSetChanged { external, internal } => {
                info!(
                    "Tracking {} external and {} internal addresses",
                    external.len(),
                    internal.len()
                );
                self.synchronizer
                    .reset_addresses(external.clone(), internal.clone());
                if self.consensus.is_established() {
                    self.run_sync(false).await?;
                }
            }
            SyncEvent::ConsensusChanged(state) => {
                let action = self.consensus.on_consensus(*state);
                self.apply(action).await?;
            }
            SyncEvent::VisibilityChanged { visible } => {
                let action = self
                    .consensus
                    .on_visibility(*visible, tokio::time::Instant::now());
                self.apply(action).await?;
            }
            SyncEvent::HeadChanged(head) => {
                let promoted = self.synchronizer.promote(head.height);
                if !promoted.is_empty() {
                    let batch: Vec<Transaction> = promoted
                        .iter()
                        .filter_map(|key| self.synchronizer.store().get(key).cloned())
                        .collect();
                    self.persistence.save_transactions(&self.scope, &batch).await?;
                }
            }
            SyncEvent::TransactionReceived(transaction) if transaction.utxo.is_some() => {
                if self.synchronizer.apply_live(transaction.clone()).await? {
                    self.persistence
                        .save_transactions(&self.scope, std::slice::from_ref(transaction))
                        .await?;
                }
            }
            SyncEvent::SyncRequested => {
                if self.consensus.state() == ConsensusState::Established {
                    self.run_sync(true).await?;
                } else {
                    debug!("Sync requested before consensus, waiting for it");
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "UtxoSyncHandler"
    }
}

/// Event handler scanning every configured token for the tracked EVM owner.
pub struct EvmSyncHandler {
    scanners: Vec<EvmScanner>,
    owner: Option<String>,
    store: TransactionStore,
    persistence: Arc<StatePersistenceService>,
    scope: String,
}

impl EvmSyncHandler {
    pub fn new(
        account_id: &str,
        scanners: Vec<EvmScanner>,
        store: TransactionStore,
        persistence: Arc<StatePersistenceService>,
    ) -> Self {
        Self {
            scanners,
            owner: None,
            store,
            persistence,
            scope: StatePersistenceService::evm_scope(account_id),
        }
    }

    pub fn store(&self) -> &TransactionStore {
        &self.store
    }

    /// Scan every token; a failing token does not stop the others.
    async fn scan_all(&mut self) -> Result<(), WalletSyncError> {
        let Some(owner) = self.owner.clone() else {
            debug!("No EVM address tracked, skipping scan");
            return Ok(());
        };

        let mut first_error = None;
        for scanner in &mut self.scanners {
            let result = scan_token(
                scanner,
                &owner,
                &mut self.store,
                &self.persistence,
                &self.scope,
            )
            .await;
            if let Err(e) = result {
                warn!("Scan of {} failed: {}", scanner.token(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

async fn scan_token(
    scanner: &mut EvmScanner,
    owner: &str,
    store: &mut TransactionStore,
    persistence: &StatePersistenceService,
    scope: &str,
) -> Result<(), WalletSyncError> {
    // checkpoints are keyed by the lowercase form
    let owner = abi::parse_address(owner)
        .map(|address| abi::format_address(&address))
        .map_err(ProviderError::from)?;
    let last_confirmed = persistence
        .last_confirmed_height(scanner.token(), &owner)
        .await?;
    let known = store.final_hashes_for_token(scanner.token());
    let mut cursor = scanner.init_cursor(&owner, last_confirmed, known).await?;

    let mut sink = PersistingSink {
        store,
        persistence,
        scope,
    };
    let checkpoint = scanner.scan(&mut cursor, &mut sink).await?;
    persistence.save_checkpoint(&checkpoint).await
}

#[async_trait::async_trait]
impl SyncEventHandler for EvmSyncHandler {
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), WalletSyncError> {
        match event {
            SyncEvent::EvmAddressChanged { address } => {
                if *address == self.owner {
                    return Ok(());
                }
                info!("Tracking EVM address {:?}", address);
                self.owner = address.clone();
                self.scan_all().await?;
            }
            SyncEvent::SyncRequested => self.scan_all().await?,
            _ => {}
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "EvmSyncHandler"
    }
}

/// Traces every event.
pub struct LoggingHandler;

#[async_trait::async_trait]
impl SyncEventHandler for LoggingHandler {
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), WalletSyncError> {
        match event {
            SyncEvent::ConsensusChanged(state) => info!("Consensus is now {:?}", state),
            SyncEvent::HeadChanged(head) => debug!("New head at height {}", head.height),
            SyncEvent::TransactionReceived(transaction) => {
                debug!("Live transaction {}", transaction.hash)
            }
            other => debug!("Event {}", other.kind()),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LoggingHandler"
    }
}
