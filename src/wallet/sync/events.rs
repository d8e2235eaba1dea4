//! Event system for wallet synchronization.
//!
//! This module defines the core event types, event handler traits, and the event dispatcher used
//! by the per-account orchestrator. Provider watchers, live listeners and callers all emit
//! [`SyncEvent`]s into the orchestrator's queue; registered handlers react to them one at a time,
//! so per-account state is only ever touched by a single writer.

use crate::provider::{ConsensusState, HeadInfo};
use crate::wallet::{Transaction, WalletSyncError};

/// Events that drive wallet synchronization
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The tracked UTXO address set was replaced
    AddressSetChanged {
        external: Vec<String>,
        internal: Vec<String>,
    },
    /// The tracked EVM owner address changed or was removed
    EvmAddressChanged { address: Option<String> },
    /// The UTXO provider's consensus state changed
    ConsensusChanged(ConsensusState),
    /// A new chain head was announced
    HeadChanged(HeadInfo),
    /// The front-end became visible or hidden
    VisibilityChanged { visible: bool },
    /// A live listener pushed a transaction
    TransactionReceived(Transaction),
    /// Full sync requested by the caller
    SyncRequested,
}

impl SyncEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::AddressSetChanged { .. } => "address_set_changed",
            SyncEvent::EvmAddressChanged { .. } => "evm_address_changed",
            SyncEvent::ConsensusChanged(_) => "consensus_changed",
            SyncEvent::HeadChanged(_) => "head_changed",
            SyncEvent::VisibilityChanged { .. } => "visibility_changed",
            SyncEvent::TransactionReceived(_) => "transaction_received",
            SyncEvent::SyncRequested => "sync_requested",
        }
    }
}

/// Trait for handling sync events.
///
/// Implementors receive all sync events and can perform side effects or state updates.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
    /// Handle a sync event.
    ///
    /// This method is called for every event dispatched by the orchestrator.
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), WalletSyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
///
/// The dispatcher allows multiple handlers to be registered and ensures all are called for each event.
/// This enables logging, state updates, and persistence to be handled independently.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Box<dyn SyncEventHandler>>,
}

impl EventDispatcher {
    /// Create a new, empty event dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new event handler.
    ///
    /// Handlers are called in the order they are registered.
    pub fn register_handler(&mut self, handler: Box<dyn SyncEventHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Dispatch an event to all registered handlers.
    ///
    /// Recoverable errors are logged and do not stop other handlers from running. The first fatal
    /// error is returned after every handler has seen the event.
    pub async fn dispatch(&mut self, event: &SyncEvent) -> Result<(), WalletSyncError> {
        let mut fatal = None;
        for handler in &mut self.handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::error!(
                    "Handler {} failed to process {}: {}",
                    handler.name(),
                    event.kind(),
                    e
                );
                if e.is_fatal() && fatal.is_none() {
                    fatal = Some(e);
                }
            }
        }
        fatal.map_or(Ok(()), Err)
    }
}
