//! Wallet Synchronization Module
//!
//! This module provides all the core logic and services for synchronizing wallet history with a
//! UTXO chain and with EVM token ledgers. It is composed of several submodules, each responsible
//! for a specific aspect of the sync process:
//!
//! - `orchestrator`: Per-account actor that owns sync state and dispatches events to handlers.
//! - `events`: Event types, the handler trait and the dispatcher.
//! - `consensus`: Consensus and visibility transitions that invalidate or resync a session.
//! - `discovery`: Gap-limit scanning and derivation-continuity checks.
//! - `utxo_sync`: Per-address history fetching for the UTXO chain.
//! - `log_classifier`: Decoding and classification of EVM Transfer logs.
//! - `evm_scanner`: Backward block-range scans reconciled against on-chain counters.
//! - `progress_tracker`: In-flight fetch accounting and session statistics.
//! - `repositories` and `state_persistence`: Saving history and scan checkpoints.

/// Consensus-driven invalidation
pub mod consensus;
/// Gap-limit address discovery
pub mod discovery;
/// Event system for decoupled communication during sync
pub mod events;
/// Backward EVM log scanning
pub mod evm_scanner;
/// Transfer log decoding and classification
pub mod log_classifier;
/// Main coordinator for the wallet sync process
pub mod orchestrator;
/// Tracks synchronization progress and statistics
pub mod progress_tracker;
/// Persistence repositories
pub mod repositories;
/// Persistence service used by the handlers
pub mod state_persistence;
/// UTXO-chain history synchronizer
pub mod utxo_sync;

pub use orchestrator::*;
