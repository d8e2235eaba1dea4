//! Chain history synchronization and balance reconciliation.
//!
//! Keeps a wallet account's transaction history in step with a UTXO chain indexer and with EVM
//! token ledgers, and picks gasless relays for outgoing meta-transactions.

pub mod config;
pub mod provider;
pub mod relay;
pub mod transaction;
pub mod utils;
pub mod wallet;
