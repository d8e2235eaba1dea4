//!
//! Formatting helpers shared by the sync services.
//!
/// Amount formatting
pub mod index;

pub use index::format_token_amount;

/// Fractional digits of the UTXO chain's base unit.
pub const UTXO_DECIMALS: u32 = 8;
