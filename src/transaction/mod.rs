/// Spend plan builder for outgoing UTXO-chain transactions
pub mod builder;
/// Weight-based fee estimation
pub mod fee;
/// Coin selection
pub mod selector;

pub use builder::{PlannedOutput, SpendPlan, SpendPlanBuilder, TransactionError};
pub use fee::{FeeWeights, estimate_fee};
pub use selector::{Selection, SelectionParams, select_outputs};
