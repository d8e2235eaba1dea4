pub mod directory;
pub mod store;
pub mod sync;
pub mod types;

pub use directory::AddressDirectory;
pub use store::{MergeOutcome, TransactionStore};
pub use types::*;
