mod graph;
mod lock_manager;
mod transaction;

pub use graph::WaitsForGraph;
pub use lock_manager::{LockManager, LockMode, Resource};
pub use transaction::{Transaction, TransactionManager};
