pub mod concurrency;
pub mod config;
pub mod database;
pub mod error;
pub mod index;
pub mod join;
pub mod logging;
pub mod pager;
pub mod recovery;

pub use crate::concurrency::{LockManager, LockMode, Resource, TransactionManager};
pub use crate::config::Config;
pub use crate::database::Database;
pub use crate::error::{Result, TarnError};
pub use crate::index::{BTreeIndex, Entry, HashIndex, Index, IndexKind};
pub use crate::recovery::{prime, RecoveryManager};
