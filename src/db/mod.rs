//! Database access layer.
//!
//! This module provides:
//! - Connection pool management
//! - Statement routing between the pool and the context's transaction
//! - The query execution facade and row scanning
//! - Transaction handles and the unit-of-work manager
//! - Statement rendering for diagnostic logs
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod client;
pub mod executor;
pub mod manager;
pub(crate) mod params;
pub mod pool;
pub mod prettier;
pub mod scan;
pub mod traits;
pub mod transaction;
pub mod types;

pub use client::DbClient;
pub use executor::{Database, Route};
pub use manager::TransactionManager;
pub use pool::DbPool;
pub use prettier::{Placeholder, pretty};
pub use scan::{Row, Rows, scan_all, scan_one};
pub use traits::{Client, Committer, NamedExecutor, Pinger, QueryExecutor, Transactor, TxManager};
pub use transaction::{DbTransaction, TxHandle, current_transaction_id};
pub use types::Record;
