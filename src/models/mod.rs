//! Data models for the data-access layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod query;
pub mod transaction;

// Re-export commonly used types
pub use query::{ExecResult, Query, QueryParam};
pub use transaction::{DatabaseType, IsolationLevel, TransactionState, TxOptions};
