//! Platform database library.
//!
//! A client-side data-access layer over sqlx (PostgreSQL, SQLite). Statements
//! run on the pool or, when the caller's [`Context`] carries one, on the
//! active transaction; [`TransactionManager`] owns transaction lifecycles.
//!
//! ```ignore
//! let ctx = Context::background();
//! let client = DbClient::connect(&ctx, &DatabaseConfig::parse(url)?).await?;
//! let insert = Query::new("insert_note", "INSERT INTO notes (body) VALUES ($1)");
//!
//! client
//!     .tx_manager()
//!     .read_committed(&ctx, |ctx| async move {
//!         client.db().exec(&ctx, &insert, &params!["hello"]).await?;
//!         Ok::<_, DbError>(())
//!     })
//!     .await?;
//! ```

pub mod closer;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;

pub use closer::Closer;
pub use config::{Config, DatabaseConfig};
pub use context::Context;
pub use db::{
    Client, Database, DbClient, NamedExecutor, Pinger, QueryExecutor, TransactionManager,
    Transactor, TxManager,
};
pub use error::{DbError, DbResult};
pub use models::{ExecResult, IsolationLevel, Query, QueryParam, TxOptions};
