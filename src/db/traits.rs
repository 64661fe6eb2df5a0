//! Narrow capability traits.
//!
//! Each capability is its own trait so that a test double only implements
//! the part under test: a fake `Transactor`/`Committer` pair is enough to
//! drive the transaction manager without a database.

use crate::context::Context;
use crate::db::scan::{Row, Rows};
use crate::error::{BoxError, DbResult};
use crate::models::{ExecResult, Query, QueryParam, TxOptions};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;

pub trait Pinger {
    /// Verify that the database is reachable.
    fn ping(&self, ctx: &Context) -> impl Future<Output = DbResult<()>> + Send;
}

/// Terminal actions of a begun transaction.
///
/// Exactly one of `commit` or `rollback` succeeds in reaching the database
/// per transaction; any later call fails with `InvalidTransactionState`.
pub trait Committer: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// False once commit or rollback has been attempted.
    fn is_active(&self) -> bool;

    fn commit(&self, ctx: &Context) -> impl Future<Output = DbResult<()>> + Send;

    fn rollback(&self, ctx: &Context) -> impl Future<Output = DbResult<()>> + Send;
}

/// Starts transactions.
pub trait Transactor: Send + Sync {
    type Tx: Committer;

    fn begin_tx(
        &self,
        ctx: &Context,
        opts: TxOptions,
    ) -> impl Future<Output = DbResult<Arc<Self::Tx>>> + Send;
}

/// Positional statement execution.
pub trait QueryExecutor {
    fn exec(
        &self,
        ctx: &Context,
        query: &Query,
        args: &[QueryParam],
    ) -> impl Future<Output = DbResult<ExecResult>> + Send;

    fn query(
        &self,
        ctx: &Context,
        query: &Query,
        args: &[QueryParam],
    ) -> impl Future<Output = DbResult<Rows>> + Send;

    /// Errors are deferred to the returned [`Row`].
    fn query_row(
        &self,
        ctx: &Context,
        query: &Query,
        args: &[QueryParam],
    ) -> impl Future<Output = Row> + Send;
}

/// Statement execution with rows mapped onto caller types.
pub trait NamedExecutor {
    fn scan_one<T: DeserializeOwned + Send>(
        &self,
        ctx: &Context,
        query: &Query,
        args: &[QueryParam],
    ) -> impl Future<Output = DbResult<T>> + Send;

    fn scan_all<T: DeserializeOwned + Send>(
        &self,
        ctx: &Context,
        query: &Query,
        args: &[QueryParam],
    ) -> impl Future<Output = DbResult<Vec<T>>> + Send;
}

/// Runs units of work.
pub trait TxManager: Send + Sync {
    /// Run `body` in a transaction with the given options, or inside the
    /// transaction already bound to `ctx`.
    fn transaction<F, Fut, R, E>(
        &self,
        ctx: &Context,
        opts: TxOptions,
        body: F,
    ) -> impl Future<Output = DbResult<R>> + Send
    where
        F: FnOnce(Context) -> Fut + Send,
        Fut: Future<Output = Result<R, E>> + Send,
        R: Send,
        E: Into<BoxError> + Send;

    /// Shorthand for a read committed unit of work.
    fn read_committed<F, Fut, R, E>(
        &self,
        ctx: &Context,
        body: F,
    ) -> impl Future<Output = DbResult<R>> + Send
    where
        F: FnOnce(Context) -> Fut + Send,
        Fut: Future<Output = Result<R, E>> + Send,
        R: Send,
        E: Into<BoxError> + Send;
}

/// A connected database client.
pub trait Client: Send + Sync {
    type Db: QueryExecutor + NamedExecutor + Pinger + Transactor;

    fn db(&self) -> &Self::Db;

    fn close(&self) -> impl Future<Output = DbResult<()>> + Send;
}
