//! Statement routing and the query execution facade.
//!
//! [`Database`] is the single entry point application code calls. Every
//! statement is logged, then routed: to the transaction bound to the
//! caller's context when there is one, otherwise to the pool. Callers never
//! know which one served them.
//!
//! # Architecture
//!
//! The per-backend statement code lives in submodules:
//! - `postgres`: PostgreSQL execution and row decoding
//! - `sqlite`: SQLite execution and row decoding
//!
//! Both are generic over the sqlx executor, so the same code runs against a
//! pool and against a checked-out transaction.

use crate::context::{Context, lookup_transaction};
use crate::db::pool::DbPool;
use crate::db::prettier::{Placeholder, pretty};
use crate::db::scan::{self, Row, Rows};
use crate::db::traits::{Committer, NamedExecutor, Pinger, QueryExecutor, Transactor};
use crate::db::transaction::TxHandle;
use crate::db::types::RowToRecord;
use crate::error::{DbError, DbResult, Phase};
use crate::models::{DatabaseType, ExecResult, Query, QueryParam, TxOptions};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{Level, debug};

/// Where a statement runs.
#[derive(Debug)]
pub enum Route<'a> {
    Pool(&'a DbPool),
    Transaction(Arc<TxHandle>),
}

/// Router and query execution facade over one pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn db_type(&self) -> DatabaseType {
        self.pool.db_type()
    }

    /// Pick the executor for a statement issued under `ctx`.
    ///
    /// A finished transaction still bound to the context is an error rather
    /// than a silent fallback to the pool.
    pub fn route(&self, ctx: &Context) -> DbResult<Route<'_>> {
        match lookup_transaction::<TxHandle>(ctx) {
            Some(tx) if tx.is_active() => Ok(Route::Transaction(tx)),
            Some(tx) => Err(DbError::invalid_transaction_state(
                format!("statement issued on a transaction that is already {}", tx.state()),
                tx.id(),
            )),
            None => Ok(Route::Pool(&self.pool)),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn placeholder(&self) -> Placeholder {
        match self.db_type() {
            DatabaseType::PostgreSQL => Placeholder::Dollar,
            DatabaseType::SQLite => Placeholder::Question,
        }
    }

    /// The statement as it is written to the debug log.
    pub fn render(&self, query: &Query, args: &[QueryParam]) -> String {
        pretty(&query.raw, self.placeholder(), args)
    }

    fn log_statement(&self, query: &Query, args: &[QueryParam]) {
        if tracing::enabled!(Level::DEBUG) {
            debug!(
                sql = %query.name,
                query = %self.render(query, args),
                "Executing statement"
            );
        }
    }

    async fn execute_routed(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[QueryParam],
    ) -> DbResult<ExecResult> {
        match self.route(ctx)? {
            Route::Pool(pool) => ctx.run(pool.execute(sql, args)).await,
            Route::Transaction(tx) => ctx.run(tx.execute(sql, args)).await,
        }
    }

    async fn fetch_routed(&self, ctx: &Context, sql: &str, args: &[QueryParam]) -> DbResult<Rows> {
        match self.route(ctx)? {
            Route::Pool(pool) => ctx.run(pool.fetch_all(sql, args)).await,
            Route::Transaction(tx) => ctx.run(tx.fetch_all(sql, args)).await,
        }
    }
}

impl Pinger for Database {
    async fn ping(&self, ctx: &Context) -> DbResult<()> {
        ctx.run(self.pool.ping()).await.map_err(DbError::ping)
    }
}

impl Transactor for Database {
    type Tx = TxHandle;

    async fn begin_tx(&self, ctx: &Context, opts: TxOptions) -> DbResult<Arc<TxHandle>> {
        let transaction = ctx.run(self.pool.begin(opts.isolation_level)).await?;
        let handle = TxHandle::new(transaction, opts.isolation_level);
        debug!(
            transaction_id = %handle.id(),
            isolation = %opts.isolation_level,
            db_type = %handle.db_type(),
            "Transaction started"
        );
        Ok(Arc::new(handle))
    }
}

impl QueryExecutor for Database {
    async fn exec(&self, ctx: &Context, query: &Query, args: &[QueryParam]) -> DbResult<ExecResult> {
        self.log_statement(query, args);
        self.execute_routed(ctx, &query.raw, args)
            .await
            .map_err(|e| DbError::statement(&query.name, Phase::Exec, e))
    }

    async fn query(&self, ctx: &Context, query: &Query, args: &[QueryParam]) -> DbResult<Rows> {
        self.log_statement(query, args);
        self.fetch_routed(ctx, &query.raw, args)
            .await
            .map_err(|e| DbError::statement(&query.name, Phase::Query, e))
    }

    async fn query_row(&self, ctx: &Context, query: &Query, args: &[QueryParam]) -> Row {
        self.log_statement(query, args);
        let result = self
            .fetch_routed(ctx, &query.raw, args)
            .await
            .map_err(|e| DbError::statement(&query.name, Phase::QueryRow, e));
        Row::new(&query.name, result)
    }
}

impl NamedExecutor for Database {
    async fn scan_one<T: DeserializeOwned + Send>(
        &self,
        ctx: &Context,
        query: &Query,
        args: &[QueryParam],
    ) -> DbResult<T> {
        let rows = self.query(ctx, query, args).await?;
        scan::scan_one(&query.name, rows)
    }

    async fn scan_all<T: DeserializeOwned + Send>(
        &self,
        ctx: &Context,
        query: &Query,
        args: &[QueryParam],
    ) -> DbResult<Vec<T>> {
        let rows = self.query(ctx, query, args).await?;
        scan::scan_all(&query.name, rows)
    }
}

// =============================================================================
// Common Helper Functions
// =============================================================================

fn into_rows<R: RowToRecord>(rows: Vec<R>) -> Rows {
    let columns = rows.first().map(|r| r.column_names()).unwrap_or_default();
    let records = rows.iter().map(|r| r.to_record()).collect();
    Rows::from_records(columns, records)
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// The code structure is intentionally parallel to make differences obvious.

pub(crate) mod postgres {
    use super::*;
    use crate::db::params::postgres_query;
    use sqlx::Postgres;

    pub async fn execute<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
    ) -> DbResult<ExecResult>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        // Without parameters run the raw text, so statements that cannot be prepared still work
        let result = if params.is_empty() {
            executor.execute(sql).await
        } else {
            postgres_query(sql, params).execute(executor).await
        };

        let result = result?;
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: None,
        })
    }

    pub async fn fetch_all<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
    ) -> DbResult<Rows>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let rows = if params.is_empty() {
            executor.fetch_all(sql).await
        } else {
            postgres_query(sql, params).fetch_all(executor).await
        };

        Ok(into_rows(rows?))
    }
}

pub(crate) mod sqlite {
    use super::*;
    use crate::db::params::sqlite_query;
    use sqlx::Sqlite;

    pub async fn execute<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
    ) -> DbResult<ExecResult>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        // Without parameters run the raw text, so multi-statement scripts work
        let result = if params.is_empty() {
            executor.execute(sql).await
        } else {
            sqlite_query(sql, params).execute(executor).await
        };

        let result = result?;
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: Some(result.last_insert_rowid()),
        })
    }

    pub async fn fetch_all<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
    ) -> DbResult<Rows>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let rows = if params.is_empty() {
            executor.fetch_all(sql).await
        } else {
            sqlite_query(sql, params).fetch_all(executor).await
        };

        Ok(into_rows(rows?))
    }
}
