//! Transaction handles.
//!
//! A [`TxHandle`] owns one begun transaction on one pooled connection. The
//! transaction sits in a slot that statements check out for the duration of
//! a round trip and check back in afterwards; no lock is held while a
//! statement is awaiting the database. Commit and rollback consume the
//! transaction, so after either one the handle is terminal.

use crate::context::{Context, lookup_transaction};
use crate::db::executor::{postgres, sqlite};
use crate::db::scan::Rows;
use crate::db::traits::Committer;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, ExecResult, IsolationLevel, QueryParam, TransactionState};
use sqlx::{Postgres, Sqlite, Transaction};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Database-specific transaction wrapper.
pub enum DbTransaction {
    /// PostgreSQL transaction
    Postgres(Transaction<'static, Postgres>),
    /// SQLite transaction
    SQLite(Transaction<'static, Sqlite>),
}

impl DbTransaction {
    /// Get the database type for this transaction.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbTransaction::Postgres(_) => DatabaseType::PostgreSQL,
            DbTransaction::SQLite(_) => DatabaseType::SQLite,
        }
    }

    pub async fn commit(self) -> DbResult<()> {
        impl_db_dispatch!(DbTransaction, self, {
            Postgres(tx) => tx.commit().await.map_err(DbError::from),
            SQLite(tx) => tx.commit().await.map_err(DbError::from),
        })
    }

    pub async fn rollback(self) -> DbResult<()> {
        impl_db_dispatch!(DbTransaction, self, {
            Postgres(tx) => tx.rollback().await.map_err(DbError::from),
            SQLite(tx) => tx.rollback().await.map_err(DbError::from),
        })
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ExecResult> {
        impl_db_dispatch!(DbTransaction, self, {
            Postgres(tx) => postgres::execute(&mut **tx, sql, params).await,
            SQLite(tx) => sqlite::execute(&mut **tx, sql, params).await,
        })
    }

    async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Rows> {
        impl_db_dispatch!(DbTransaction, self, {
            Postgres(tx) => postgres::fetch_all(&mut **tx, sql, params).await,
            SQLite(tx) => sqlite::fetch_all(&mut **tx, sql, params).await,
        })
    }
}

enum Slot {
    Idle(DbTransaction),
    Busy,
    Done(TransactionState),
}

/// One active transaction, reachable only through the context it is bound to.
pub struct TxHandle {
    id: String,
    isolation_level: IsolationLevel,
    db_type: DatabaseType,
    slot: Mutex<Slot>,
}

impl std::fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxHandle")
            .field("id", &self.id)
            .field("isolation_level", &self.isolation_level)
            .field("db_type", &self.db_type)
            .field("state", &self.state())
            .finish()
    }
}

impl TxHandle {
    pub fn new(transaction: DbTransaction, isolation_level: IsolationLevel) -> Self {
        Self {
            id: generate_transaction_id(),
            isolation_level,
            db_type: transaction.db_type(),
            slot: Mutex::new(Slot::Idle(transaction)),
        }
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    /// A statement in flight still counts as active.
    pub fn state(&self) -> TransactionState {
        match &*self.lock() {
            Slot::Idle(_) | Slot::Busy => TransactionState::Active,
            Slot::Done(state) => *state,
        }
    }

    /// Execute a statement on this transaction's connection.
    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<ExecResult> {
        let mut checkout = self.checkout()?;
        checkout.transaction()?.execute(sql, params).await
    }

    /// Run a query on this transaction's connection and materialise its rows.
    pub async fn fetch_all(&self, sql: &str, params: &[QueryParam]) -> DbResult<Rows> {
        let mut checkout = self.checkout()?;
        checkout.transaction()?.fetch_all(sql, params).await
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // The slot is only swapped under the lock, so a poisoned guard still holds a valid state
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checkout(&self) -> DbResult<Checkout<'_>> {
        let mut slot = self.lock();
        match std::mem::replace(&mut *slot, Slot::Busy) {
            Slot::Idle(transaction) => Ok(Checkout {
                handle: self,
                transaction: Some(transaction),
            }),
            Slot::Busy => Err(DbError::invalid_transaction_state(
                "another statement is already running on this transaction",
                &self.id,
            )),
            Slot::Done(state) => {
                *slot = Slot::Done(state);
                Err(self.finished_error(state))
            }
        }
    }

    /// Take the transaction for a terminal action, leaving the handle done.
    fn finish(&self, state: TransactionState) -> DbResult<DbTransaction> {
        let mut slot = self.lock();
        match std::mem::replace(&mut *slot, Slot::Done(state)) {
            Slot::Idle(transaction) => Ok(transaction),
            Slot::Busy => {
                *slot = Slot::Busy;
                Err(DbError::invalid_transaction_state(
                    format!("cannot end transaction ({state}) while a statement is running"),
                    &self.id,
                ))
            }
            Slot::Done(previous) => {
                *slot = Slot::Done(previous);
                Err(self.finished_error(previous))
            }
        }
    }

    fn finished_error(&self, state: TransactionState) -> DbError {
        DbError::invalid_transaction_state(format!("transaction already {state}"), &self.id)
    }
}

impl Committer for TxHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_active(&self) -> bool {
        self.state().is_active()
    }

    async fn commit(&self, ctx: &Context) -> DbResult<()> {
        let transaction = self.finish(TransactionState::Committed)?;
        ctx.run(transaction.commit()).await?;
        debug!(transaction_id = %self.id, "Transaction committed");
        Ok(())
    }

    async fn rollback(&self, ctx: &Context) -> DbResult<()> {
        let transaction = self.finish(TransactionState::RolledBack)?;
        ctx.run(transaction.rollback()).await?;
        debug!(transaction_id = %self.id, "Transaction rolled back");
        Ok(())
    }
}

/// A transaction taken out of its handle for one statement.
///
/// Dropping the checkout puts the transaction back, including when the
/// statement future is cancelled mid-flight.
struct Checkout<'h> {
    handle: &'h TxHandle,
    transaction: Option<DbTransaction>,
}

impl Checkout<'_> {
    fn transaction(&mut self) -> DbResult<&mut DbTransaction> {
        self.transaction
            .as_mut()
            .ok_or_else(|| DbError::internal("transaction checkout is empty"))
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        if let Some(transaction) = self.transaction.take() {
            let mut slot = self.handle.lock();
            if matches!(*slot, Slot::Busy) {
                *slot = Slot::Idle(transaction);
            }
        }
    }
}

/// Generate a unique transaction ID.
pub(crate) fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// Id of the transaction bound to `ctx`, if any.
pub fn current_transaction_id(ctx: &Context) -> Option<String> {
    lookup_transaction::<TxHandle>(ctx).map(|tx| tx.id.clone())
}
