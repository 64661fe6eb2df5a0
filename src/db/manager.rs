//! Units of work.
//!
//! [`TransactionManager`] begins a transaction, binds it to a derived
//! context, runs the caller's body with that context and then resolves the
//! transaction exactly once: commit on success, rollback on error, panic or
//! cancellation. A call made while a transaction is already bound to the
//! context joins it instead of starting another one.

use crate::context::{Context, bind_transaction, lookup_transaction};
use crate::db::traits::{Committer, Transactor, TxManager};
use crate::error::{BoxError, DbError, DbResult, error_chain};
use crate::models::TxOptions;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Upper bound for a rollback issued after a failed, panicked or cancelled body.
pub const DEFAULT_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TransactionManager<T> {
    transactor: T,
    rollback_timeout: Duration,
}

impl<T: Transactor> TransactionManager<T> {
    pub fn new(transactor: T) -> Self {
        Self {
            transactor,
            rollback_timeout: DEFAULT_ROLLBACK_TIMEOUT,
        }
    }

    /// Bound the rollback round trip.
    ///
    /// The rollback ignores the caller's cancellation and deadline, so this
    /// is the only limit on how long a failed unit of work keeps the caller
    /// waiting. A rollback that runs out of time is reported as
    /// `RollbackFailed`; the driver still discards the transaction when the
    /// connection is released.
    pub fn with_rollback_timeout(mut self, timeout: Duration) -> Self {
        self.rollback_timeout = timeout;
        self
    }

    pub fn transactor(&self) -> &T {
        &self.transactor
    }

    /// Run `body` inside a transaction.
    ///
    /// When `ctx` already carries a live transaction the body runs on it
    /// directly: nothing is begun, committed or rolled back here, and the
    /// outer transaction's isolation level applies.
    pub async fn transaction<F, Fut, R, E>(
        &self,
        ctx: &Context,
        opts: TxOptions,
        body: F,
    ) -> DbResult<R>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Into<BoxError>,
    {
        if let Some(outer) = lookup_transaction::<T::Tx>(ctx) {
            if !outer.is_active() {
                return Err(DbError::invalid_transaction_state(
                    "unit of work started on a finished transaction",
                    outer.id(),
                ));
            }
            debug!(
                transaction_id = %outer.id(),
                requested_isolation = %opts.isolation_level,
                "Joining outer transaction; outer isolation level applies"
            );
            return body(ctx.clone()).await.map_err(propagate);
        }

        let tx = self
            .transactor
            .begin_tx(ctx, opts)
            .await
            .map_err(DbError::begin)?;
        let bound = bind_transaction(ctx, tx.clone());

        let unit = AssertUnwindSafe(async move { body(bound).await }).catch_unwind();
        let outcome = tokio::select! {
            biased;
            finished = unit => match finished {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(DbError::body(err)),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(
                        transaction_id = %tx.id(),
                        panic = %message,
                        "Panic inside transaction"
                    );
                    Err(DbError::panic_recovered(message))
                }
            },
            err = ctx.done() => Err(DbError::body(err)),
        };

        match outcome {
            Ok(value) => {
                tx.commit(ctx).await.map_err(DbError::commit)?;
                Ok(value)
            }
            Err(cause) => {
                warn!(
                    transaction_id = %tx.id(),
                    error = %error_chain(&cause),
                    "Rolling back transaction"
                );
                // Rollback must reach the database even when the caller's context is done
                let rollback_ctx = ctx.without_cancel().with_timeout(self.rollback_timeout);
                match tx.rollback(&rollback_ctx).await {
                    Ok(()) => Err(cause),
                    Err(rollback) => Err(DbError::rollback(cause, rollback)),
                }
            }
        }
    }

    /// Run `body` inside a read committed transaction.
    pub async fn read_committed<F, Fut, R, E>(&self, ctx: &Context, body: F) -> DbResult<R>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Into<BoxError>,
    {
        self.transaction(ctx, TxOptions::read_committed(), body)
            .await
    }
}

impl<T: Transactor> TxManager for TransactionManager<T> {
    async fn transaction<F, Fut, R, E>(&self, ctx: &Context, opts: TxOptions, body: F) -> DbResult<R>
    where
        F: FnOnce(Context) -> Fut + Send,
        Fut: Future<Output = Result<R, E>> + Send,
        R: Send,
        E: Into<BoxError> + Send,
    {
        TransactionManager::transaction(self, ctx, opts, body).await
    }

    async fn read_committed<F, Fut, R, E>(&self, ctx: &Context, body: F) -> DbResult<R>
    where
        F: FnOnce(Context) -> Fut + Send,
        Fut: Future<Output = Result<R, E>> + Send,
        R: Send,
        E: Into<BoxError> + Send,
    {
        TransactionManager::read_committed(self, ctx, body).await
    }
}

/// Errors from a joined unit of work pass through unchanged when they are
/// already `DbError`s.
fn propagate<E: Into<BoxError>>(err: E) -> DbError {
    match err.into().downcast::<DbError>() {
        Ok(db_err) => *db_err,
        Err(other) => DbError::body(other),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IsolationLevel;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Counters {
        begins: AtomicUsize,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
        isolation: Mutex<Vec<IsolationLevel>>,
    }

    #[derive(Debug)]
    struct FakeTx {
        id: String,
        done: AtomicBool,
        fail_commit: bool,
        fail_rollback: bool,
        rollback_delay: Option<Duration>,
        counters: Arc<Counters>,
    }

    impl Committer for FakeTx {
        fn id(&self) -> &str {
            &self.id
        }

        fn is_active(&self) -> bool {
            !self.done.load(Ordering::SeqCst)
        }

        async fn commit(&self, _ctx: &Context) -> DbResult<()> {
            if self.done.swap(true, Ordering::SeqCst) {
                return Err(DbError::invalid_transaction_state("already done", &self.id));
            }
            self.counters.commits.fetch_add(1, Ordering::SeqCst);
            if self.fail_commit {
                return Err(DbError::database("serialization failure", Some("40001".into()), "retry"));
            }
            Ok(())
        }

        async fn rollback(&self, ctx: &Context) -> DbResult<()> {
            if self.done.swap(true, Ordering::SeqCst) {
                return Err(DbError::invalid_transaction_state("already done", &self.id));
            }
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            if let Some(delay) = self.rollback_delay {
                ctx.run(async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
            }
            self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
            if self.fail_rollback {
                return Err(DbError::connect("broken pipe", "reconnect"));
            }
            Ok(())
        }
    }

    #[derive(Debug, Default, Clone)]
    struct FakeTransactor {
        counters: Arc<Counters>,
        fail_begin: bool,
        fail_commit: bool,
        fail_rollback: bool,
        rollback_delay: Option<Duration>,
    }

    impl Transactor for FakeTransactor {
        type Tx = FakeTx;

        async fn begin_tx(&self, _ctx: &Context, opts: TxOptions) -> DbResult<Arc<FakeTx>> {
            if self.fail_begin {
                return Err(DbError::connect("connection refused", "start the server"));
            }
            let n = self.counters.begins.fetch_add(1, Ordering::SeqCst);
            self.counters
                .isolation
                .lock()
                .unwrap()
                .push(opts.isolation_level);
            Ok(Arc::new(FakeTx {
                id: format!("fake_{n}"),
                done: AtomicBool::new(false),
                fail_commit: self.fail_commit,
                fail_rollback: self.fail_rollback,
                rollback_delay: self.rollback_delay,
                counters: self.counters.clone(),
            }))
        }
    }

    fn manager(transactor: FakeTransactor) -> (TransactionManager<FakeTransactor>, Arc<Counters>) {
        let counters = transactor.counters.clone();
        (TransactionManager::new(transactor), counters)
    }

    fn counts(c: &Counters) -> (usize, usize, usize) {
        (
            c.begins.load(Ordering::SeqCst),
            c.commits.load(Ordering::SeqCst),
            c.rollbacks.load(Ordering::SeqCst),
        )
    }

    fn bound_id(ctx: &Context) -> Option<String> {
        lookup_transaction::<FakeTx>(ctx).map(|tx| tx.id.clone())
    }

    #[tokio::test]
    async fn test_success_commits_once() {
        let (mgr, counters) = manager(FakeTransactor::default());
        let value = mgr
            .read_committed(&Context::background(), |ctx| async move {
                assert!(bound_id(&ctx).is_some());
                Ok::<_, DbError>(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(counts(&counters), (1, 1, 0));
        assert_eq!(
            *counters.isolation.lock().unwrap(),
            vec![IsolationLevel::ReadCommitted]
        );
    }

    #[tokio::test]
    async fn test_body_error_rolls_back_once() {
        let (mgr, counters) = manager(FakeTransactor::default());
        let err = mgr
            .read_committed(&Context::background(), |_ctx| async move {
                Err::<(), _>(DbError::not_found("get_user"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::BodyFailed { .. }));
        assert!(matches!(err.root_cause(), DbError::NotFound { .. }));
        assert_eq!(counts(&counters), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_foreign_body_error_is_wrapped() {
        let (mgr, _) = manager(FakeTransactor::default());
        let err = mgr
            .read_committed(&Context::background(), |_ctx| async move {
                Err::<(), _>("validation failed")
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "failed to execute code inside transaction");
        assert_eq!(
            std::error::Error::source(&err).unwrap().to_string(),
            "validation failed"
        );
    }

    #[tokio::test]
    async fn test_panic_is_recovered_and_rolled_back() {
        let (mgr, counters) = manager(FakeTransactor::default());
        let err = mgr
            .read_committed(&Context::background(), |_ctx| async move {
                if true {
                    panic!("boom");
                }
                Ok::<(), DbError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::PanicRecovered { ref message } if message == "boom"));
        assert_eq!(err.to_string(), "panic recovered: boom");
        assert_eq!(counts(&counters), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_panic_before_first_await_is_recovered() {
        let (mgr, counters) = manager(FakeTransactor::default());
        let err = mgr
            .read_committed(&Context::background(), |_ctx| -> std::future::Ready<Result<(), DbError>> {
                panic!("{}", String::from("eager"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::PanicRecovered { ref message } if message == "eager"));
        assert_eq!(counts(&counters), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_rollback_failure_reports_both() {
        let (mgr, counters) = manager(FakeTransactor {
            fail_rollback: true,
            ..Default::default()
        });
        let err = mgr
            .read_committed(&Context::background(), |_ctx| async move {
                Err::<(), _>(DbError::not_found("get_user"))
            })
            .await
            .unwrap_err();

        match &err {
            DbError::RollbackFailed { cause, rollback } => {
                assert!(matches!(**cause, DbError::BodyFailed { .. }));
                assert!(matches!(**rollback, DbError::ConnectFailed { .. }));
            }
            other => panic!("expected RollbackFailed, got {other:?}"),
        }
        assert!(matches!(err.root_cause(), DbError::NotFound { .. }));
        assert_eq!(counts(&counters), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_commit_failure_is_surfaced() {
        let (mgr, counters) = manager(FakeTransactor {
            fail_commit: true,
            ..Default::default()
        });
        let err = mgr
            .read_committed(&Context::background(), |_ctx| async move { Ok::<_, DbError>(()) })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::CommitFailed { .. }));
        assert_eq!(err.to_string(), "tx commit failed");
        assert_eq!(counts(&counters), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_begin_failure_runs_nothing() {
        let (mgr, counters) = manager(FakeTransactor {
            fail_begin: true,
            ..Default::default()
        });
        let ran = AtomicBool::new(false);
        let err = mgr
            .read_committed(&Context::background(), |_ctx| async {
                ran.store(true, Ordering::SeqCst);
                Ok::<_, DbError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::BeginFailed { .. }));
        assert_eq!(err.to_string(), "can't begin transaction");
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(counts(&counters), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_nested_call_joins_outer_transaction() {
        let (mgr, counters) = manager(FakeTransactor::default());
        let mgr = Arc::new(mgr);
        let inner_mgr = mgr.clone();

        mgr.read_committed(&Context::background(), |outer_ctx| async move {
            let outer_id = bound_id(&outer_ctx);
            let derived = outer_ctx.with_value("request-scoped");
            let inner_id = inner_mgr
                .transaction(
                    &derived,
                    TxOptions::new(IsolationLevel::Serializable),
                    |inner_ctx| async move { Ok::<_, DbError>(bound_id(&inner_ctx)) },
                )
                .await?;
            assert_eq!(inner_id, outer_id);
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();

        // One begin, one commit, and the inner isolation request never reached begin
        assert_eq!(counts(&counters), (1, 1, 0));
        assert_eq!(
            *counters.isolation.lock().unwrap(),
            vec![IsolationLevel::ReadCommitted]
        );
    }

    #[tokio::test]
    async fn test_nested_error_propagates_unchanged_and_outer_rolls_back() {
        let (mgr, counters) = manager(FakeTransactor::default());
        let mgr = Arc::new(mgr);
        let inner_mgr = mgr.clone();

        let err = mgr
            .read_committed(&Context::background(), |ctx| async move {
                let inner = inner_mgr
                    .read_committed(&ctx, |_ctx| async move {
                        Err::<(), _>(DbError::not_found("inner_query"))
                    })
                    .await;
                // The inner call did not wrap or resolve anything
                assert!(matches!(inner, Err(DbError::NotFound { .. })));
                inner
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::BodyFailed { .. }));
        assert_eq!(counts(&counters), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_finished_transaction_in_context_is_rejected() {
        let (mgr, counters) = manager(FakeTransactor::default());
        let leaked = Arc::new(Mutex::new(None));
        let slot = leaked.clone();

        mgr.read_committed(&Context::background(), |ctx| async move {
            *slot.lock().unwrap() = Some(ctx);
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();

        let stale = leaked.lock().unwrap().take().unwrap();
        let err = mgr
            .read_committed(&stale, |_ctx| async move { Ok::<_, DbError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidTransactionState { .. }));
        assert_eq!(counts(&counters), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_cancellation_rolls_back() {
        let (mgr, counters) = manager(FakeTransactor::default());
        let (ctx, cancel) = Context::background().with_cancel();

        let err = mgr
            .read_committed(&ctx, |_ctx| async move {
                cancel.cancel();
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, DbError>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(matches!(err, DbError::BodyFailed { .. }));
        // Rollback ran on a context detached from the cancellation
        assert_eq!(counts(&counters), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_deadline_rolls_back() {
        let (mgr, counters) = manager(FakeTransactor::default());
        let ctx = Context::background().with_timeout(Duration::from_millis(20));

        let err = mgr
            .read_committed(&ctx, |_ctx| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, DbError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err.root_cause(), DbError::DeadlineExceeded));
        assert_eq!(counts(&counters), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_slow_rollback_is_bounded() {
        let transactor = FakeTransactor {
            rollback_delay: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let counters = transactor.counters.clone();
        let mgr = TransactionManager::new(transactor)
            .with_rollback_timeout(Duration::from_millis(50));
        let ctx = Context::background().with_timeout(Duration::from_millis(20));

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            mgr.read_committed(&ctx, |_ctx| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, DbError>(())
            }),
        )
        .await
        .expect("rollback should give up after its own timeout")
        .unwrap_err();

        match &err {
            DbError::RollbackFailed { cause, rollback } => {
                assert!(matches!(cause.root_cause(), DbError::DeadlineExceeded));
                assert!(matches!(**rollback, DbError::DeadlineExceeded));
            }
            other => panic!("expected RollbackFailed, got {other:?}"),
        }
        assert_eq!(counts(&counters), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_concurrent_units_of_work_are_isolated() {
        let (mgr, counters) = manager(FakeTransactor::default());
        let mgr = Arc::new(mgr);

        let run = |mgr: Arc<TransactionManager<FakeTransactor>>| async move {
            mgr.read_committed(&Context::background(), |ctx| async move {
                let first = bound_id(&ctx);
                tokio::time::sleep(Duration::from_millis(10)).await;
                assert_eq!(bound_id(&ctx), first);
                Ok::<_, DbError>(first)
            })
            .await
        };

        let (a, b) = tokio::join!(
            tokio::spawn(run(mgr.clone())),
            tokio::spawn(run(mgr.clone()))
        );
        let a = a.unwrap().unwrap();
        let b = b.unwrap().unwrap();

        assert!(a.is_some() && b.is_some());
        assert_ne!(a, b);
        assert_eq!(counts(&counters), (2, 2, 0));
    }

    #[tokio::test]
    async fn test_usable_through_trait() {
        async fn run<M: TxManager>(mgr: &M) -> DbResult<u8> {
            mgr.read_committed(&Context::background(), |_ctx| async move { Ok::<_, DbError>(1) })
                .await
        }

        let (mgr, counters) = manager(FakeTransactor::default());
        assert_eq!(run(&mgr).await.unwrap(), 1);
        assert_eq!(counts(&counters), (1, 1, 0));
    }
}
