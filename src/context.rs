//! Request-scoped execution context.
//!
//! A [`Context`] is an immutable carrier of request-scoped values plus
//! cancellation and deadline signalling. It is passed explicitly through every
//! call. Deriving a child never mutates the parent; a child inherits every
//! value of its parent, including a bound transaction, and is cancelled
//! whenever any ancestor is cancelled.
//!
//! The active transaction lives in a dedicated slot that only the transaction
//! manager writes (see [`bind_transaction`]). Everything downstream only
//! reads it through [`lookup_transaction`].

use crate::error::DbError;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

type Value = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Default)]
struct Inner {
    values: HashMap<TypeId, Value>,
    transaction: Option<Value>,
    deadline: Option<Instant>,
    cancel_signals: Vec<watch::Receiver<bool>>,
}

/// Request-scoped execution context.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("values", &self.inner.values.len())
            .field("has_transaction", &self.has_transaction())
            .field("deadline", &self.inner.deadline)
            .field("cancel_signals", &self.inner.cancel_signals.len())
            .finish()
    }
}

/// Cancels the context returned alongside it by [`Context::with_cancel`]
/// and every context derived from it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Context {
    /// The empty root context: no values, never cancelled, no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    fn derive(&self, f: impl FnOnce(&mut Inner)) -> Self {
        let mut inner = Inner::clone(&self.inner);
        f(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Derive a context carrying `value`, keyed by its type.
    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Self {
        self.derive(|inner| {
            inner.values.insert(TypeId::of::<T>(), Arc::new(value));
        })
    }

    /// Look up a value by type.
    pub fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner
            .values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    /// Derive a cancellable context.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = self.derive(|inner| inner.cancel_signals.push(rx));
        (ctx, CancelHandle { tx: Arc::new(tx) })
    }

    /// Derive a context that expires at `deadline`, or at the parent's
    /// deadline if that comes first.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        self.derive(|inner| {
            inner.deadline = Some(match inner.deadline {
                Some(existing) => existing.min(deadline),
                None => deadline,
            });
        })
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context that keeps every value but is never cancelled and
    /// has no deadline.
    pub fn without_cancel(&self) -> Self {
        self.derive(|inner| {
            inner.deadline = None;
            inner.cancel_signals.clear();
        })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<DbError> {
        if self.inner.cancel_signals.iter().any(|rx| *rx.borrow()) {
            return Some(DbError::Cancelled);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(DbError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolve once the context is cancelled or its deadline passes.
    ///
    /// Never resolves for a context without cancellation or deadline.
    pub async fn done(&self) -> DbError {
        let deadline = self.inner.deadline;
        let mut signals = self.inner.cancel_signals.clone();

        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        let cancelled = async move {
            if signals.is_empty() {
                return std::future::pending::<()>().await;
            }
            let waits = signals.iter_mut().map(|rx| {
                Box::pin(async move {
                    // A dropped handle can no longer cancel.
                    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                        std::future::pending::<()>().await;
                    }
                })
            });
            futures_util::future::select_all(waits).await;
        };

        tokio::select! {
            _ = cancelled => DbError::Cancelled,
            _ = expired => DbError::DeadlineExceeded,
        }
    }

    /// Run `fut` unless the context is done first.
    ///
    /// Nothing is started when the context is already done; otherwise the
    /// operation is dropped as soon as the context becomes done.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, DbError>
    where
        F: Future<Output = Result<T, DbError>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            result = fut => result,
            err = self.done() => Err(err),
        }
    }

    /// True when a transaction handle of any type is bound.
    pub fn has_transaction(&self) -> bool {
        self.inner.transaction.is_some()
    }
}

/// Derive a context carrying `handle` as the active transaction.
pub(crate) fn bind_transaction<H: Any + Send + Sync>(ctx: &Context, handle: Arc<H>) -> Context {
    let handle: Value = handle;
    ctx.derive(move |inner| inner.transaction = Some(handle))
}

/// The transaction handle bound to `ctx`, if it is of type `H`.
pub fn lookup_transaction<H: Any + Send + Sync>(ctx: &Context) -> Option<Arc<H>> {
    ctx.inner
        .transaction
        .clone()
        .and_then(|handle| handle.downcast::<H>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct RequestId(&'static str);

    #[derive(Debug, PartialEq)]
    struct FakeTx(u32);

    #[test]
    fn test_values_are_inherited_and_parent_untouched() {
        let root = Context::background();
        let child = root.with_value(RequestId("req-1"));
        let grandchild = child.with_value(7_u32);

        assert!(root.value::<RequestId>().is_none());
        assert_eq!(child.value::<RequestId>(), Some(&RequestId("req-1")));
        assert_eq!(grandchild.value::<RequestId>(), Some(&RequestId("req-1")));
        assert_eq!(grandchild.value::<u32>(), Some(&7));
        assert!(child.value::<u32>().is_none());
    }

    #[test]
    fn test_child_overrides_value() {
        let parent = Context::background().with_value(RequestId("a"));
        let child = parent.with_value(RequestId("b"));
        assert_eq!(parent.value::<RequestId>(), Some(&RequestId("a")));
        assert_eq!(child.value::<RequestId>(), Some(&RequestId("b")));
    }

    #[test]
    fn test_transaction_binding() {
        let root = Context::background();
        let bound = bind_transaction(&root, Arc::new(FakeTx(1)));
        let derived = bound.with_value(RequestId("nested"));

        assert!(!root.has_transaction());
        assert!(lookup_transaction::<FakeTx>(&root).is_none());
        assert_eq!(lookup_transaction::<FakeTx>(&derived).as_deref(), Some(&FakeTx(1)));
        // Wrong type is not found, but the slot is still occupied
        assert!(lookup_transaction::<RequestId>(&derived).is_none());
        assert!(derived.has_transaction());
    }

    #[test]
    fn test_transaction_slot_does_not_collide_with_values() {
        let ctx = Context::background().with_value(FakeTx(9));
        assert!(!ctx.has_transaction());
        assert!(lookup_transaction::<FakeTx>(&ctx).is_none());
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let (parent, cancel) = Context::background().with_cancel();
        let child = parent.with_value(RequestId("child"));
        assert!(child.err().is_none());

        cancel.cancel();
        assert!(matches!(child.err(), Some(DbError::Cancelled)));
        assert!(matches!(child.done().await, DbError::Cancelled));
    }

    #[tokio::test]
    async fn test_done_wakes_on_cancel() {
        use tokio_test::{assert_pending, assert_ready, task};

        let (ctx, cancel) = Context::background().with_cancel();
        let mut done = task::spawn(ctx.done());
        assert_pending!(done.poll());

        cancel.cancel();
        assert!(done.is_woken());
        assert!(matches!(assert_ready!(done.poll()), DbError::Cancelled));
    }

    #[tokio::test]
    async fn test_background_is_never_done() {
        let ctx = Context::background();
        let mut done = tokio_test::task::spawn(ctx.done());
        tokio_test::assert_pending!(done.poll());
        assert!(ctx.err().is_none());
    }

    #[tokio::test]
    async fn test_cancelling_child_leaves_parent_live() {
        let (parent, _parent_cancel) = Context::background().with_cancel();
        let (child, child_cancel) = parent.with_cancel();
        child_cancel.cancel();
        assert!(child.err().is_some());
        assert!(parent.err().is_none());
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_child_deadline_cannot_extend_parent() {
        let parent = Context::background().with_timeout(Duration::from_millis(50));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_run_skips_work_when_already_cancelled() {
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let mut started = false;
        let result = ctx
            .run(async {
                started = true;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(DbError::Cancelled)));
        assert!(!started);
    }

    #[tokio::test]
    async fn test_without_cancel_keeps_values() {
        let (ctx, cancel) = Context::background().with_cancel();
        let bound = bind_transaction(&ctx, Arc::new(FakeTx(3)));
        cancel.cancel();

        let detached = bound.without_cancel();
        assert!(detached.err().is_none());
        assert_eq!(lookup_transaction::<FakeTx>(&detached).as_deref(), Some(&FakeTx(3)));
        assert_eq!(detached.run(async { Ok(5) }).await.unwrap(), 5);
    }
}
