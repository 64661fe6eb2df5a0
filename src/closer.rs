//! Shutdown coordination.
//!
//! A [`Closer`] collects cleanup callbacks over the life of a process and
//! runs them all once, concurrently, when shutdown is triggered either by an
//! explicit [`Closer::close_all`] or by SIGINT/SIGTERM when created with
//! [`Closer::with_signals`]. Failures are logged and never propagated.

use crate::error::{BoxError, error_chain};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

type Callback = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

#[derive(Default)]
struct State {
    callbacks: Vec<Callback>,
    triggered: bool,
}

struct Inner {
    state: Mutex<State>,
    done: watch::Sender<bool>,
}

/// Runs registered cleanup callbacks once at shutdown.
#[derive(Clone)]
pub struct Closer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Closer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Closer")
            .field("callbacks", &state.callbacks.len())
            .field("triggered", &state.triggered)
            .field("done", &*self.inner.done.borrow())
            .finish()
    }
}

impl Default for Closer {
    fn default() -> Self {
        Self::new()
    }
}

impl Closer {
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                done,
            }),
        }
    }

    /// Create a closer that also triggers on SIGINT or SIGTERM.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_signals() -> Self {
        let closer = Self::new();
        let on_signal = closer.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            on_signal.close_all().await;
        });
        closer
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a cleanup callback.
    ///
    /// Callbacks registered after shutdown has been triggered are dropped
    /// without running.
    pub fn add<F, Fut, E>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let mut state = self.state();
        if state.triggered {
            warn!("Closer already triggered; cleanup callback ignored");
            return;
        }
        state.callbacks.push(Box::new(move || {
            async move { f().await.map_err(Into::<BoxError>::into) }.boxed()
        }));
    }

    /// Run every registered callback concurrently and wait for all of them.
    ///
    /// Only the first call runs the callbacks; later calls wait until that
    /// run has finished. The run is owned by a spawned task, so dropping this
    /// future early does not cut the callbacks short or strand waiters.
    pub async fn close_all(&self) {
        let callbacks = {
            let mut state = self.state();
            if state.triggered {
                None
            } else {
                state.triggered = true;
                Some(std::mem::take(&mut state.callbacks))
            }
        };

        if let Some(callbacks) = callbacks {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                run_callbacks(callbacks).await;
                inner.done.send_replace(true);
                info!("Cleanup complete");
            });
        }

        self.wait().await;
    }

    /// Resolve once [`Closer::close_all`] has finished.
    pub async fn wait(&self) {
        let mut done = self.inner.done.subscribe();
        // The sender lives as long as `self`, so this only fails if it is dropped mid-wait
        let _ = done.wait_for(|finished| *finished).await;
    }

    pub fn is_done(&self) -> bool {
        *self.inner.done.borrow()
    }
}

async fn run_callbacks(callbacks: Vec<Callback>) {
    info!(count = callbacks.len(), "Running cleanup callbacks");

    let mut tasks = JoinSet::new();
    for callback in callbacks {
        tasks.spawn(callback());
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %error_chain(e.as_ref()), "Cleanup callback failed"),
            Err(e) if e.is_panic() => error!(error = %e, "Cleanup callback panicked"),
            Err(e) => error!(error = %e, "Cleanup callback aborted"),
        }
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
