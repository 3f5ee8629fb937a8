//! Transaction coordination.
//!
//! A `Scope` is a logical transaction: it carries an ordered list of
//! deferred rollback and commit actions plus a small key/value bag for
//! intra-scope state (store adapters use the bag to cache their opened
//! backend transaction handle, see `get_or_open_tx` in `taskqueue-postgres`).
//! Store adapters register their own commit/rollback on first use within a
//! scope, so the service layer (`queue`, `task` modules) composes
//! multi-statement operations without knowing anything about the backend's
//! transaction API.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

type DeferredFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), String>> + Send>;

#[derive(Default)]
struct Inner {
    values: HashMap<&'static str, Box<dyn Any + Send>>,
    rollbacks: Vec<DeferredFn>,
    commits: Vec<DeferredFn>,
}

/// A handle to one logical transaction. Cheap to clone; clones share the
/// same underlying action lists and value bag.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Mutex<Inner>>,
}

/// All registered rollback (or commit) actions failed to report success;
/// errors are joined rather than short-circuited, matching the original
/// `errors.Join` behavior.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TxError(String);

impl TxError {
    fn join(errors: Vec<String>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self(errors.join("; ")))
        }
    }
}

impl Scope {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn set_value<T: Send + 'static>(&self, key: &'static str, value: T) {
        self.inner.lock().unwrap().values.insert(key, Box::new(value));
    }

    /// Clone of the stored value, if present and of the requested type.
    /// Store adapters typically cache `Arc<tokio::sync::Mutex<Transaction>>`
    /// here, which is cheap to clone.
    pub fn value<T: Clone + Send + 'static>(&self, key: &'static str) -> Option<T> {
        self.inner
            .lock()
            .unwrap()
            .values
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Stable identity for this scope's underlying action list, usable as a
    /// map key by fixtures that need to tell "the same scope" apart from
    /// "a different scope" without caring what it contains (the in-memory
    /// `TaskStore` uses this to simulate row locks held for the scope's
    /// lifetime).
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub fn add_rollback<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        self.inner
            .lock()
            .unwrap()
            .rollbacks
            .push(Box::new(move || Box::pin(f())));
    }

    pub fn add_commit<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        self.inner
            .lock()
            .unwrap()
            .commits
            .push(Box::new(move || Box::pin(f())));
    }

    /// Run every registered rollback action in registration order, joining
    /// every failure rather than stopping at the first.
    pub async fn rollback(&self) -> Result<(), TxError> {
        let fns = std::mem::take(&mut self.inner.lock().unwrap().rollbacks);
        let mut errs = Vec::new();
        for f in fns {
            if let Err(e) = f().await {
                errs.push(e);
            }
        }
        match TxError::join(errs) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run every registered commit action in registration order, joining
    /// every failure rather than stopping at the first.
    pub async fn commit(&self) -> Result<(), TxError> {
        let fns = std::mem::take(&mut self.inner.lock().unwrap().commits);
        let mut errs = Vec::new();
        for f in fns {
            if let Err(e) = f().await {
                errs.push(e);
            }
        }
        match TxError::join(errs) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Outcome of a `TxCoordinator::run` body: either the body's own error, or
/// a commit failure (which is always logged/prefixed separately from the
/// body's own error variants).
#[derive(Debug, thiserror::Error)]
pub enum RunError<E> {
    #[error(transparent)]
    Body(E),

    #[error("commit trx: {0}")]
    Commit(TxError),
}

pub struct TxCoordinator;

impl TxCoordinator {
    /// Allocates a fresh transaction scope. `_parent` is accepted for
    /// symmetry with the contract (a scope is always chained from some
    /// enclosing one, even if that's only the process base scope) but
    /// scopes don't currently inherit state from their parent.
    pub fn begin(_parent: Option<&Scope>) -> Scope {
        Scope::new()
    }

    pub fn exists(scope: Option<&Scope>) -> bool {
        scope.is_some()
    }

    /// Runs `body` in a fresh child scope of `parent`, then commits on
    /// success or rolls back on failure. Returns the body's result (or a
    /// commit failure, prefixed `"commit trx: "`) plus a rollback error
    /// when rollback itself failed -- callers must never surface the
    /// rollback error as the primary one, only log it alongside the
    /// originating error.
    pub async fn run<T, E, F, Fut>(
        parent: Option<&Scope>,
        body: F,
    ) -> (Result<T, RunError<E>>, Option<TxError>)
    where
        F: FnOnce(Scope) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let scope = Self::begin(parent);
        match body(scope.clone()).await {
            Ok(value) => match scope.commit().await {
                Ok(()) => (Ok(value), None),
                Err(e) => (Err(RunError::Commit(e)), None),
            },
            Err(body_err) => {
                let rollback_err = scope.rollback().await.err();
                (Err(RunError::Body(body_err)), rollback_err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn commits_run_in_registration_order() {
        let scope = TxCoordinator::begin(None);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            scope.add_commit(move || async move {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }

        scope.commit().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn rollback_joins_every_failure() {
        let scope = TxCoordinator::begin(None);
        scope.add_rollback(|| async { Err("first".to_string()) });
        scope.add_rollback(|| async { Err("second".to_string()) });

        let err = scope.rollback().await.unwrap_err();
        assert!(err.to_string().contains("first"));
        assert!(err.to_string().contains("second"));
    }

    #[tokio::test]
    async fn run_commits_on_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let (result, rb_err): (Result<i32, RunError<()>>, _) =
            TxCoordinator::run(None, move |scope| {
                let calls = calls2.clone();
                async move {
                    scope.add_commit(move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert!(rb_err.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_rolls_back_on_body_failure() {
        let rolled_back = Arc::new(AtomicUsize::new(0));
        let rolled_back2 = rolled_back.clone();

        let (result, rb_err): (Result<(), RunError<&str>>, _) =
            TxCoordinator::run(None, move |scope| {
                let rolled_back = rolled_back2.clone();
                async move {
                    scope.add_rollback(move || async move {
                        rolled_back.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    Err::<(), _>("body failed")
                }
            })
            .await;

        assert!(matches!(result, Err(RunError::Body("body failed"))));
        assert!(rb_err.is_none());
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_prefixes_commit_failure() {
        let (result, _): (Result<(), RunError<()>>, _) = TxCoordinator::run(None, |scope| async move {
            scope.add_commit(|| async { Err("boom".to_string()) });
            Ok(())
        })
        .await;

        match result {
            Err(RunError::Commit(e)) => assert!(e.to_string().contains("boom")),
            other => panic!("expected commit error, got {other:?}"),
        }
    }
}
