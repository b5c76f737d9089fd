//! Cancelable background tasks and their registry.
//!
//! A [`Task`] runs one async body on the tokio runtime. Cancellation is
//! cooperative: [`Task::cancel`] only fires the body's token, and the body
//! is expected to observe it at its polling points and unwind on its own.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::EngineError;

mod pool;

pub use pool::TaskPool;

#[derive(Default)]
struct State {
    cancel: Option<CancellationToken>,
    released: Option<watch::Receiver<bool>>,
    err: Option<Arc<EngineError>>,
}

/// Lifecycle of one background job: idle, running, then terminal.
///
/// Cloning yields another handle to the same task.
#[derive(Clone, Default)]
pub struct Task {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("in_progress", &self.in_progress())
            .finish_non_exhaustive()
    }
}

impl Task {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `body` with a fresh cancellation token.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns [`EngineError::TaskAlreadyRunning`] if the task is running.
    pub fn start<F, Fut>(&self, body: F) -> Result<(), EngineError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let (released_tx, released_rx) = watch::channel(false);
        {
            let mut state = self.lock();
            if state.cancel.is_some() {
                return Err(EngineError::TaskAlreadyRunning);
            }
            state.cancel = Some(token.clone());
            state.released = Some(released_rx);
            state.err = None;
        }

        let fut = body(token);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let result = fut.await;
            {
                #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                let mut state = state.lock().expect("task state lock poisoned");
                state.cancel = None;
                state.err = result.err().map(Arc::new);
            }
            let _ = released_tx.send(true);
        });
        Ok(())
    }

    /// Requests cancellation of the running body.
    ///
    /// # Errors
    /// Returns [`EngineError::TaskNotRunning`] if the task is not running.
    pub fn cancel(&self) -> Result<(), EngineError> {
        let state = self.lock();
        let token = state.cancel.as_ref().ok_or(EngineError::TaskNotRunning)?;
        token.cancel();
        Ok(())
    }

    /// Waits until the body has returned. Returns at once if never started.
    pub async fn wait(&self) {
        let released = self.lock().released.clone();
        if let Some(mut rx) = released {
            // The sender only drops after sending `true`, or if the body panicked.
            let _ = rx.wait_for(|done| *done).await;
        }
    }

    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.lock().cancel.is_some()
    }

    /// Terminal error of the last run; `None` while running or on success.
    #[must_use]
    pub fn err(&self) -> Option<Arc<EngineError>> {
        self.lock().err.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.state.lock().expect("task state lock poisoned")
    }
}

/// Sleeps for `period` unless `cancel` fires first.
pub(crate) async fn pause(period: Duration, cancel: &CancellationToken) -> Result<(), EngineError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(EngineError::Interrupted),
        () = tokio::time::sleep(period) => Ok(()),
    }
}

/// Runs `fut` unless `cancel` fires first, in which case `fut` is dropped.
pub(crate) async fn interruptible<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(EngineError::Interrupted),
        res = fut => res,
    }
}

/// Fails with [`EngineError::DeadlineExceeded`] when `fut` outlives `limit`.
pub(crate) async fn bounded<T>(
    what: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| EngineError::DeadlineExceeded(format!("{what} did not finish within {limit:?}")))?
}

/// Runs one member of a task group: its failure cancels `group`, so
/// siblings blocked on `group` unwind promptly.
pub(crate) async fn grouped(
    group: &CancellationToken,
    fut: impl Future<Output = Result<(), EngineError>>,
) -> Result<(), EngineError> {
    let res = fut.await;
    if res.is_err() {
        group.cancel();
    }
    res
}

/// Folds the results of two group members into one.
///
/// A genuine failure wins over the `Interrupted` it caused in its sibling.
pub(crate) fn first_error(a: Result<(), EngineError>, b: Result<(), EngineError>) -> Result<(), EngineError> {
    match (a, b) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Err(a), Err(b)) if a.is_interrupted() => Err(b),
        (Err(a), Err(_)) => Err(a),
    }
}
