//! One-shot signal used to order two concurrent phases.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::EngineError;

/// A gate starts shut and can be opened exactly once.
///
/// Opening is idempotent; every current and future waiter is released.
#[derive(Debug)]
pub struct Gate {
    tx: watch::Sender<bool>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A gate that is already open.
    #[must_use]
    pub fn opened() -> Self {
        let gate = Self::new();
        gate.open();
        gate
    }

    /// Opens the gate. Returns `true` only for the call that opened it.
    pub fn open(&self) -> bool {
        self.tx.send_if_modified(|open| !std::mem::replace(open, true))
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the gate opens or `cancel` fires.
    ///
    /// # Errors
    /// Returns [`EngineError::Interrupted`] if `cancel` fires first.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            biased;
            res = rx.wait_for(|open| *open) => {
                res.map(|_| ()).map_err(|_| EngineError::protocol("gate dropped"))
            }
            () = cancel.cancelled() => Err(EngineError::Interrupted),
        }
    }
}
