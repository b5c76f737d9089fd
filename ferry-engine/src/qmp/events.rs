//! Buffer of asynchronous monitor events.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::Event;
use crate::EngineError;

const DEFAULT_CAPACITY: usize = 1024;

/// Bounded, timestamp-ordered log of events received from one monitor.
///
/// Waiters block only themselves; the log is shared between the reader
/// task that appends and any number of waiters.
#[derive(Debug)]
pub struct EventLog {
    events: Mutex<VecDeque<Event>>,
    capacity: usize,
    seq: watch::Sender<u64>,
    closed: AtomicBool,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (seq, _) = watch::channel(0);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
            seq,
            closed: AtomicBool::new(false),
        }
    }

    /// Appends an event, evicting the oldest one when full.
    pub fn push(&self, event: Event) {
        {
            let mut events = self.lock();
            if events.len() == self.capacity {
                events.pop_front();
            }
            events.push_back(event);
        }
        self.seq.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Marks the log closed and wakes every waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.seq.send_modify(|n| *n = n.wrapping_add(1));
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Already-buffered `kind` events matching `fields` stamped at or after `after`.
    #[must_use]
    pub fn find(&self, kind: &str, fields: &Map<String, Value>, after: DateTime<Utc>) -> Vec<Event> {
        self.lock()
            .iter()
            .filter(|e| e.timestamp >= after && e.matches(kind, fields))
            .cloned()
            .collect()
    }

    /// Waits for the first matching event stamped at or after `after`.
    ///
    /// Events buffered before the call are considered too, so a wait that
    /// starts late still observes an event that has already arrived.
    ///
    /// # Errors
    /// - [`EngineError::Interrupted`] when `cancel` fires first.
    /// - [`EngineError::DeadlineExceeded`] when `timeout` elapses first.
    /// - [`EngineError::Protocol`] when the monitor connection closes.
    pub async fn wait(
        &self,
        kind: &str,
        fields: &Map<String, Value>,
        after: DateTime<Utc>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Event, EngineError> {
        let mut seq = self.seq.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(event) = self.find(kind, fields, after).into_iter().next() {
                return Ok(event);
            }
            if self.is_closed() {
                return Err(EngineError::protocol(format!("monitor closed while waiting for {kind}")));
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(EngineError::Interrupted),
                () = tokio::time::sleep_until(deadline) => {
                    return Err(EngineError::DeadlineExceeded(format!(
                        "no {kind} event within {}s",
                        timeout.as_secs_f32()
                    )));
                }
                changed = seq.changed() => {
                    if changed.is_err() {
                        return Err(EngineError::protocol("event log dropped"));
                    }
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Event>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.events.lock().expect("event log lock poisoned")
    }
}
