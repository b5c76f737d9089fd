//! Error types for the engine crate.

use ferry_core::{CoreError, TaskKind};

/// QMP error class QEMU reports for a block job id it does not know.
pub(crate) const QMP_DEVICE_NOT_ACTIVE: &str = "DeviceNotActive";

/// QMP error class for an unknown device. Older QEMU used it for jobs too.
pub(crate) const QMP_DEVICE_NOT_FOUND: &str = "DeviceNotFound";

/// Errors that can occur while driving monitors and background tasks.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Another in-progress task already owns the object or owner.
    #[error("another task is already running: kind={kind}, object={object}, owner={}", owner.as_deref().unwrap_or("-"))]
    AlreadyRunning {
        kind: TaskKind,
        object: String,
        owner: Option<String>,
    },

    /// No monitor is registered for the VM.
    #[error("monitor not available for VM {0}")]
    NotAvailable(String),

    /// The VM is not running, so live operations are impossible.
    #[error("VM {0} is not running")]
    NotRunning(String),

    /// A precondition failed before anything was provisioned.
    #[error("{0}")]
    Precondition(String),

    /// Task options failed validation.
    #[error(transparent)]
    InvalidOptions(#[from] CoreError),

    /// The operation observed an operator-requested cancellation.
    #[error("interrupted")]
    Interrupted,

    /// A bounded wait elapsed.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The monitor replied with an error object.
    #[error("QMP error: {class}: {desc}")]
    Qmp { class: String, desc: String },

    /// The monitor connection misbehaved (bad greeting, malformed reply, EOF).
    #[error("QMP protocol error: {0}")]
    Protocol(String),

    /// A call to the peer host failed.
    #[error("remote request failed: {0}")]
    Remote(String),

    /// A disk mirror job failed.
    #[error("mirror of {disk} (job {job}) failed: {reason}")]
    Mirror {
        disk: String,
        job: String,
        reason: String,
    },

    /// The VM state transfer failed.
    #[error("migration failed: {0}")]
    Migration(String),

    /// A disk backup job failed.
    #[error("copy of {disk} failed: {reason}")]
    Backup { disk: String, reason: String },

    /// Reading or writing persisted statistics failed.
    #[error("statistics persistence failed: {0}")]
    Persist(String),

    /// `start` was called on a running task.
    #[error("task is already running")]
    TaskAlreadyRunning,

    /// `cancel` was called on a task that is not running.
    #[error("task is not running")]
    TaskNotRunning,

    /// No task is registered under the identifier.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Returns `true` if this error is the cancellation signal.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// Returns `true` for the monitor's "no such device/job" reply.
    ///
    /// The monitor reaps concluded block jobs, so this is how a finished
    /// job looks when it is addressed afterwards.
    #[must_use]
    pub fn is_job_not_found(&self) -> bool {
        matches!(self, Self::Qmp { class, .. } if class == QMP_DEVICE_NOT_ACTIVE || class == QMP_DEVICE_NOT_FOUND)
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
