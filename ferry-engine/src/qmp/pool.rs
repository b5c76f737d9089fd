//! Name-keyed registry of live monitors.
//!
//! The absence of an entry means the VM is not running. That is steady
//! state, not a fault: [`QmpPool::get`] returns `None` and only the
//! command-running helpers turn it into [`EngineError::NotAvailable`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::{Event, Monitor, QmpMonitor, TransactionAction};
use crate::{EngineConfig, EngineError};

/// Thread-safe registry holding at most one monitor per VM name.
pub struct QmpPool {
    socket_dir: PathBuf,
    connect_timeout: Duration,
    monitors: RwLock<HashMap<String, Arc<dyn Monitor>>>,
}

impl std::fmt::Debug for QmpPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QmpPool")
            .field("socket_dir", &self.socket_dir)
            .field("vms", &self.names())
            .finish()
    }
}

impl QmpPool {
    /// Create an empty pool that finds sockets as `<socket_dir>/<vm>.qmp`.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            socket_dir: config.qmp_socket_dir.clone(),
            connect_timeout: config.monitor_connect_timeout,
            monitors: RwLock::new(HashMap::new()),
        }
    }

    /// Non-blocking lookup. `None` means the VM is not running.
    #[must_use]
    pub fn get(&self, vm_name: &str) -> Option<Arc<dyn Monitor>> {
        self.read().get(vm_name).cloned()
    }

    /// Names of every VM with a registered monitor.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Registers a monitor, returning the one it replaced.
    pub fn insert(&self, vm_name: impl Into<String>, monitor: Arc<dyn Monitor>) -> Option<Arc<dyn Monitor>> {
        self.write().insert(vm_name.into(), monitor)
    }

    /// Connects to the VM's monitor socket and registers the connection.
    ///
    /// Called once the instance has signalled readiness. A stale monitor
    /// under the same name is closed.
    ///
    /// # Errors
    /// Propagates connection and handshake errors from [`QmpMonitor::connect`].
    pub async fn new_monitor(&self, vm_name: &str) -> Result<Arc<dyn Monitor>, EngineError> {
        let path = self.socket_dir.join(format!("{vm_name}.qmp"));
        let monitor: Arc<dyn Monitor> = Arc::new(QmpMonitor::connect(vm_name, &path, self.connect_timeout).await?);

        if let Some(old) = self.insert(vm_name, Arc::clone(&monitor)) {
            tracing::warn!(vm = vm_name, "replacing stale QMP monitor");
            old.close().await;
        }
        tracing::info!(vm = vm_name, "QMP monitor registered");
        Ok(monitor)
    }

    /// Unregisters and closes the VM's monitor, if any.
    pub async fn close_monitor(&self, vm_name: &str) {
        let removed = self.write().remove(vm_name);
        if let Some(monitor) = removed {
            monitor.close().await;
            tracing::info!(vm = vm_name, "QMP monitor unregistered");
        }
    }

    fn monitor(&self, vm_name: &str) -> Result<Arc<dyn Monitor>, EngineError> {
        self.get(vm_name).ok_or_else(|| EngineError::NotAvailable(vm_name.to_owned()))
    }

    /// Runs a command and returns its raw reply.
    ///
    /// # Errors
    /// Returns [`EngineError::NotAvailable`] if the VM has no monitor and
    /// propagates errors reported by QEMU.
    pub async fn run(&self, vm_name: &str, command: &str, arguments: Option<Value>) -> Result<Value, EngineError> {
        let monitor = self.monitor(vm_name)?;
        tracing::trace!(vm = vm_name, command, "QMP command");
        monitor.execute(command, arguments).await
    }

    /// Runs a command and decodes its reply into `T`.
    ///
    /// # Errors
    /// As [`QmpPool::run`], plus [`EngineError::Protocol`] if the reply
    /// does not have the expected shape.
    pub async fn run_as<T: DeserializeOwned>(
        &self,
        vm_name: &str,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<T, EngineError> {
        let reply = self.run(vm_name, command, arguments).await?;
        serde_json::from_value(reply)
            .map_err(|e| EngineError::protocol(format!("unexpected reply to {command}: {e}")))
    }

    /// Runs several actions atomically through the `transaction` command.
    ///
    /// # Errors
    /// As [`QmpPool::run`].
    pub async fn run_transaction(&self, vm_name: &str, actions: &[TransactionAction]) -> Result<Value, EngineError> {
        let args = json!({ "actions": actions });
        self.run(vm_name, "transaction", Some(args)).await
    }

    /// Blocks the caller until a matching event stamped at or after
    /// `after` is observed.
    ///
    /// # Errors
    /// [`EngineError::NotAvailable`], [`EngineError::DeadlineExceeded`] or
    /// [`EngineError::Interrupted`].
    pub async fn wait_event(
        &self,
        vm_name: &str,
        kind: &str,
        fields: &Map<String, Value>,
        after: DateTime<Utc>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Event, EngineError> {
        let monitor = self.monitor(vm_name)?;
        monitor.events().wait(kind, fields, after, timeout, cancel).await
    }

    /// Non-blocking scan of already-buffered events.
    ///
    /// # Errors
    /// Returns [`EngineError::NotAvailable`] if the VM has no monitor.
    pub fn find_events(
        &self,
        vm_name: &str,
        kind: &str,
        fields: &Map<String, Value>,
        after: DateTime<Utc>,
    ) -> Result<Vec<Event>, EngineError> {
        Ok(self.monitor(vm_name)?.events().find(kind, fields, after))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn Monitor>>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.monitors.read().expect("QMP pool read lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn Monitor>>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.monitors.write().expect("QMP pool write lock poisoned")
    }
}
