//! Registry of every in-flight task.
//!
//! The registry enforces mutual exclusion: a migration owns its whole VM,
//! a disk copy owns one disk. The admission check and the insert happen
//! under one lock so two concurrent starts cannot both pass the check.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use ferry_core::{DiskCopyingOptions, DiskCopyingStat, MigrationOptions, MigrationStat, TaskId, TaskKind};
use futures::future::join_all;

use crate::disk_copy::{CopyContext, DiskCopyingTask};
use crate::migration::{MigrationContext, MigrationTask};
use crate::qmp::QmpPool;
use crate::remote::{RemoteConnector, RemoteControl};
use crate::store::StatStore;
use crate::task::bounded;
use crate::{EngineConfig, EngineError};

#[derive(Debug, Clone)]
enum Entry {
    Migration(Arc<MigrationTask>),
    DiskCopying(Arc<DiskCopyingTask>),
}

impl Entry {
    fn in_progress(&self) -> bool {
        match self {
            Self::Migration(t) => t.in_progress(),
            Self::DiskCopying(t) => t.in_progress(),
        }
    }

    fn cancel(&self) -> Result<(), EngineError> {
        match self {
            Self::Migration(t) => t.cancel(),
            Self::DiskCopying(t) => t.cancel(),
        }
    }

    async fn wait(&self) {
        match self {
            Self::Migration(t) => t.wait().await,
            Self::DiskCopying(t) => t.wait().await,
        }
    }

    fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Migration(a), Self::Migration(b)) => Arc::ptr_eq(a, b),
            (Self::DiskCopying(a), Self::DiskCopying(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Owner of all migration and disk-copying tasks of this host.
pub struct TaskPool {
    qmp: Arc<QmpPool>,
    connector: Arc<dyn RemoteConnector>,
    store: Arc<StatStore>,
    config: EngineConfig,
    tasks: Mutex<HashMap<TaskId, Entry>>,
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool").field("tasks", &self.stat()).finish_non_exhaustive()
    }
}

impl TaskPool {
    #[must_use]
    pub fn new(config: EngineConfig, qmp: Arc<QmpPool>, connector: Arc<dyn RemoteConnector>) -> Self {
        let store = Arc::new(StatStore::new(config.state_dir.clone()));
        Self {
            qmp,
            connector,
            store,
            config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn qmp(&self) -> &Arc<QmpPool> {
        &self.qmp
    }

    /// Validates, runs the destination preflight checks and starts a
    /// migration of `opts.vm_name`.
    ///
    /// # Errors
    /// - [`EngineError::InvalidOptions`] if the options are inconsistent.
    /// - [`EngineError::NotRunning`] if the VM has no monitor.
    /// - [`EngineError::AlreadyRunning`] if a task already involves the VM.
    /// - [`EngineError::Precondition`] if the destination already has the
    ///   VM or lacks space for its disks.
    /// - [`EngineError::Remote`] if the destination cannot be reached.
    pub async fn start_migration(&self, opts: MigrationOptions) -> Result<(), EngineError> {
        opts.validate()?;
        if self.qmp.get(&opts.vm_name).is_none() {
            return Err(EngineError::NotRunning(opts.vm_name));
        }
        Self::admit_migration(&self.lock(), &opts.vm_name)?;

        let remote = self.connector.connect(&opts.dst_server, &opts.dst_addrs).await?;
        bounded("destination preflight", self.config.remote_timeout, preflight(remote.as_ref(), &opts)).await?;

        let task = Arc::new(MigrationTask::new(opts));
        let ctx = MigrationContext {
            qmp: Arc::clone(&self.qmp),
            remote,
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        };

        let mut tasks = self.lock();
        Self::admit_migration(&tasks, &task.options().vm_name)?;
        task.start(ctx)?;
        tracing::info!(task = %task.id(), "task registered");
        tasks.insert(task.id().clone(), Entry::Migration(task));
        Ok(())
    }

    /// Starts copying one disk of a running VM.
    ///
    /// # Errors
    /// [`EngineError::NotRunning`] if the VM has no monitor and
    /// [`EngineError::AlreadyRunning`] if the VM is migrating or the disk
    /// is already being copied.
    pub fn start_disk_copying(&self, opts: DiskCopyingOptions) -> Result<(), EngineError> {
        if self.qmp.get(&opts.vm_name).is_none() {
            return Err(EngineError::NotRunning(opts.vm_name));
        }

        let task = Arc::new(DiskCopyingTask::new(opts));
        let ctx = CopyContext {
            qmp: Arc::clone(&self.qmp),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        };

        let mut tasks = self.lock();
        let opts = task.options();
        Self::admit_disk_copying(&tasks, &opts.disk.path, &opts.vm_name)?;
        task.start(ctx)?;
        tracing::info!(task = %task.id(), "task registered");
        tasks.insert(task.id().clone(), Entry::DiskCopying(task));
        Ok(())
    }

    /// A migration conflicts with any running task that involves the VM.
    fn admit_migration(tasks: &HashMap<TaskId, Entry>, vm_name: &str) -> Result<(), EngineError> {
        Self::admit(tasks, |id| id.involves(vm_name))
    }

    /// A disk copy conflicts with a migration of its VM and with another
    /// copy of the same disk.
    fn admit_disk_copying(tasks: &HashMap<TaskId, Entry>, disk: &str, vm_name: &str) -> Result<(), EngineError> {
        Self::admit(tasks, |id| match id.kind() {
            TaskKind::Migration => id.object() == vm_name,
            _ => id.object() == disk,
        })
    }

    fn admit(tasks: &HashMap<TaskId, Entry>, conflicts: impl Fn(&TaskId) -> bool) -> Result<(), EngineError> {
        match tasks.iter().find(|(id, entry)| conflicts(id) && entry.in_progress()) {
            Some((id, _)) => Err(EngineError::AlreadyRunning {
                kind: id.kind(),
                object: id.object().to_owned(),
                owner: id.owner().map(str::to_owned),
            }),
            None => Ok(()),
        }
    }

    /// Cancels a task and waits for it to unwind before unregistering it.
    ///
    /// # Errors
    /// [`EngineError::TaskNotFound`] if nothing is registered under `id`
    /// and [`EngineError::TaskNotRunning`] if the task already ended.
    pub async fn cancel(&self, id: &TaskId) -> Result<(), EngineError> {
        let entry = self
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;

        entry.cancel()?;
        tracing::info!(task = %id, "task cancellation requested");
        entry.wait().await;
        self.remove_if_same(id, &entry);
        Ok(())
    }

    /// Cancels every task involving `vm_name` and waits for all of them.
    pub async fn cancel_all(&self, vm_name: &str) {
        let entries: Vec<(TaskId, Entry)> = self
            .lock()
            .iter()
            .filter(|(id, _)| id.involves(vm_name))
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        for (id, entry) in &entries {
            if entry.cancel().is_ok() {
                tracing::info!(task = %id, "task cancellation requested");
            }
        }
        join_all(entries.iter().map(|(_, entry)| entry.wait())).await;
        for (id, entry) in &entries {
            self.remove_if_same(id, entry);
        }
    }

    /// Registered migration of `vm_name`, running or finished.
    #[must_use]
    pub fn migration(&self, vm_name: &str) -> Option<Arc<MigrationTask>> {
        match self.lock().get(&TaskId::migration(vm_name)) {
            Some(Entry::Migration(t)) => Some(Arc::clone(t)),
            _ => None,
        }
    }

    #[must_use]
    pub fn disk_copying(&self, vm_name: &str, disk: &str) -> Option<Arc<DiskCopyingTask>> {
        match self.lock().get(&TaskId::disk_copying(disk, vm_name)) {
            Some(Entry::DiskCopying(t)) => Some(Arc::clone(t)),
            _ => None,
        }
    }

    /// Statistics of the migration of `vm_name`.
    ///
    /// Falls back to the persisted record, then to a `none` report.
    ///
    /// # Errors
    /// Returns [`EngineError::Persist`] if a persisted record is unreadable.
    pub async fn migration_stat(&self, vm_name: &str) -> Result<MigrationStat, EngineError> {
        if let Some(task) = self.migration(vm_name) {
            return Ok(task.stat());
        }
        Ok(self.store.load_migration(vm_name).await?.unwrap_or_else(MigrationStat::none))
    }

    /// Statistics of the copy of `disk` of `vm_name`.
    ///
    /// # Errors
    /// Returns [`EngineError::Persist`] if a persisted record is unreadable.
    pub async fn disk_copying_stat(&self, vm_name: &str, disk: &str) -> Result<DiskCopyingStat, EngineError> {
        if let Some(task) = self.disk_copying(vm_name, disk) {
            return Ok(task.stat());
        }
        Ok(self
            .store
            .load_disk_copying(vm_name, disk)
            .await?
            .unwrap_or_else(DiskCopyingStat::none))
    }

    /// Every registered task id with its in-progress flag.
    #[must_use]
    pub fn stat(&self) -> BTreeMap<String, bool> {
        self.lock()
            .iter()
            .map(|(id, entry)| (id.to_string(), entry.in_progress()))
            .collect()
    }

    fn remove_if_same(&self, id: &TaskId, entry: &Entry) {
        let mut tasks = self.lock();
        if tasks.get(id).is_some_and(|current| current.same(entry)) {
            tasks.remove(id);
            tracing::debug!(task = %id, "task unregistered");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Entry>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.tasks.lock().expect("task pool lock poisoned")
    }
}

/// Checks that nothing has to be undone if the destination refuses.
async fn preflight(remote: &dyn RemoteControl, opts: &MigrationOptions) -> Result<(), EngineError> {
    let dst_vm = opts.dst_vm_name();
    if remote.is_config_present(dst_vm).await? {
        return Err(EngineError::Precondition(format!(
            "VM {dst_vm} already exists on {}",
            opts.dst_server
        )));
    }
    if opts.disks.is_empty() {
        return Ok(());
    }
    let sizes: BTreeMap<String, u64> = opts
        .disks
        .iter()
        .map(|d| (opts.dst_disk_path(d).to_owned(), d.virtual_size))
        .collect();
    remote.check_disk_capacity(&sizes).await
}
