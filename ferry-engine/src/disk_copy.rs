//! Copying a single disk of a running VM to a local target.
//!
//! A `drive-backup` job copies the disk while the guest keeps running. The
//! copy mode depends on the disk's change-tracking bitmap: without one a
//! bitmap is added and everything is copied, with one only the recorded
//! changes are copied, and on request the bitmap is cleared first.

use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ferry_core::{Chroot, CopyMode, DiskCopyingOptions, DiskCopyingStat, Progress, TaskId, TaskStatus};
use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::{chown, Gid, Uid};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::qmp::protocol::{
    fields, EVENT_BLOCK_JOB_CANCELLED, EVENT_BLOCK_JOB_COMPLETED, EVENT_BLOCK_JOB_ERROR, EVENT_JOB_STATUS_CHANGE,
};
use crate::qmp::{BlockJobInfo, QmpPool, TransactionAction};
use crate::stats::{self, SpeedMeter, StatCell, StatSender};
use crate::store::StatStore;
use crate::task::{pause, Task};
use crate::{EngineConfig, EngineError};

#[derive(Clone)]
pub(crate) struct CopyContext {
    pub qmp: Arc<QmpPool>,
    pub store: Arc<StatStore>,
    pub config: EngineConfig,
}

/// A registered copy of one disk.
#[derive(Debug)]
pub struct DiskCopyingTask {
    id: TaskId,
    opts: Arc<DiskCopyingOptions>,
    task: Task,
    stat: StatCell<DiskCopyingStat>,
}

impl DiskCopyingTask {
    pub(crate) fn new(opts: DiskCopyingOptions) -> Self {
        let stat = DiskCopyingStat::new(opts.disk.path.clone(), opts.target.display().to_string());
        Self {
            id: TaskId::disk_copying(opts.disk.path.clone(), opts.vm_name.clone()),
            opts: Arc::new(opts),
            task: Task::new(),
            stat: StatCell::new(stat),
        }
    }

    #[must_use]
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    #[must_use]
    pub fn options(&self) -> &DiskCopyingOptions {
        &self.opts
    }

    #[must_use]
    pub fn stat(&self) -> DiskCopyingStat {
        self.stat.snapshot()
    }

    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.task.in_progress()
    }

    /// # Errors
    /// Returns [`EngineError::TaskNotRunning`] if the copy already ended.
    pub fn cancel(&self) -> Result<(), EngineError> {
        self.task.cancel()
    }

    pub async fn wait(&self) {
        self.task.wait().await;
    }

    #[must_use]
    pub fn err(&self) -> Option<Arc<EngineError>> {
        self.task.err()
    }

    pub(crate) fn start(&self, ctx: CopyContext) -> Result<(), EngineError> {
        let (stats, aggregate) = stats::channel(&self.stat);
        let opts = Arc::clone(&self.opts);
        let store = Arc::clone(&ctx.store);

        self.task.start(move |cancel| async move {
            let vm_name = opts.vm_name.clone();
            let copy = DiskCopy { ctx, opts, stats };
            let (result, last) = tokio::join!(copy.run(cancel), aggregate);
            if let Err(e) = store.save_disk_copying(&vm_name, &last).await {
                tracing::warn!(vm = %vm_name, error = %e, "failed to persist disk copying stat");
            }
            result
        })
    }
}

struct DiskCopy {
    ctx: CopyContext,
    opts: Arc<DiskCopyingOptions>,
    stats: StatSender,
}

impl DiskCopy {
    fn vm(&self) -> &str {
        &self.opts.vm_name
    }

    fn job(&self) -> String {
        self.opts.disk.job_id("copy")
    }

    fn backup_error(&self, reason: impl Into<String>) -> EngineError {
        EngineError::Backup { disk: self.opts.disk.path.clone(), reason: reason.into() }
    }

    async fn run(self, cancel: CancellationToken) -> Result<(), EngineError> {
        let mode = self.opts.mode();
        tracing::info!(vm = %self.vm(), disk = %self.opts.disk.path, target = %self.opts.target.display(), ?mode, "disk copy started");
        self.stats.status(TaskStatus::InProgress);

        let result = match self.prepare_target() {
            Ok(target) => {
                let res = self.copy(mode, &target.path, target.block, &cancel).await;
                drop(target);
                res
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                self.stats.disk(&self.opts.disk.path, Progress::done(self.opts.disk.virtual_size));
                self.stats.status(TaskStatus::Completed);
                tracing::info!(vm = %self.vm(), disk = %self.opts.disk.path, "disk copy completed");
            }
            Err(e) => {
                let interrupted = e.is_interrupted() && cancel.is_cancelled();
                if interrupted {
                    tracing::warn!(vm = %self.vm(), disk = %self.opts.disk.path, "disk copy interrupted");
                } else {
                    tracing::error!(vm = %self.vm(), disk = %self.opts.disk.path, error = %e, "disk copy failed");
                }
                self.stats.error(e.to_string());
                self.stats.status(if interrupted { TaskStatus::Interrupted } else { TaskStatus::Failed });
            }
        }
        result
    }

    /// Resolves the path QEMU writes to, materializing a device node in
    /// the VM's chroot when the target is a block device.
    fn prepare_target(&self) -> Result<Target, EngineError> {
        let target = &self.opts.target;
        let block = std::fs::metadata(target).ok().filter(|m| m.file_type().is_block_device());
        match (&self.opts.chroot, block) {
            (Some(chroot), Some(meta)) => Ok(Target {
                path: chrooted_path(target),
                block: true,
                _node: Some(DeviceNode::create(chroot, target, meta.rdev())?),
            }),
            (_, block) => Ok(Target { path: target.clone(), block: block.is_some(), _node: None }),
        }
    }

    async fn copy(
        &self,
        mode: CopyMode,
        target: &Path,
        existing: bool,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let job = self.job();
        let started_at = Utc::now();

        if let Err(e) = self.start_backup(mode, &job, target, existing).await {
            return Err(self.backup_error(format!("start: {e}")));
        }

        let result = self.follow(&job, started_at, cancel).await;
        if result.is_err() {
            self.cancel_job(&job).await;
        }
        result
    }

    async fn start_backup(&self, mode: CopyMode, job: &str, target: &Path, existing: bool) -> Result<Value, EngineError> {
        let disk = &self.opts.disk;
        let bitmap = json!({ "node": disk.device, "name": self.opts.bitmap_name });
        let mut backup = json!({
            "job-id": job,
            "device": disk.device,
            "target": target.display().to_string(),
            "format": "raw",
            "mode": if existing { "existing" } else { "absolute-paths" },
            "sync": "full",
        });

        match mode {
            CopyMode::Incremental => {
                backup["sync"] = json!("incremental");
                backup["bitmap"] = json!(self.opts.bitmap_name);
                self.ctx.qmp.run(self.vm(), "drive-backup", Some(backup)).await
            }
            CopyMode::ResetAndFull => {
                let actions = [
                    TransactionAction::new("block-dirty-bitmap-clear", bitmap),
                    TransactionAction::new("drive-backup", backup),
                ];
                self.ctx.qmp.run_transaction(self.vm(), &actions).await
            }
            // Full, and any future mode, starts tracking from scratch.
            _ => {
                let actions = [
                    TransactionAction::new("block-dirty-bitmap-add", bitmap),
                    TransactionAction::new("drive-backup", backup),
                ];
                self.ctx.qmp.run_transaction(self.vm(), &actions).await
            }
        }
    }

    /// Waits for the job to start, then polls it until it concludes.
    async fn follow(&self, job: &str, started_at: DateTime<Utc>, cancel: &CancellationToken) -> Result<(), EngineError> {
        let qmp = &self.ctx.qmp;
        qmp.wait_event(
            self.vm(),
            EVENT_JOB_STATUS_CHANGE,
            &fields([("id", json!(job)), ("status", json!("running"))]),
            started_at,
            self.ctx.config.job_start_timeout,
            cancel,
        )
        .await?;

        let mut meter = SpeedMeter::default();
        loop {
            let jobs: Vec<BlockJobInfo> = qmp.run_as(self.vm(), "query-block-jobs", None).await?;
            let Some(info) = jobs.iter().find(|j| j.device == job) else {
                return self.concluded(job, started_at);
            };
            let speed = meter.sample(info.offset);
            let progress = Progress::from_counters(info.len, info.offset).with_speed(speed);
            tracing::debug!(disk = %self.opts.disk.path, percent = progress.percent, speed_mbps = speed, "copy progress");
            self.stats.disk(&self.opts.disk.path, progress);

            pause(self.ctx.config.poll_interval, cancel).await?;
        }
    }

    /// Classifies a job that left `query-block-jobs` from its recorded events.
    fn concluded(&self, job: &str, since: DateTime<Utc>) -> Result<(), EngineError> {
        let filter = fields([("device", json!(job))]);
        let qmp = &self.ctx.qmp;

        if let Some(ev) = qmp.find_events(self.vm(), EVENT_BLOCK_JOB_ERROR, &filter, since)?.first() {
            let op = ev.data.get("operation").and_then(Value::as_str).unwrap_or("backup");
            return Err(self.backup_error(format!("I/O error during {op}")));
        }
        if !qmp.find_events(self.vm(), EVENT_BLOCK_JOB_CANCELLED, &filter, since)?.is_empty() {
            return Err(self.backup_error("job was cancelled"));
        }
        let completed = qmp.find_events(self.vm(), EVENT_BLOCK_JOB_COMPLETED, &filter, since)?;
        if let Some(reason) = completed.iter().find_map(|ev| ev.data.get("error").and_then(Value::as_str)) {
            return Err(self.backup_error(reason));
        }
        Ok(())
    }

    async fn cancel_job(&self, job: &str) {
        match self
            .ctx
            .qmp
            .run(self.vm(), "block-job-cancel", Some(json!({ "device": job, "force": true })))
            .await
        {
            Ok(_) => tracing::debug!(vm = %self.vm(), job, "copy job cancelled"),
            Err(e) if e.is_job_not_found() => {}
            Err(e) => tracing::warn!(vm = %self.vm(), job, error = %e, "failed to cancel copy job"),
        }
    }
}

/// Where QEMU writes the copy. Holding it keeps any device node alive.
struct Target {
    path: PathBuf,
    /// Block devices already exist and must not be recreated by QEMU.
    block: bool,
    _node: Option<DeviceNode>,
}

/// Path of `target` as seen from inside the chroot.
fn chrooted_path(target: &Path) -> PathBuf {
    Path::new("/").join(target.strip_prefix("/").unwrap_or(target))
}

/// A block device node created inside a chroot. Removed on drop.
#[derive(Debug)]
struct DeviceNode {
    path: PathBuf,
}

impl DeviceNode {
    fn create(chroot: &Chroot, target: &Path, rdev: u64) -> Result<Self, EngineError> {
        let path = chroot.root.join(target.strip_prefix("/").unwrap_or(target));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        mknod(&path, SFlag::S_IFBLK, Mode::from_bits_truncate(0o600), rdev).map_err(std::io::Error::from)?;

        let node = Self { path };
        chown(&node.path, Some(Uid::from_raw(chroot.uid)), Some(Gid::from_raw(chroot.gid)))
            .map_err(std::io::Error::from)?;
        tracing::debug!(path = %node.path.display(), "device node created");
        Ok(node)
    }
}

impl Drop for DeviceNode {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "device node removed"),
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "failed to remove device node"),
        }
    }
}
