//! Live migration of a running VM to another host.
//!
//! The task provisions an incoming instance on the destination, then runs
//! two phases side by side: every disk is mirrored to the destination's
//! export server, and the VM state is streamed once all mirrors are in
//! sync. Two gates order the phases:
//!
//! - `disks_ready` opens after every mirror job reports `ready`; the state
//!   transfer does not begin before it.
//! - `vm_migrated` opens once the state transfer has completed; the mirror
//!   jobs are not completed before it.
//!
//! Any failure or cancellation runs compensation on both hosts before the
//! task terminates.

use std::net::IpAddr;
use std::sync::Arc;

use ferry_core::{MigrationOptions, MigrationStat, TaskId, TaskStatus};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::gate::Gate;
use crate::qmp::QmpPool;
use crate::remote::RemoteControl;
use crate::stats::{self, StatCell, StatSender};
use crate::store::StatStore;
use crate::task::{bounded, first_error, grouped, interruptible, Task};
use crate::{EngineConfig, EngineError};

mod mirror;
mod state;

/// Shared services a migration runs against.
#[derive(Clone)]
pub(crate) struct MigrationContext {
    pub qmp: Arc<QmpPool>,
    pub remote: Arc<dyn RemoteControl>,
    pub store: Arc<StatStore>,
    pub config: EngineConfig,
}

/// A registered migration of one VM.
#[derive(Debug)]
pub struct MigrationTask {
    id: TaskId,
    opts: Arc<MigrationOptions>,
    task: Task,
    stat: StatCell<MigrationStat>,
}

impl MigrationTask {
    pub(crate) fn new(opts: MigrationOptions) -> Self {
        let disks = opts.disks.iter().map(|d| d.path.clone());
        let stat = StatCell::new(MigrationStat::new(opts.dst_server.clone(), disks));
        Self {
            id: TaskId::migration(opts.vm_name.clone()),
            opts: Arc::new(opts),
            task: Task::new(),
            stat,
        }
    }

    #[must_use]
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    #[must_use]
    pub fn options(&self) -> &MigrationOptions {
        &self.opts
    }

    /// Consistent copy of the current statistics.
    #[must_use]
    pub fn stat(&self) -> MigrationStat {
        self.stat.snapshot()
    }

    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.task.in_progress()
    }

    /// # Errors
    /// Returns [`EngineError::TaskNotRunning`] if the migration already ended.
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

    pub(crate) fn start(&self, ctx: MigrationContext) -> Result<(), EngineError> {
        let (stats, aggregate) = stats::channel(&self.stat);
        let opts = Arc::clone(&self.opts);
        let store = Arc::clone(&ctx.store);

        self.task.start(move |cancel| async move {
            let vm_name = opts.vm_name.clone();
            let migration = Migration { ctx, opts, stats };
            let (result, last) = tokio::join!(migration.run(cancel), aggregate);
            if let Err(e) = store.save_migration(&vm_name, &last).await {
                tracing::warn!(vm = %vm_name, error = %e, "failed to persist migration stat");
            }
            result
        })
    }
}

/// One run of the orchestration. Dropping it closes the stat stream.
struct Migration {
    ctx: MigrationContext,
    opts: Arc<MigrationOptions>,
    stats: StatSender,
}

impl Migration {
    fn vm(&self) -> &str {
        &self.opts.vm_name
    }

    async fn run(self, cancel: CancellationToken) -> Result<(), EngineError> {
        tracing::info!(vm = %self.vm(), dst = %self.opts.dst_server, disks = self.opts.disks.len(), "migration started");
        self.stats.status(TaskStatus::InMigrate);

        match self.migrate(&cancel).await {
            Ok(()) => {
                self.stats.status(TaskStatus::Completed);
                tracing::info!(vm = %self.vm(), dst = %self.opts.dst_server, "migration completed");
                if !cancel.is_cancelled() {
                    self.quit_source().await;
                }
                Ok(())
            }
            Err(e) => {
                let interrupted = e.is_interrupted() && cancel.is_cancelled();
                if interrupted {
                    tracing::warn!(vm = %self.vm(), "migration interrupted, rolling back");
                } else {
                    tracing::error!(vm = %self.vm(), error = %e, "migration failed, rolling back");
                }
                self.compensate().await;
                self.stats.error(e.to_string());
                self.stats.status(if interrupted { TaskStatus::Interrupted } else { TaskStatus::Failed });
                Err(e)
            }
        }
    }

    async fn migrate(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let addr = self.opts.primary_addr()?;
        let remote = &self.ctx.remote;

        let config = &self.ctx.config;

        let incoming_port = interruptible(
            cancel,
            bounded(
                "incoming instance startup",
                config.incoming_timeout,
                remote.start_incoming_instance(&self.opts.manifest, &self.opts.extra_files),
            ),
        )
        .await?;
        tracing::debug!(vm = %self.vm(), port = incoming_port, "incoming instance started");

        let export_port = if self.opts.disks.is_empty() {
            None
        } else {
            let targets: Vec<String> = self.opts.disks.iter().map(|d| self.opts.dst_disk_path(d).to_owned()).collect();
            let port = interruptible(
                cancel,
                bounded(
                    "export server startup",
                    config.remote_timeout,
                    remote.start_export_server(self.opts.dst_vm_name(), addr, &targets),
                ),
            )
            .await?;
            tracing::debug!(vm = %self.vm(), port, "export server started");
            Some(port)
        };

        let disks_ready = if export_port.is_some() { Gate::new() } else { Gate::opened() };
        let vm_migrated = Gate::new();
        let group = cancel.child_token();

        let mirror_phase = grouped(&group, async {
            match export_port {
                Some(port) => mirror::run(self, Endpoint { addr, port }, &disks_ready, &vm_migrated, &group).await,
                None => Ok(()),
            }
        });
        let state_phase = grouped(
            &group,
            state::run(self, Endpoint { addr, port: incoming_port }, &disks_ready, &vm_migrated, &group),
        );
        let (mirrored, transferred) = tokio::join!(mirror_phase, state_phase);
        first_error(mirrored, transferred)?;

        if export_port.is_some() {
            let stop = remote.stop_export_server(self.opts.dst_vm_name());
            if let Err(e) = bounded("export server stop", config.remote_timeout, stop).await {
                tracing::warn!(vm = %self.vm(), error = %e, "failed to stop export server");
            }
        }
        let resume = remote.send_continue(self.opts.dst_vm_name());
        if let Err(e) = bounded("continue", config.remote_timeout, resume).await {
            tracing::warn!(vm = %self.vm(), error = %e, "destination did not acknowledge continue");
        }
        Ok(())
    }

    /// Best-effort rollback on both hosts. Never fails.
    async fn compensate(&self) {
        for disk in &self.opts.disks {
            let job = mirror::job_id(disk);
            match self
                .ctx
                .qmp
                .run(self.vm(), "block-job-cancel", Some(json!({ "device": job, "force": true })))
                .await
            {
                Ok(_) => tracing::debug!(vm = %self.vm(), disk = %disk.path, job = %job, "mirror job cancelled"),
                Err(e) if e.is_job_not_found() => {}
                Err(e) => tracing::warn!(vm = %self.vm(), job = %job, error = %e, "failed to cancel mirror job"),
            }
        }

        if let Err(e) = self.ctx.qmp.run(self.vm(), "migrate_cancel", None).await {
            tracing::warn!(vm = %self.vm(), error = %e, "failed to cancel state transfer");
        }

        let dst_vm = self.opts.dst_vm_name();
        let remove = self.ctx.remote.remove_config(dst_vm);
        if let Err(e) = bounded("config removal", self.ctx.config.remote_timeout, remove).await {
            tracing::warn!(vm = %self.vm(), dst_vm, error = %e, "failed to remove destination config");
        }
    }

    async fn quit_source(&self) {
        match self.ctx.qmp.run(self.vm(), "quit", None).await {
            Ok(_) => tracing::info!(vm = %self.vm(), "source instance stopped"),
            Err(e) => tracing::warn!(vm = %self.vm(), error = %e, "failed to stop source instance"),
        }
    }
}

/// Address of a listener on the destination host.
#[derive(Debug, Clone, Copy)]
struct Endpoint {
    addr: IpAddr,
    port: u16,
}

impl Endpoint {
    /// `host:port` form, bracketing IPv6 addresses.
    fn host_port(self) -> String {
        match self.addr {
            IpAddr::V4(ip) => format!("{ip}:{}", self.port),
            IpAddr::V6(ip) => format!("[{ip}]:{}", self.port),
        }
    }
}
