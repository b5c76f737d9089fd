//! Disk mirroring phase.
//!
//! One `drive-mirror` job per disk streams the disk to the destination's
//! NBD export. The phase reports progress until every job is `ready`,
//! opens the `disks_ready` gate, keeps reporting while the VM state
//! transfers, and completes the jobs once `vm_migrated` opens.

use chrono::{DateTime, Utc};
use ferry_core::{DiskDescriptor, Progress};
use futures::future::try_join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{Endpoint, Migration};
use crate::gate::Gate;
use crate::qmp::protocol::{
    fields, EVENT_BLOCK_JOB_COMPLETED, EVENT_BLOCK_JOB_ERROR, EVENT_JOB_STATUS_CHANGE,
};
use crate::qmp::BlockJobInfo;
use crate::stats::SpeedMeter;
use crate::task::pause;
use crate::EngineError;

/// Block job identifier of the mirror for `disk`.
pub(super) fn job_id(disk: &DiskDescriptor) -> String {
    disk.job_id("migr")
}

/// One disk's mirror job.
struct Leg<'a> {
    disk: &'a DiskDescriptor,
    job: String,
    started_at: DateTime<Utc>,
    meter: SpeedMeter,
}

impl Leg<'_> {
    fn mirror_error(&self, reason: impl Into<String>) -> EngineError {
        EngineError::Mirror {
            disk: self.disk.path.clone(),
            job: self.job.clone(),
            reason: reason.into(),
        }
    }
}

pub(super) async fn run(
    m: &Migration,
    export: Endpoint,
    disks_ready: &Gate,
    vm_migrated: &Gate,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    let mut legs = try_join_all(m.opts.disks.iter().map(|disk| start_and_sync(m, disk, export, cancel))).await?;

    disks_ready.open();
    tracing::info!(vm = %m.vm(), disks = legs.len(), "all disks in sync");

    // Keep the stat live while the state transfer runs.
    loop {
        publish(m, &mut legs).await?;
        tokio::select! {
            biased;
            res = vm_migrated.wait(cancel) => {
                res?;
                break;
            }
            () = tokio::time::sleep(m.ctx.config.poll_interval) => {}
        }
    }

    try_join_all(legs.iter().map(|leg| complete(m, leg, cancel))).await?;
    Ok(())
}

/// Starts the mirror of `disk` and waits until its job is `ready`.
async fn start_and_sync<'a>(
    m: &Migration,
    disk: &'a DiskDescriptor,
    export: Endpoint,
    cancel: &CancellationToken,
) -> Result<Leg<'a>, EngineError> {
    let mut leg = Leg {
        disk,
        job: job_id(disk),
        started_at: Utc::now(),
        meter: SpeedMeter::default(),
    };
    let target = format!("nbd:{}:exportname={}", export.host_port(), m.opts.dst_disk_path(disk));

    m.ctx
        .qmp
        .run(
            m.vm(),
            "drive-mirror",
            Some(json!({
                "job-id": leg.job,
                "device": disk.device,
                "target": target,
                "sync": "full",
                "mode": "existing",
                "format": "raw",
            })),
        )
        .await
        .map_err(|e| leg.mirror_error(format!("start: {e}")))?;

    m.ctx
        .qmp
        .wait_event(
            m.vm(),
            EVENT_JOB_STATUS_CHANGE,
            &fields([("id", json!(leg.job)), ("status", json!("running"))]),
            leg.started_at,
            m.ctx.config.job_start_timeout,
            cancel,
        )
        .await?;
    tracing::debug!(vm = %m.vm(), disk = %disk.path, job = %leg.job, "mirror job running");

    loop {
        let jobs = query_jobs(m).await?;
        let info = match jobs.iter().find(|j| j.device == leg.job) {
            Some(info) => info,
            None => return Err(vanished(m, &leg)),
        };
        report(m, &mut leg, info);
        if info.ready {
            tracing::debug!(vm = %m.vm(), disk = %disk.path, job = %leg.job, "mirror job ready");
            return Ok(leg);
        }
        pause(m.ctx.config.poll_interval, cancel).await?;
    }
}

async fn query_jobs(m: &Migration) -> Result<Vec<BlockJobInfo>, EngineError> {
    m.ctx.qmp.run_as(m.vm(), "query-block-jobs", None).await
}

/// Publishes progress of every leg from a single job listing.
async fn publish(m: &Migration, legs: &mut [Leg<'_>]) -> Result<(), EngineError> {
    let jobs = query_jobs(m).await?;
    for leg in legs.iter_mut() {
        match jobs.iter().find(|j| j.device == leg.job) {
            Some(info) => report(m, leg, info),
            None => return Err(vanished(m, leg)),
        }
    }
    Ok(())
}

fn report(m: &Migration, leg: &mut Leg<'_>, info: &BlockJobInfo) {
    let speed = leg.meter.sample(info.offset);
    let progress = Progress::from_counters(info.len, info.offset).with_speed(speed);
    tracing::debug!(disk = %leg.disk.path, percent = progress.percent, speed_mbps = speed, "mirror progress");
    m.stats.disk(&leg.disk.path, progress);
}

/// Explains a job missing from `query-block-jobs` before completion.
fn vanished(m: &Migration, leg: &Leg<'_>) -> EngineError {
    let errors = m
        .ctx
        .qmp
        .find_events(m.vm(), EVENT_BLOCK_JOB_ERROR, &fields([("device", json!(leg.job))]), leg.started_at)
        .unwrap_or_default();
    match errors.first() {
        Some(ev) => leg.mirror_error(format!(
            "I/O error during {}",
            ev.data.get("operation").and_then(|v| v.as_str()).unwrap_or("mirror")
        )),
        None => leg.mirror_error("job disappeared before completion"),
    }
}

/// Completes the mirror job after the state transfer has finished.
///
/// A job that is already gone counts as concluded unless an error event
/// was recorded for it.
async fn complete(m: &Migration, leg: &Leg<'_>, cancel: &CancellationToken) -> Result<(), EngineError> {
    let filter = fields([("device", json!(leg.job))]);
    let after = Utc::now();

    match m
        .ctx
        .qmp
        .run(m.vm(), "block-job-complete", Some(json!({ "device": leg.job })))
        .await
    {
        Ok(_) => {
            let ev = m
                .ctx
                .qmp
                .wait_event(m.vm(), EVENT_BLOCK_JOB_COMPLETED, &filter, after, m.ctx.config.job_finish_timeout, cancel)
                .await?;
            if let Some(reason) = ev.data.get("error").and_then(|v| v.as_str()) {
                return Err(leg.mirror_error(reason));
            }
        }
        Err(e) if e.is_job_not_found() => {
            if !m.ctx.qmp.find_events(m.vm(), EVENT_BLOCK_JOB_ERROR, &filter, leg.started_at)?.is_empty() {
                return Err(vanished(m, leg));
            }
            let completed = m.ctx.qmp.find_events(m.vm(), EVENT_BLOCK_JOB_COMPLETED, &filter, leg.started_at)?;
            if let Some(reason) = completed.iter().find_map(|ev| ev.data.get("error").and_then(|v| v.as_str())) {
                return Err(leg.mirror_error(reason));
            }
            tracing::debug!(vm = %m.vm(), job = %leg.job, "mirror job already concluded");
        }
        Err(e) => return Err(leg.mirror_error(format!("complete: {e}"))),
    }

    m.stats.disk(&leg.disk.path, Progress::done(leg.disk.virtual_size));
    tracing::debug!(vm = %m.vm(), disk = %leg.disk.path, job = %leg.job, "mirror job completed");
    Ok(())
}
