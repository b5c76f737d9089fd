//! VM state transfer phase.

use ferry_core::Progress;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{Endpoint, Migration};
use crate::gate::Gate;
use crate::qmp::MigrationInfo;
use crate::stats::SpeedMeter;
use crate::task::pause;
use crate::EngineError;

/// Capabilities set before the transfer. Block data moves through the
/// mirror jobs, so the built-in block migration stays off.
const CAPABILITIES: &[(&str, bool)] = &[
    ("xbzrle", true),
    ("auto-converge", true),
    ("dirty-bitmaps", true),
    ("compress", false),
    ("block", false),
];

fn capabilities() -> Value {
    let caps: Vec<Value> = CAPABILITIES
        .iter()
        .map(|(name, state)| json!({ "capability": name, "state": state }))
        .collect();
    json!({ "capabilities": caps })
}

pub(super) async fn run(
    m: &Migration,
    incoming: Endpoint,
    disks_ready: &Gate,
    vm_migrated: &Gate,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    disks_ready.wait(cancel).await?;

    let qmp = &m.ctx.qmp;
    let config = &m.ctx.config;
    qmp.run(m.vm(), "migrate-set-capabilities", Some(capabilities())).await?;
    qmp.run(
        m.vm(),
        "migrate-set-parameters",
        Some(json!({
            "max-bandwidth": config.max_bandwidth,
            "xbzrle-cache-size": config.xbzrle_cache_size,
        })),
    )
    .await?;

    let uri = format!("tcp:{}", incoming.host_port());
    qmp.run(m.vm(), "migrate", Some(json!({ "uri": uri }))).await?;
    tracing::info!(vm = %m.vm(), %uri, "state transfer started");

    let mut meter = SpeedMeter::default();
    loop {
        pause(config.poll_interval, cancel).await?;

        let info: MigrationInfo = qmp.run_as(m.vm(), "query-migrate", None).await?;
        let ram = info.ram.unwrap_or_default();
        match info.status.as_deref() {
            Some("completed") => {
                m.stats.qemu(Progress::done(ram.total.max(ram.transferred)));
                vm_migrated.open();
                tracing::info!(vm = %m.vm(), "state transfer completed");
                return Ok(());
            }
            Some(status @ ("failed" | "cancelled")) => {
                let reason = info.error_desc.unwrap_or_else(|| format!("state transfer {status}"));
                return Err(EngineError::Migration(reason));
            }
            status => {
                let speed = meter.sample(ram.transferred);
                let progress = Progress::from_counters(ram.total, ram.transferred).with_speed(speed);
                tracing::debug!(vm = %m.vm(), status = status.unwrap_or("none"), percent = progress.percent, "state transfer progress");
                m.stats.qemu(progress);
            }
        }
    }
}
