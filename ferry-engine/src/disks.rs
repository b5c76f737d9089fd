//! Disk discovery from a running VM.

use ferry_core::{DiskBackend, DiskDescriptor};
use serde::Deserialize;

use crate::qmp::QmpPool;
use crate::EngineError;

/// Drivers whose data lives on another host.
const NETWORK_DRIVERS: &[&str] = &["nbd", "rbd", "iscsi", "gluster", "sheepdog", "http", "https"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct BlockInfo {
    device: String,
    #[serde(default)]
    qdev: Option<String>,
    #[serde(default)]
    inserted: Option<Inserted>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Inserted {
    file: String,
    drv: String,
    #[serde(default)]
    image: Option<ImageInfo>,
    #[serde(default)]
    dirty_bitmaps: Vec<BitmapInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ImageInfo {
    virtual_size: u64,
}

#[derive(Debug, Deserialize)]
struct BitmapInfo {
    name: String,
}

/// Lists the VM's disks with media inserted, in monitor order.
///
/// # Errors
/// Propagates monitor errors, or [`EngineError::Protocol`] if the reply
/// has an unexpected shape.
pub async fn query_disks(pool: &QmpPool, vm_name: &str) -> Result<Vec<DiskDescriptor>, EngineError> {
    let blocks: Vec<BlockInfo> = pool.run_as(vm_name, "query-block", None).await?;
    Ok(blocks.into_iter().filter_map(describe).collect())
}

fn describe(block: BlockInfo) -> Option<DiskDescriptor> {
    let inserted = block.inserted?;
    let network = NETWORK_DRIVERS.contains(&inserted.drv.as_str())
        || inserted.file.split_once(':').is_some_and(|(scheme, _)| NETWORK_DRIVERS.contains(&scheme));

    let device = if block.device.is_empty() { block.qdev.unwrap_or_default() } else { block.device };
    Some(DiskDescriptor {
        path: inserted.file,
        device,
        backend: if network { DiskBackend::Network } else { DiskBackend::Local },
        virtual_size: inserted.image.map_or(0, |i| i.virtual_size),
        bitmaps: inserted.dirty_bitmaps.into_iter().map(|b| b.name).collect(),
    })
}
