//! Task options, built once at task start and immutable afterwards.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{CoreError, DiskDescriptor};

/// Checks that `name` can name a VM.
///
/// VM names end up in file names under the state directory, so path
/// separators and the `.`/`..` entries are refused.
///
/// # Errors
/// Returns [`CoreError::InvalidOption`] for an unusable name.
pub fn check_vm_name(name: &str) -> Result<(), CoreError> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if name == "." || name == ".." {
        "must not be a directory entry"
    } else if name.contains(['/', '\\', '\0']) {
        "must not contain path separators or NUL"
    } else {
        return Ok(());
    };
    Err(CoreError::InvalidOption {
        field: "vm_name".to_owned(),
        reason: reason.to_owned(),
    })
}

/// Renames applied on the destination host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Overrides {
    /// New VM name on the destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_name: Option<String>,
    /// Source disk path to destination disk path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub disks: BTreeMap<String, String>,
}

/// Everything a migration task needs to move a VM to another host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOptions {
    pub vm_name: String,
    /// Destination host name.
    pub dst_server: String,
    /// Resolved destination addresses; the first one carries the traffic.
    pub dst_addrs: Vec<IpAddr>,
    /// Serialized VM configuration used to recreate the VM remotely.
    pub manifest: Vec<u8>,
    /// Auxiliary files shipped alongside the manifest.
    #[serde(default)]
    pub extra_files: BTreeMap<String, Vec<u8>>,
    /// Disks whose content is mirrored to the destination.
    #[serde(default)]
    pub disks: Vec<DiskDescriptor>,
    #[serde(default)]
    pub overrides: Overrides,
}

impl MigrationOptions {
    /// Checks the invariants the orchestration relies on.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidOption`] for an unusable VM name, no
    /// destination address, a network-backed disk, or two entries sharing a
    /// path or device.
    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |field: &str, reason: String| CoreError::InvalidOption {
            field: field.to_owned(),
            reason,
        };

        check_vm_name(&self.vm_name)?;
        if self.dst_addrs.is_empty() {
            return Err(invalid("dst_addrs", format!("no address resolved for {}", self.dst_server)));
        }
        for (i, disk) in self.disks.iter().enumerate() {
            if !disk.is_local() {
                return Err(invalid("disks", format!("{} is not a local disk", disk.path)));
            }
            if self.disks[..i].iter().any(|d| d.path == disk.path) {
                return Err(invalid("disks", format!("{} is listed twice", disk.path)));
            }
            if disk.device.is_empty() {
                return Err(invalid("disks", format!("{} has no device name", disk.path)));
            }
            if self.disks[..i].iter().any(|d| d.job_id("") == disk.job_id("")) {
                return Err(invalid(
                    "disks",
                    format!("{} and another disk share device {}", disk.path, disk.device),
                ));
            }
        }
        Ok(())
    }

    /// Address used for both the state transfer and the export server.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidOption`] when no address was resolved.
    pub fn primary_addr(&self) -> Result<IpAddr, CoreError> {
        self.dst_addrs.first().copied().ok_or_else(|| CoreError::InvalidOption {
            field: "dst_addrs".to_owned(),
            reason: format!("no address resolved for {}", self.dst_server),
        })
    }

    /// VM name on the destination host.
    #[must_use]
    pub fn dst_vm_name(&self) -> &str {
        self.overrides.vm_name.as_deref().unwrap_or(&self.vm_name)
    }

    /// Disk path on the destination host.
    #[must_use]
    pub fn dst_disk_path<'a>(&'a self, disk: &'a DiskDescriptor) -> &'a str {
        self.overrides.disks.get(&disk.path).map_or(disk.path.as_str(), String::as_str)
    }
}

/// How a disk copy treats the change-tracking bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum CopyMode {
    /// No bitmap yet: add one and copy everything.
    Full,
    /// Copy only blocks recorded in the existing bitmap.
    Incremental,
    /// Clear the existing bitmap and copy everything.
    ResetAndFull,
}

impl CopyMode {
    /// Picks the mode from the bitmap state and the caller's reset request.
    #[must_use]
    pub fn select(has_bitmap: bool, reset_requested: bool) -> Self {
        match (has_bitmap, reset_requested) {
            (false, _) => Self::Full,
            (true, false) => Self::Incremental,
            (true, true) => Self::ResetAndFull,
        }
    }
}

/// Restricted filesystem view of a VM process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chroot {
    pub root: PathBuf,
    pub uid: u32,
    pub gid: u32,
}

/// Options of a single-disk copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskCopyingOptions {
    pub vm_name: String,
    pub disk: DiskDescriptor,
    /// Destination file or block device on the host.
    pub target: PathBuf,
    /// Clear the change-tracking bitmap and start over with a full copy.
    #[serde(default)]
    pub reset_bitmap: bool,
    pub bitmap_name: String,
    /// Set when the VM runs confined; block device targets are then
    /// materialized inside this root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chroot: Option<Chroot>,
}

impl DiskCopyingOptions {
    #[must_use]
    pub fn mode(&self) -> CopyMode {
        CopyMode::select(self.disk.has_bitmap(&self.bitmap_name), self.reset_bitmap)
    }
}
