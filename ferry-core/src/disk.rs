use serde::{Deserialize, Serialize};

/// Where a disk's data physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum DiskBackend {
    /// Local block storage (LVM volume, raw device, image file).
    Local,
    /// Network backend (NBD, iSCSI, RBD). Not copied during migration.
    Network,
}

/// A disk of a running VM as reported by the monitor.
///
/// Read once when a task starts and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    /// Host path of the disk; the stable identifier in statistics.
    pub path: String,
    /// Monitor device name, used as the block job device.
    pub device: String,
    pub backend: DiskBackend,
    /// Virtual size in bytes.
    pub virtual_size: u64,
    /// Names of dirty bitmaps attached to the disk.
    #[serde(default)]
    pub bitmaps: Vec<String>,
}

impl DiskDescriptor {
    pub fn local(path: impl Into<String>, device: impl Into<String>, virtual_size: u64) -> Self {
        Self {
            path: path.into(),
            device: device.into(),
            backend: DiskBackend::Local,
            virtual_size,
            bitmaps: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.backend == DiskBackend::Local
    }

    #[must_use]
    pub fn has_bitmap(&self, name: &str) -> bool {
        self.bitmaps.iter().any(|b| b == name)
    }

    /// Block job identifier for a `prefix` job on this disk.
    ///
    /// Built from the device name, which is unique within a VM. Characters
    /// QEMU does not accept in ids become `_`.
    #[must_use]
    pub fn job_id(&self, prefix: &str) -> String {
        let device: String = self
            .device
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') { c } else { '_' })
            .collect();
        format!("{prefix}_{device}")
    }
}
