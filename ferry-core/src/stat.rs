//! Pollable task statistics.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a migration or disk-copying task.
///
/// `starting → {inmigrate | inprogress} → {completed | interrupted | failed}`.
/// `None` is reported when no task has ever run under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum TaskStatus {
    #[default]
    None,
    Starting,
    InMigrate,
    InProgress,
    Completed,
    Interrupted,
    Failed,
}

impl TaskStatus {
    /// Returns `true` for `completed`, `interrupted` and `failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Interrupted | Self::Failed)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Starting => "starting",
            Self::InMigrate => "inmigrate",
            Self::InProgress => "inprogress",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer progress of one stream: the VM state or a single disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    pub total: u64,
    pub remaining: u64,
    pub transferred: u64,
    pub percent: u8,
    /// Transfer speed in megabits per second.
    pub speed_mbps: u64,
}

impl Progress {
    /// Builds a progress report from a total and a transferred byte count.
    ///
    /// `transferred` is clamped to `total`. A zero total reports 100%.
    #[must_use]
    pub fn from_counters(total: u64, transferred: u64) -> Self {
        let transferred = transferred.min(total);
        Self {
            total,
            remaining: total - transferred,
            transferred,
            percent: percent_of(transferred, total),
            speed_mbps: 0,
        }
    }

    #[must_use]
    pub fn with_speed(mut self, speed_mbps: u64) -> Self {
        self.speed_mbps = speed_mbps;
        self
    }

    /// A finished stream of `total` bytes.
    #[must_use]
    pub fn done(total: u64) -> Self {
        Self::from_counters(total, total)
    }
}

/// Integer percentage `part * 100 / whole`, saturating at 100.
///
/// A zero `whole` is treated as complete rather than dividing by zero.
#[must_use]
pub fn percent_of(part: u64, whole: u64) -> u8 {
    if whole == 0 {
        return 100;
    }
    let pct = u128::from(part.min(whole)) * 100 / u128::from(whole);
    u8::try_from(pct).unwrap_or(100)
}

/// Transfer rate in megabits per second for `bytes` moved over `elapsed`.
///
/// Returns zero for an empty interval.
#[must_use]
pub fn rate_mbps(bytes: u64, elapsed: Duration) -> u64 {
    let micros = elapsed.as_micros();
    if micros == 0 {
        return 0;
    }
    // bits / seconds / 1e6 == bits / micros
    let mbps = u128::from(bytes) * 8 / micros;
    u64::try_from(mbps).unwrap_or(u64::MAX)
}

/// Statistics of a live migration task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MigrationStat {
    pub dst_server: String,
    pub status: TaskStatus,
    /// VM memory and device state transfer.
    pub qemu: Progress,
    /// Disk path to mirror progress.
    pub disks: BTreeMap<String, Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationStat {
    /// Fresh statistics with zeroed sub-reports for every known disk.
    pub fn new<I, S>(dst_server: impl Into<String>, disks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dst_server: dst_server.into(),
            status: TaskStatus::Starting,
            qemu: Progress::default(),
            disks: disks.into_iter().map(|d| (d.into(), Progress::default())).collect(),
            error: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    /// The report returned when no migration has ever been registered.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }
}

/// Statistics of a disk-copying task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiskCopyingStat {
    pub disk: String,
    pub target: String,
    pub status: TaskStatus,
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl DiskCopyingStat {
    pub fn new(disk: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            disk: disk.into(),
            target: target.into(),
            status: TaskStatus::Starting,
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }
}
