//! Single-writer statistics aggregation.
//!
//! Phases of a task never touch the published stat directly. They send
//! [`StatUpdate`]s through a [`StatSender`]; one aggregator future owns the
//! write side and folds the updates into a shared snapshot that pollers
//! clone under a read lock. Readers therefore never see a half-applied
//! update, and once a terminal status lands the stat is frozen.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::Utc;
use ferry_core::{rate_mbps, DiskCopyingStat, MigrationStat, Progress, TaskStatus};
use tokio::sync::mpsc;

/// One change to a task's statistics.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StatUpdate {
    Status(TaskStatus),
    /// VM state transfer progress.
    Qemu(Progress),
    /// Progress of the disk at `path`.
    Disk { path: String, progress: Progress },
    Error(String),
}

/// A stat record the aggregator knows how to fold updates into.
pub(crate) trait Aggregate: Clone + Send + Sync + 'static {
    fn status(&self) -> TaskStatus;
    fn apply(&mut self, update: StatUpdate);
}

impl Aggregate for MigrationStat {
    fn status(&self) -> TaskStatus {
        self.status
    }

    fn apply(&mut self, update: StatUpdate) {
        match update {
            StatUpdate::Status(status) => {
                self.status = status;
                if status.is_terminal() {
                    self.finished_at = Some(Utc::now());
                }
            }
            StatUpdate::Qemu(progress) => self.qemu = progress,
            StatUpdate::Disk { path, progress } => {
                if let Some(slot) = self.disks.get_mut(&path) {
                    *slot = progress;
                }
            }
            StatUpdate::Error(msg) => {
                self.error.get_or_insert(msg);
            }
        }
    }
}

impl Aggregate for DiskCopyingStat {
    fn status(&self) -> TaskStatus {
        self.status
    }

    fn apply(&mut self, update: StatUpdate) {
        match update {
            StatUpdate::Status(status) => {
                self.status = status;
                if status.is_terminal() {
                    self.finished_at = Some(Utc::now());
                }
            }
            StatUpdate::Disk { progress, .. } => self.progress = progress,
            StatUpdate::Qemu(_) => {}
            StatUpdate::Error(msg) => {
                self.error.get_or_insert(msg);
            }
        }
    }
}

/// Write handle used by task phases. Sending never blocks.
#[derive(Debug, Clone)]
pub(crate) struct StatSender {
    tx: mpsc::UnboundedSender<StatUpdate>,
}

impl StatSender {
    pub(crate) fn send(&self, update: StatUpdate) {
        // The aggregator outlives every sender of a running task.
        let _ = self.tx.send(update);
    }

    pub(crate) fn status(&self, status: TaskStatus) {
        self.send(StatUpdate::Status(status));
    }

    pub(crate) fn qemu(&self, progress: Progress) {
        self.send(StatUpdate::Qemu(progress));
    }

    pub(crate) fn disk(&self, path: &str, progress: Progress) {
        self.send(StatUpdate::Disk { path: path.to_owned(), progress });
    }

    pub(crate) fn error(&self, msg: impl Into<String>) {
        self.send(StatUpdate::Error(msg.into()));
    }
}

/// Read side shared with pollers.
#[derive(Debug)]
pub(crate) struct StatCell<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for StatCell<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Aggregate> StatCell<T> {
    pub(crate) fn new(initial: T) -> Self {
        Self { inner: Arc::new(RwLock::new(initial)) }
    }

    /// A consistent copy of the current stat.
    pub(crate) fn snapshot(&self) -> T {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.inner.read().expect("stat lock poisoned").clone()
    }

    fn apply(&self, update: StatUpdate) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut stat = self.inner.write().expect("stat lock poisoned");
        if stat.status().is_terminal() {
            tracing::trace!(?update, "stat is final, update dropped");
            return;
        }
        stat.apply(update);
    }
}

/// Derives a transfer rate from successive byte counters.
#[derive(Debug, Default)]
pub(crate) struct SpeedMeter {
    last: Option<(u64, Instant)>,
}

impl SpeedMeter {
    /// Records `transferred` and returns the rate since the previous sample.
    ///
    /// The first sample, and any sample where the counter went backwards,
    /// reports zero.
    pub(crate) fn sample(&mut self, transferred: u64) -> u64 {
        let now = Instant::now();
        let speed = match self.last {
            Some((prev, at)) if transferred >= prev => rate_mbps(transferred - prev, now.duration_since(at)),
            _ => 0,
        };
        self.last = Some((transferred, now));
        speed
    }
}

/// Creates the sender and the aggregation future for `cell`.
///
/// The future completes once every [`StatSender`] clone is dropped and all
/// queued updates have been applied.
pub(crate) fn channel<T: Aggregate>(cell: &StatCell<T>) -> (StatSender, impl std::future::Future<Output = T> + Send) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cell = cell.clone();
    let aggregate = async move {
        while let Some(update) = rx.recv().await {
            cell.apply(update);
        }
        cell.snapshot()
    };
    (StatSender { tx }, aggregate)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISK: &str = "/dev/vg/alice-disk0";

    #[tokio::test]
    async fn updates_are_folded_in_order() {
        let cell = StatCell::new(MigrationStat::new("host2", [DISK]));
        let (tx, aggregate) = channel(&cell);

        tx.status(TaskStatus::InMigrate);
        tx.disk(DISK, Progress::from_counters(100, 40));
        tx.qemu(Progress::from_counters(10, 5));
        tx.status(TaskStatus::Completed);
        drop(tx);

        let last = aggregate.await;
        assert_eq!(last.status, TaskStatus::Completed);
        assert_eq!(last.disks.get(DISK).map(|p| p.percent), Some(40));
        assert_eq!(last.qemu.percent, 50);
        assert!(last.finished_at.is_some());
        assert_eq!(cell.snapshot(), last);
    }

    #[tokio::test]
    async fn terminal_status_freezes_the_stat() {
        let cell = StatCell::new(MigrationStat::new("host2", [DISK]));
        let (tx, aggregate) = channel(&cell);

        tx.status(TaskStatus::Failed);
        tx.error("mirror failed");
        tx.status(TaskStatus::InMigrate);
        drop(tx);

        let last = aggregate.await;
        assert_eq!(last.status, TaskStatus::Failed);
        assert!(last.error.is_none(), "updates after a terminal status are dropped");
    }

    #[tokio::test]
    async fn first_error_wins() {
        let cell = StatCell::new(DiskCopyingStat::new(DISK, "/backup/d0"));
        let (tx, aggregate) = channel(&cell);
        tx.error("first");
        tx.error("second");
        tx.status(TaskStatus::Failed);
        drop(tx);
        assert_eq!(aggregate.await.error.as_deref(), Some("first"));
    }

    #[test]
    fn speed_meter_first_sample_is_zero() {
        let mut meter = SpeedMeter::default();
        assert_eq!(meter.sample(1 << 20), 0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(meter.sample(100 << 20) > 0);
        assert_eq!(meter.sample(0), 0, "counter reset reports zero");
    }

    #[tokio::test]
    async fn unknown_disk_is_ignored() {
        let cell = StatCell::new(MigrationStat::new("host2", [DISK]));
        let (tx, aggregate) = channel(&cell);
        tx.disk("/dev/vg/other", Progress::done(1));
        drop(tx);
        assert_eq!(aggregate.await.disks.len(), 1);
    }
}
