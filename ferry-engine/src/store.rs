//! Durable storage for the final statistics of finished tasks.
//!
//! A stat survives the process so that a poller asking after a restart
//! still sees how the last task ended. Each record is one JSON file under
//! the state directory, replaced atomically by write-then-rename.

use std::path::{Path, PathBuf};

use ferry_core::{check_vm_name, DiskCopyingStat, MigrationStat};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::EngineError;

#[derive(Debug, Clone)]
pub struct StatStore {
    dir: PathBuf,
}

impl StatStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn migration_path(&self, vm_name: &str) -> Result<PathBuf, EngineError> {
        check_vm_name(vm_name)?;
        Ok(self.dir.join(format!("{vm_name}.migration.json")))
    }

    fn copying_path(&self, vm_name: &str, disk: &str) -> Result<PathBuf, EngineError> {
        check_vm_name(vm_name)?;
        let disk = disk.trim_matches('/').replace(['/', '\\', '\0'], "_");
        Ok(self.dir.join(format!("{vm_name}.{disk}.copying.json")))
    }

    /// # Errors
    /// Returns [`EngineError::InvalidOptions`] for a VM name that cannot be a
    /// file name and [`EngineError::Persist`] if the file cannot be written.
    pub async fn save_migration(&self, vm_name: &str, stat: &MigrationStat) -> Result<(), EngineError> {
        self.save(&self.migration_path(vm_name)?, stat).await
    }

    /// Last persisted migration stat of `vm_name`, if any.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOptions`] for an unusable VM name and
    /// [`EngineError::Persist`] if a record exists but is unreadable.
    pub async fn load_migration(&self, vm_name: &str) -> Result<Option<MigrationStat>, EngineError> {
        self.load(&self.migration_path(vm_name)?).await
    }

    /// # Errors
    /// Returns [`EngineError::Persist`] if the file cannot be written.
    pub async fn save_disk_copying(&self, vm_name: &str, stat: &DiskCopyingStat) -> Result<(), EngineError> {
        self.save(&self.copying_path(vm_name, &stat.disk)?, stat).await
    }

    /// # Errors
    /// Returns [`EngineError::Persist`] if a record exists but is unreadable.
    pub async fn load_disk_copying(&self, vm_name: &str, disk: &str) -> Result<Option<DiskCopyingStat>, EngineError> {
        self.load(&self.copying_path(vm_name, disk)?).await
    }

    async fn save<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), EngineError> {
        let persist = |e: &dyn std::fmt::Display| EngineError::Persist(format!("{}: {e}", path.display()));

        let bytes = serde_json::to_vec_pretty(value).map_err(|e| persist(&e))?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| persist(&e))?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| persist(&e))?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| persist(&e))?;
        tracing::debug!(path = %path.display(), "stat persisted");
        Ok(())
    }

    async fn load<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, EngineError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::Persist(format!("{}: {e}", path.display()))),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| EngineError::Persist(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use ferry_core::{Progress, TaskStatus};

    use super::*;

    fn store() -> (tempfile::TempDir, StatStore) {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let store = StatStore::new(dir.path().join("stat"));
        (dir, store)
    }

    #[tokio::test]
    async fn missing_record_loads_as_none() {
        let (_dir, store) = store();
        assert!(matches!(store.load_migration("alice").await, Ok(None)));
        assert!(matches!(store.load_disk_copying("alice", "/dev/vg/alice-disk0").await, Ok(None)));
    }

    #[tokio::test]
    async fn saved_migration_stat_is_loaded_back() {
        let (_dir, store) = store();
        let mut stat = MigrationStat::new("host2", ["/dev/vg/alice-disk0"]);
        stat.status = TaskStatus::Completed;
        stat.qemu = Progress::done(4096);

        assert!(store.save_migration("alice", &stat).await.is_ok());
        assert!(store.dir().join("alice.migration.json").exists());
        match store.load_migration("alice").await {
            Ok(Some(loaded)) => assert_eq!(loaded, stat),
            other => panic!("expected stored stat, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn copying_stats_are_keyed_by_disk() {
        let (_dir, store) = store();
        let mut stat = DiskCopyingStat::new("/dev/vg/alice-disk0", "/backup/alice-disk0.raw");
        stat.status = TaskStatus::Failed;
        stat.error = Some("boom".to_owned());

        assert!(store.save_disk_copying("alice", &stat).await.is_ok());
        assert!(matches!(store.load_disk_copying("alice", "/dev/vg/alice-disk1").await, Ok(None)));
        match store.load_disk_copying("alice", "/dev/vg/alice-disk0").await {
            Ok(Some(loaded)) => assert_eq!(loaded.error.as_deref(), Some("boom")),
            other => panic!("expected stored stat, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn names_outside_the_state_dir_are_refused() {
        let (dir, store) = store();
        let outside = dir.path().join("x.migration.json");
        assert!(tokio::fs::write(&outside, b"{}").await.is_ok());

        assert!(matches!(store.load_migration("../x").await, Err(EngineError::InvalidOptions(_))));
        assert!(matches!(
            store.save_migration("../x", &MigrationStat::none()).await,
            Err(EngineError::InvalidOptions(_))
        ));
        assert!(matches!(
            store.load_disk_copying("..", "/dev/vg/alice-disk0").await,
            Err(EngineError::InvalidOptions(_))
        ));

        let stat = DiskCopyingStat::new("../../etc/passwd", "/backup/x.raw");
        assert!(store.save_disk_copying("alice", &stat).await.is_ok());
        assert!(store.dir().join("alice..._.._etc_passwd.copying.json").exists());
    }

    #[tokio::test]
    async fn corrupt_record_is_a_persist_error() {
        let (_dir, store) = store();
        assert!(tokio::fs::create_dir_all(store.dir()).await.is_ok());
        assert!(tokio::fs::write(store.dir().join("alice.migration.json"), b"{not json").await.is_ok());
        assert!(matches!(store.load_migration("alice").await, Err(EngineError::Persist(_))));
    }
}
