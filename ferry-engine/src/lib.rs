//! Live migration and disk copying engine for QEMU/KVM virtual machines.
//!
//! Drives running VMs through their QMP monitors, coordinates with the
//! destination host over its peer control API, and tracks every
//! long-running job in a [`TaskPool`] that enforces per-VM and per-disk
//! mutual exclusion.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod disk_copy;
pub mod disks;
pub mod error;
pub mod gate;
pub mod migration;
pub mod qmp;
pub mod remote;
mod stats;
pub mod store;
pub mod task;

pub use config::EngineConfig;
pub use disk_copy::DiskCopyingTask;
pub use error::EngineError;
pub use gate::Gate;
pub use migration::MigrationTask;
pub use qmp::{Monitor, QmpPool};
pub use remote::{HttpRemoteConnector, RemoteConnector, RemoteControl};
pub use store::StatStore;
pub use task::{Task, TaskPool};
