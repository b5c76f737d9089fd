//! Core types for the Ferry VM migration control plane.
//!
//! Defines the task identifiers, task options and pollable statistics
//! shared by the engine and its inbound surfaces. Nothing here performs I/O.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod disk;
pub mod error;
pub mod id;
pub mod options;
pub mod stat;

pub use disk::{DiskBackend, DiskDescriptor};
pub use error::CoreError;
pub use id::{TaskId, TaskKind};
pub use options::{check_vm_name, Chroot, CopyMode, DiskCopyingOptions, MigrationOptions, Overrides};
pub use stat::{percent_of, rate_mbps, DiskCopyingStat, MigrationStat, Progress, TaskStatus};
