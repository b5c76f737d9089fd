//! Control channel to the peer host that receives a migration.
//!
//! The migration task only needs a handful of operations from the
//! destination: provision the VM configuration, start an incoming QEMU
//! instance, expose the target disks over NBD and resume the VM once the
//! state has arrived. [`RemoteControl`] abstracts them so the orchestration
//! does not care how the peer is reached.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::EngineError;

mod http;

pub use http::{HttpRemoteConnector, HttpRemoteControl};

/// Operations on the destination host.
///
/// # Cancel Safety
/// Every method is a single request/response exchange. Dropping the future
/// abandons the request; the peer may still have acted on it.
#[async_trait]
pub trait RemoteControl: Send + Sync {
    /// Returns `true` if a VM configuration named `vm_name` already exists.
    async fn is_config_present(&self, vm_name: &str) -> Result<bool, EngineError>;

    /// Creates the VM configuration from the serialized manifest without
    /// starting it.
    ///
    /// Part of the peer interface for callers that stage a configuration
    /// ahead of time. A migration does not call it:
    /// [`RemoteControl::start_incoming_instance`] provisions the
    /// configuration itself.
    async fn create_config_from_manifest(
        &self,
        manifest: &[u8],
        extra_files: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), EngineError>;

    /// Ensures the destination can hold every disk.
    ///
    /// `disks` maps destination disk path to the bytes it must fit.
    ///
    /// # Errors
    /// Returns [`EngineError::Precondition`] with "Insufficient space" when
    /// any disk does not fit.
    async fn check_disk_capacity(&self, disks: &BTreeMap<String, u64>) -> Result<(), EngineError>;

    /// Provisions the configuration and starts QEMU waiting for an incoming
    /// migration. Returns the TCP port QEMU listens on.
    async fn start_incoming_instance(
        &self,
        manifest: &[u8],
        extra_files: &BTreeMap<String, Vec<u8>>,
    ) -> Result<u16, EngineError>;

    /// Starts an NBD server exporting `disks` on `addr`. Returns its port.
    async fn start_export_server(&self, vm_name: &str, addr: IpAddr, disks: &[String]) -> Result<u16, EngineError>;

    async fn stop_export_server(&self, vm_name: &str) -> Result<(), EngineError>;

    /// Resumes the migrated VM on the destination.
    async fn send_continue(&self, vm_name: &str) -> Result<(), EngineError>;

    /// Removes the VM configuration. Used when a migration is rolled back.
    async fn remove_config(&self, vm_name: &str) -> Result<(), EngineError>;
}

/// Opens a [`RemoteControl`] for a destination host.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// # Errors
    /// Returns [`EngineError::Remote`] when the peer cannot be reached.
    async fn connect(&self, dst_server: &str, addrs: &[IpAddr]) -> Result<Arc<dyn RemoteControl>, EngineError>;
}
