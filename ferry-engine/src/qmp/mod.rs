//! QEMU Machine Protocol: monitor connections and the per-VM pool.
//!
//! Every conversation with a running QEMU instance goes through a
//! [`Monitor`] registered in the [`QmpPool`] under the VM name.

use async_trait::async_trait;
use serde_json::Value;

use crate::EngineError;

mod events;
mod monitor;
mod pool;
pub mod protocol;

pub use events::EventLog;
pub use monitor::QmpMonitor;
pub use pool::QmpPool;
pub use protocol::{BlockJobInfo, Event, MigrationInfo, RamInfo, TransactionAction};

/// A live control connection to one QEMU process.
///
/// Implementations serialize concurrent `execute` calls themselves and
/// feed asynchronous events into their [`EventLog`].
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Runs one command and returns its `return` value.
    ///
    /// # Errors
    /// Returns [`EngineError::Qmp`] when QEMU rejects the command and
    /// [`EngineError::Protocol`] or [`EngineError::Io`] on transport failure.
    async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value, EngineError>;

    /// Events received on this connection so far.
    fn events(&self) -> &EventLog;

    /// Tears down the connection. Further commands fail.
    async fn close(&self);
}
