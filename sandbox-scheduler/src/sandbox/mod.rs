/// Sandbox module: everything an analysis needs around the virtual machine
///
/// This module provides:
/// - Machine control (`Machinery`), backed by the store for lock bookkeeping
/// - The guest agent contract and a timeout-only reference guest
/// - Network routing, result collection and auxiliary helpers
/// - Result and realtime processing used by Longterm and MassURL runs
/// - The event bus connector handed to analysis managers

pub mod auxiliary;
pub mod collector;
pub mod command;
pub mod events;
pub mod guest;
pub mod pool;
pub mod processing;
pub mod routing;

pub use auxiliary::{Auxiliary, AuxiliaryRunner};
pub use collector::{ResultCollector, ResultRegistry};
pub use command::CommandDriver;
pub use events::{BusConnector, EventConnector};
pub use guest::{GuestError, GuestFactory, GuestManager, GuestOptions, TimeoutGuest, TimeoutGuestFactory};
pub use pool::{MachinePool, VmDriver};
pub use processing::{
    BlockSummary, JsonReporter, NullRealtime, RealtimeError, RealtimeProcessor, ResultProcessor,
};
pub use routing::{Route, Routing, StaticRoute, StaticRouting};

use async_trait::async_trait;
use std::path::Path;

use crate::models::{Machine, Task};
use crate::storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    /// No machine could ever satisfy the requested constraints
    #[error("No machine matches the requested constraints")]
    NoMatch,

    #[error("Unable to restore snapshot of {label}: {reason}")]
    Snapshot { label: String, reason: String },

    #[error("Machine operation failed: {0}")]
    Operation(String),

    #[error("{0} is not supported by this machinery")]
    NotImplemented(&'static str),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for MachineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NoMatchingMachine => MachineError::NoMatch,
            other => MachineError::Store(other),
        }
    }
}

pub type MachineResult<T> = Result<T, MachineError>;

/// Control over the pool of analysis machines
#[async_trait]
pub trait Machinery: Send + Sync {
    async fn initialize(&self) -> MachineResult<()>;

    async fn machines(&self) -> MachineResult<Vec<Machine>>;

    /// Number of machines not locked by an analysis
    async fn availables(&self) -> MachineResult<usize>;

    /// Labels of machines currently started
    async fn running(&self) -> Vec<String>;

    /// Lock a machine for the analysis of `task_id`.
    ///
    /// `Ok(None)` means a matching machine exists but is busy or reserved
    /// for another task, [`MachineError::NoMatch`] that none could ever match.
    async fn acquire(
        &self,
        machine_id: Option<&str>,
        platform: Option<&str>,
        tags: &[String],
        task_id: Option<i64>,
    ) -> MachineResult<Option<Machine>>;

    async fn release(&self, label: &str) -> MachineResult<Machine>;

    /// Start a machine, reverting it to its snapshot first when `revert`
    async fn start(&self, label: &str, task: &Task, revert: bool) -> MachineResult<()>;

    async fn stop(&self, label: &str) -> MachineResult<()>;

    /// Stop without discarding machine state
    async fn stop_safe(&self, label: &str) -> MachineResult<()>;

    async fn dump_memory(&self, label: &str, path: &Path) -> MachineResult<()>;

    async fn enable_remote_control(&self, label: &str) -> MachineResult<()>;

    async fn disable_remote_control(&self, label: &str) -> MachineResult<()>;

    /// Stop every machine still running
    async fn shutdown(&self);
}
