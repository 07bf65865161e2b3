/// Analysis managers: one worker per running task
///
/// A manager drives its task through STARTING, RUNNING, STOPPING and
/// finally STOPPED or FAILED. Store mutations that follow from a status
/// change are never done by the worker itself: it requests a scheduler
/// action and the scheduler runs the manager's handler for that status.

pub mod action;
pub mod longterm;
pub mod massurl;
pub mod regular;

pub use action::ActionSlot;
pub use longterm::Longterm;
pub use massurl::MassUrl;
pub use regular::Regular;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info};

use crate::config::Config;
use crate::models::{Machine, Task, TaskType};
use crate::sandbox::{
    AuxiliaryRunner, EventConnector, GuestError, GuestFactory, MachineError, Machinery,
    RealtimeProcessor, ResultCollector, ResultProcessor, Routing,
};
use crate::storage::{DiaryStore, StoreError, TaskStore};

/// Status of a running analysis.
///
/// `NewUrlBlock` and `Aborted` only exist as action requests and are never
/// the persisted state of an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Init,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    NewUrlBlock,
    Aborted,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Init => "init",
            AnalysisStatus::Starting => "starting",
            AnalysisStatus::Running => "running",
            AnalysisStatus::Stopping => "stopping",
            AnalysisStatus::Stopped => "stopped",
            AnalysisStatus::Failed => "failed",
            AnalysisStatus::NewUrlBlock => "newurlblock",
            AnalysisStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("No handler for status '{0}'")]
    NoHandler(AnalysisStatus),

    #[error("Analysis manager was not initialized")]
    NotInitialized,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Machine error: {0}")]
    Machine(#[from] MachineError),

    #[error("Guest error: {0}")]
    Guest(#[from] GuestError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Collaborators shared by every analysis manager
pub struct AnalysisContext {
    pub config: Config,
    pub machinery: Arc<dyn Machinery>,
    pub guests: Arc<dyn GuestFactory>,
    pub routing: Arc<dyn Routing>,
    pub collector: Arc<dyn ResultCollector>,
    pub auxiliary: AuxiliaryRunner,
    pub processor: Arc<dyn ResultProcessor>,
    pub realtime: Arc<dyn RealtimeProcessor>,
    pub diaries: Arc<dyn DiaryStore>,
    pub events: Arc<dyn EventConnector>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State every manager variant carries
pub struct ManagerCore {
    task: Task,
    machine: Mutex<Machine>,
    status: Mutex<AnalysisStatus>,
    action: ActionSlot,
    startup_permit: Mutex<Option<OwnedSemaphorePermit>>,
    machinery: Arc<dyn Machinery>,
}

impl ManagerCore {
    pub fn new(
        task: Task,
        machine: Machine,
        machinery: Arc<dyn Machinery>,
        startup_permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            task,
            machine: Mutex::new(machine),
            status: Mutex::new(AnalysisStatus::Init),
            action: ActionSlot::new(),
            startup_permit: Mutex::new(startup_permit),
            machinery,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn machine(&self) -> Machine {
        lock(&self.machine).clone()
    }

    pub fn machinery(&self) -> &Arc<dyn Machinery> {
        &self.machinery
    }

    /// Current status ignoring action requests
    pub fn analysis_status(&self) -> AnalysisStatus {
        *lock(&self.status)
    }

    /// Set the status; with `wait`, also have the scheduler act on it
    pub async fn set_analysis_status(&self, status: AnalysisStatus, wait: bool) {
        info!(
            task_id = self.task.id,
            status = %status,
            action = "analysis.status",
            "Analysis status changed"
        );
        *lock(&self.status) = status;
        if wait {
            self.request_scheduler_action(status).await;
        }
    }

    pub async fn request_scheduler_action(&self, status: AnalysisStatus) {
        debug!(task_id = self.task.id, status = %status, "Requesting scheduler action");
        self.action.request(status).await;
    }

    /// Status the worker is waiting on the scheduler for; while set it
    /// takes precedence over the analysis status
    pub fn requested_action(&self) -> Option<AnalysisStatus> {
        self.action.requested()
    }

    pub fn release_action(&self) -> bool {
        self.action.release()
    }

    /// Give the machine startup permit back; safe to call repeatedly
    pub fn release_machine_lock(&self) {
        if lock(&self.startup_permit).take().is_some() {
            debug!(task_id = self.task.id, "Released machine startup permit");
        }
    }

    /// Unlock the machine if this analysis still holds it
    pub async fn release_machine(&self) -> Result<(), AnalysisError> {
        let machine = self.machine();
        if !machine.locked {
            return Ok(());
        }
        debug!(task_id = self.task.id, vmname = %machine.name, "Releasing machine lock");
        let released = self.machinery.release(&machine.label).await?;
        *lock(&self.machine) = released;
        Ok(())
    }
}

/// Worker driving one task's analysis
#[async_trait]
pub trait AnalysisManager: Send + Sync {
    fn core(&self) -> &ManagerCore;

    /// Precondition checks before the worker starts; false prevents the
    /// analysis from running
    async fn init(&mut self, store: &dyn TaskStore) -> bool;

    /// Body of the worker; ends by requesting STOPPED or FAILED
    async fn run(&self);

    /// Scheduler side handler for an action request
    async fn on_status(&self, status: AnalysisStatus, store: &dyn TaskStore) -> Result<(), AnalysisError>;

    /// Runs once after `run` returned
    async fn finalize(&self, store: &dyn TaskStore);
}

pub type ManagerConstructor = fn(ManagerCore, Arc<AnalysisContext>) -> Box<dyn AnalysisManager>;

/// One analysis manager variant and the task types it handles
#[derive(Clone, Copy)]
pub struct ManagerEntry {
    pub name: &'static str,
    pub supports: &'static [TaskType],
    pub build: ManagerConstructor,
}

/// Task type to manager variant lookup
#[derive(Clone)]
pub struct ManagerRegistry {
    entries: Vec<ManagerEntry>,
}

impl Default for ManagerRegistry {
    fn default() -> Self {
        Self::new(vec![
            ManagerEntry {
                name: "regular",
                supports: Regular::SUPPORTS,
                build: Regular::boxed,
            },
            ManagerEntry {
                name: "longterm",
                supports: Longterm::SUPPORTS,
                build: Longterm::boxed,
            },
            ManagerEntry {
                name: "massurl",
                supports: MassUrl::SUPPORTS,
                build: MassUrl::boxed,
            },
        ])
    }
}

impl ManagerRegistry {
    pub fn new(entries: Vec<ManagerEntry>) -> Self {
        Self { entries }
    }

    pub fn lookup(&self, task_type: TaskType) -> Option<&ManagerEntry> {
        self.entries.iter().find(|e| e.supports.contains(&task_type))
    }

    /// Construct the manager for the task in `core`
    pub fn build(
        &self,
        core: ManagerCore,
        ctx: Arc<AnalysisContext>,
    ) -> Result<Box<dyn AnalysisManager>, ManagerCore> {
        match self.lookup(core.task().task_type) {
            Some(entry) => Ok((entry.build)(core, ctx)),
            None => Err(core),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_covers_task_types() {
        let registry = ManagerRegistry::default();
        assert_eq!(registry.lookup(TaskType::Regular).unwrap().name, "regular");
        assert_eq!(registry.lookup(TaskType::Baseline).unwrap().name, "regular");
        assert_eq!(registry.lookup(TaskType::Service).unwrap().name, "regular");
        assert_eq!(registry.lookup(TaskType::Longterm).unwrap().name, "longterm");
        assert_eq!(registry.lookup(TaskType::Massurl).unwrap().name, "massurl");

        let partial = ManagerRegistry::new(vec![]);
        assert!(partial.lookup(TaskType::Regular).is_none());
    }

    #[test]
    fn test_status_names() {
        assert_eq!(AnalysisStatus::NewUrlBlock.to_string(), "newurlblock");
        assert_eq!(
            serde_json::to_value(AnalysisStatus::Stopped).unwrap(),
            serde_json::json!("stopped")
        );
    }
}
