//! Contract with the agent running inside the analysis machine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::models::{Machine, Target, Task};

/// Guest timeout used when a task does not set one
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, thiserror::Error)]
pub enum GuestError {
    /// The guest never became reachable
    #[error("Critical timeout waiting for guest: {0}")]
    CriticalTimeout(String),

    #[error("Guest error: {0}")]
    Guest(String),
}

/// Options handed to the analyzer when an analysis starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestOptions {
    pub task_id: i64,
    pub category: String,
    /// Target file name, URL, or comma separated URLs
    pub target: String,
    pub package: Option<String>,
    /// Task options as `key=value,...`
    pub options: String,
    pub timeout: u64,
    pub enforce_timeout: bool,
    pub ip: String,
    pub platform: String,
    /// Variant specific flags such as `lta.first`
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl GuestOptions {
    pub fn build(task: &Task, target: Option<&Target>, machine: &Machine) -> Self {
        let (category, target) = match target {
            Some(t) => (t.category.as_str().to_string(), t.target.clone()),
            None => ("baseline".to_string(), String::new()),
        };
        Self {
            task_id: task.id,
            category,
            target,
            package: task.package.clone(),
            options: task.options_string(),
            timeout: if task.timeout == 0 { DEFAULT_TIMEOUT_SECS } else { task.timeout },
            enforce_timeout: task.option_enabled("enforce_timeout"),
            ip: machine.ip.clone(),
            platform: machine.platform.clone(),
            extra: Map::new(),
        }
    }
}

/// Drives the analyzer inside one machine for one task
#[async_trait]
pub trait GuestManager: Send + Sync {
    /// Upload the analyzer and start the analysis
    async fn start_analysis(&self, options: &GuestOptions, monitor: &str) -> Result<(), GuestError>;

    /// Resolve once the guest reports the analysis finished or times out
    async fn wait_for_completion(&self) -> Result<(), GuestError>;
}

pub trait GuestFactory: Send + Sync {
    fn create(&self, task: &Task, machine: &Machine) -> Arc<dyn GuestManager>;
}

/// Guest without an agent that simply lets the analysis run for its timeout
pub struct TimeoutGuest {
    vmname: String,
    timeout: Duration,
    started: AtomicBool,
}

impl TimeoutGuest {
    pub fn new(vmname: &str, timeout: Duration) -> Self {
        Self {
            vmname: vmname.to_string(),
            timeout,
            started: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl GuestManager for TimeoutGuest {
    async fn start_analysis(&self, options: &GuestOptions, monitor: &str) -> Result<(), GuestError> {
        info!(
            task_id = options.task_id,
            vmname = %self.vmname,
            monitor,
            category = %options.category,
            "Analysis started without guest agent"
        );
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_completion(&self) -> Result<(), GuestError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(GuestError::Guest("analysis was never started".to_string()));
        }
        tokio::time::sleep(self.timeout).await;
        Ok(())
    }
}

/// Creates a [`TimeoutGuest`] per task
#[derive(Debug, Clone)]
pub struct TimeoutGuestFactory;

impl GuestFactory for TimeoutGuestFactory {
    fn create(&self, task: &Task, machine: &Machine) -> Arc<dyn GuestManager> {
        let secs = if task.timeout == 0 { DEFAULT_TIMEOUT_SECS } else { task.timeout };
        Arc::new(TimeoutGuest::new(&machine.name, Duration::from_secs(secs)))
    }
}
