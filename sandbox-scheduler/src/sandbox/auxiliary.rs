use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::{Machine, Task};

/// Host side helper running next to an analysis, such as a traffic sniffer
#[async_trait]
pub trait Auxiliary: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, task: &Task, machine: &Machine) -> anyhow::Result<()>;

    async fn stop(&self, task: &Task) -> anyhow::Result<()>;
}

/// Starts and stops every configured auxiliary module. A failing module is
/// logged and does not affect the others.
#[derive(Clone, Default)]
pub struct AuxiliaryRunner {
    modules: Vec<Arc<dyn Auxiliary>>,
}

impl AuxiliaryRunner {
    pub fn new(modules: Vec<Arc<dyn Auxiliary>>) -> Self {
        Self { modules }
    }

    pub async fn start(&self, task: &Task, machine: &Machine) {
        for module in &self.modules {
            match module.start(task, machine).await {
                Ok(()) => debug!(task_id = task.id, module = module.name(), "Started auxiliary module"),
                Err(e) => warn!(
                    task_id = task.id,
                    module = module.name(),
                    error = %e,
                    "Unable to start auxiliary module"
                ),
            }
        }
    }

    pub async fn stop(&self, task: &Task) {
        for module in &self.modules {
            if let Err(e) = module.stop(task).await {
                warn!(
                    task_id = task.id,
                    module = module.name(),
                    error = %e,
                    "Unable to stop auxiliary module"
                );
            }
        }
    }
}
