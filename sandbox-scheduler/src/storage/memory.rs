use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{FetchQuery, StoreError, StoreResult, TaskStore};
use crate::models::{Longterm, Machine, Target, Task, TaskError, TaskStatus, TaskType, SERVICE_TAG};

/// Initial contents of a [`MemoryStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub machines: Vec<Machine>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub longterms: Vec<Longterm>,
}

#[derive(Debug, Default)]
struct StoreState {
    tasks: BTreeMap<i64, Task>,
    /// Keyed by name, kept in insertion order via `machine_order`
    machines: BTreeMap<String, Machine>,
    machine_order: Vec<String>,
    longterms: BTreeMap<i64, Longterm>,
}

impl StoreState {
    fn machines(&self) -> impl Iterator<Item = &Machine> {
        self.machine_order
            .iter()
            .filter_map(move |name| self.machines.get(name))
    }

    fn machine_by_label_mut(&mut self, label: &str) -> StoreResult<&mut Machine> {
        self.machines
            .values_mut()
            .find(|m| m.label == label)
            .ok_or_else(|| StoreError::NotFound(format!("machine {}", label)))
    }

    fn series_has_machine(&self, task: &Task) -> bool {
        task.longterm_id
            .and_then(|id| self.longterms.get(&id))
            .is_some_and(|lta| lta.machine.is_some())
    }

    fn task_mut(&mut self, task_id: i64) -> StoreResult<&mut Task> {
        self.tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task #{}", task_id)))
    }
}

fn is_service_task(task: &Task) -> bool {
    task.task_type == TaskType::Service || task.tags.iter().any(|t| t == SERVICE_TAG)
}

/// In-memory task and machine store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: SeedData) -> Self {
        let mut state = StoreState::default();
        for machine in seed.machines {
            state.machine_order.push(machine.name.clone());
            state.machines.insert(machine.name.clone(), machine);
        }
        for task in seed.tasks {
            state.tasks.insert(task.id, task);
        }
        for longterm in seed.longterms {
            state.longterms.insert(longterm.id, longterm);
        }
        Self {
            state: RwLock::new(state),
        }
    }

    /// Load a store seeded from a JSON file with `machines`, `tasks` and
    /// `longterms` arrays
    pub async fn from_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read seed file {}", path.display()))?;
        let seed: SeedData = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid seed file {}", path.display()))?;

        info!(
            machines = seed.machines.len(),
            tasks = seed.tasks.len(),
            longterms = seed.longterms.len(),
            "Loaded store seed"
        );
        Ok(Self::from_seed(seed))
    }

    pub async fn add_task(&self, task: Task) {
        self.state.write().await.tasks.insert(task.id, task);
    }

    pub async fn add_machine(&self, machine: Machine) {
        let mut state = self.state.write().await;
        if !state.machines.contains_key(&machine.name) {
            state.machine_order.push(machine.name.clone());
        }
        state.machines.insert(machine.name.clone(), machine);
    }

    pub async fn add_longterm(&self, longterm: Longterm) {
        self.state.write().await.longterms.insert(longterm.id, longterm);
    }

    pub async fn machine(&self, name: &str) -> Option<Machine> {
        self.state.read().await.machines.get(name).cloned()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn fetch(&self, query: FetchQuery) -> StoreResult<Option<Task>> {
        let state = self.state.read().await;
        let now = Utc::now();
        let next = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| t.is_due(now))
            .filter(|t| query.task_id.map_or(true, |id| t.id == id))
            .filter(|t| {
                query
                    .machine
                    .as_deref()
                    .map_or(true, |m| t.machine.as_deref() == Some(m))
            })
            .filter(|t| query.service || !is_service_task(t))
            .filter(|t| !query.exclude.contains(&t.id))
            .filter(|t| !query.skip_bound_longterm || !state.series_has_machine(t))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.added_on.cmp(&b.added_on))
                    .then(a.id.cmp(&b.id))
            });

        Ok(next.cloned())
    }

    async fn view_task(&self, task_id: i64) -> StoreResult<Option<Task>> {
        Ok(self.state.read().await.tasks.get(&task_id).cloned())
    }

    async fn get_available_machines(&self) -> StoreResult<Vec<Machine>> {
        let state = self.state.read().await;
        Ok(state.machines().filter(|m| !m.locked).cloned().collect())
    }

    async fn list_machines(&self) -> StoreResult<Vec<Machine>> {
        let state = self.state.read().await;
        Ok(state.machines().cloned().collect())
    }

    async fn lock_machine(
        &self,
        name: Option<&str>,
        platform: Option<&str>,
        tags: &[String],
        task_id: Option<i64>,
    ) -> StoreResult<Option<Machine>> {
        let mut state = self.state.write().await;

        let candidates: Vec<String> = state
            .machines()
            .filter(|m| m.matches(name, platform, tags))
            .map(|m| m.name.clone())
            .collect();
        if candidates.is_empty() {
            return Err(StoreError::NoMatchingMachine);
        }

        for candidate in candidates {
            if let Some(machine) = state.machines.get_mut(&candidate) {
                let reserved_for_other = machine
                    .reserved_by
                    .is_some_and(|holder| Some(holder) != task_id);
                if machine.locked || reserved_for_other {
                    continue;
                }
                machine.locked = true;
                debug!(vmname = %machine.name, "Locked machine");
                return Ok(Some(machine.clone()));
            }
        }

        Ok(None)
    }

    async fn unlock_machine(&self, label: &str) -> StoreResult<Machine> {
        let mut state = self.state.write().await;
        let machine = state.machine_by_label_mut(label)?;
        machine.locked = false;
        Ok(machine.clone())
    }

    async fn machine_reserve(&self, label: &str, task_id: i64) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.machine_by_label_mut(label)?.reserved_by = Some(task_id);
        Ok(())
    }

    async fn clear_reservation(&self, label: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.machine_by_label_mut(label)?.reserved_by = None;
        Ok(())
    }

    async fn set_status(&self, task_id: i64, status: TaskStatus) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let task = state.task_mut(task_id)?;
        task.status = status;
        match status {
            TaskStatus::Running => task.started_on = Some(Utc::now()),
            TaskStatus::Completed => task.completed_on = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    async fn set_machine(&self, task_id: i64, machine: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.task_mut(task_id)?.machine = Some(machine.to_string());
        Ok(())
    }

    async fn set_route(&self, task_id: i64, route: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.task_mut(task_id)?.route = Some(route.to_string());
        Ok(())
    }

    async fn add_error(&self, task_id: i64, message: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.task_mut(task_id)?.errors.push(TaskError {
            message: message.to_string(),
            created_on: Utc::now(),
        });
        Ok(())
    }

    async fn count_tasks(&self, status: Option<TaskStatus>) -> StoreResult<usize> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .count())
    }

    async fn update_targets(&self, targets: &[Target]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        for updated in targets {
            let stored = state
                .tasks
                .values_mut()
                .flat_map(|t| t.targets.iter_mut())
                .find(|t| t.id == updated.id);
            match stored {
                Some(stored) => *stored = updated.clone(),
                None => return Err(StoreError::NotFound(format!("target {}", updated.id))),
            }
        }
        Ok(())
    }

    async fn view_longterm(&self, longterm_id: i64) -> StoreResult<Option<Longterm>> {
        Ok(self.state.read().await.longterms.get(&longterm_id).cloned())
    }

    async fn set_longterm_machine(&self, label: &str, longterm_id: i64) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let longterm = state
            .longterms
            .get_mut(&longterm_id)
            .ok_or_else(|| StoreError::NotFound(format!("longterm {}", longterm_id)))?;
        longterm.machine = Some(label.to_string());
        Ok(())
    }

    async fn set_latest_longterm(&self, task_id: i64, longterm_id: i64) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let longterm = state
            .longterms
            .get_mut(&longterm_id)
            .ok_or_else(|| StoreError::NotFound(format!("longterm {}", longterm_id)))?;
        longterm.last_completed = Some(task_id);
        Ok(())
    }

    async fn list_longterm_pending(&self, longterm_id: i64) -> StoreResult<Vec<Task>> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.longterm_id == Some(longterm_id) && t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.added_on.cmp(&b.added_on))
                .then(a.id.cmp(&b.id))
        });
        Ok(tasks)
    }
}
