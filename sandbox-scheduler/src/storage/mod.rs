/// Storage module for tasks, machines and MassURL diaries
///
/// This module provides:
/// - The `TaskStore` contract the scheduler and analysis managers use for
///   every persisted state change
/// - `MemoryStore`, an in-memory store optionally seeded from JSON
/// - URL diary persistence for MassURL blocks

pub mod diary;
pub mod memory;

pub use diary::{DiaryStore, FileDiaryStore};
pub use memory::{MemoryStore, SeedData};

use async_trait::async_trait;

use crate::models::{Longterm, Machine, Target, Task, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No machine, locked or not, satisfies the requested constraints
    #[error("No machines match selection criteria")]
    NoMatchingMachine,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Selection of the next pending task
#[derive(Debug, Clone, Default)]
pub struct FetchQuery {
    /// Only tasks bound to this machine name
    pub machine: Option<String>,
    /// Include service tasks
    pub service: bool,
    /// Task ids to skip
    pub exclude: Vec<i64>,
    /// Only this task, if it is still pending
    pub task_id: Option<i64>,
    /// Skip tasks of a long-term series that already has a machine; those
    /// run on the series machine once it is handed to them
    pub skip_bound_longterm: bool,
}

impl FetchQuery {
    pub fn for_machine(name: &str) -> Self {
        Self {
            machine: Some(name.to_string()),
            service: true,
            ..Default::default()
        }
    }

    pub fn for_task(task_id: i64) -> Self {
        Self {
            task_id: Some(task_id),
            service: true,
            ..Default::default()
        }
    }

    /// Next non-service task not in `exclude`
    pub fn analysis(exclude: &[i64]) -> Self {
        Self {
            service: false,
            exclude: exclude.to_vec(),
            skip_bound_longterm: true,
            ..Default::default()
        }
    }
}

/// Persistent task and machine state
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Highest priority, earliest submitted pending task matching `query`.
    ///
    /// Tasks with a `start_on` in the future are never returned.
    async fn fetch(&self, query: FetchQuery) -> StoreResult<Option<Task>>;

    async fn view_task(&self, task_id: i64) -> StoreResult<Option<Task>>;

    /// Unlocked machines, reserved ones included
    async fn get_available_machines(&self) -> StoreResult<Vec<Machine>>;

    async fn list_machines(&self) -> StoreResult<Vec<Machine>>;

    /// Lock the first free machine satisfying the constraints for `task_id`.
    ///
    /// Returns `Ok(None)` when matching machines exist but none is free and
    /// [`StoreError::NoMatchingMachine`] when none could ever match. A
    /// reserved machine is only handed to the task holding the reservation.
    async fn lock_machine(
        &self,
        name: Option<&str>,
        platform: Option<&str>,
        tags: &[String],
        task_id: Option<i64>,
    ) -> StoreResult<Option<Machine>>;

    async fn unlock_machine(&self, label: &str) -> StoreResult<Machine>;

    async fn machine_reserve(&self, label: &str, task_id: i64) -> StoreResult<()>;

    async fn clear_reservation(&self, label: &str) -> StoreResult<()>;

    async fn set_status(&self, task_id: i64, status: TaskStatus) -> StoreResult<()>;

    async fn set_machine(&self, task_id: i64, machine: &str) -> StoreResult<()>;

    async fn set_route(&self, task_id: i64, route: &str) -> StoreResult<()>;

    async fn add_error(&self, task_id: i64, message: &str) -> StoreResult<()>;

    /// Number of tasks, optionally only those with `status`
    async fn count_tasks(&self, status: Option<TaskStatus>) -> StoreResult<usize>;

    /// Overwrite stored targets with the given copies, matched by id
    async fn update_targets(&self, targets: &[Target]) -> StoreResult<()>;

    async fn view_longterm(&self, longterm_id: i64) -> StoreResult<Option<Longterm>>;

    async fn set_longterm_machine(&self, label: &str, longterm_id: i64) -> StoreResult<()>;

    async fn set_latest_longterm(&self, task_id: i64, longterm_id: i64) -> StoreResult<()>;

    /// Pending tasks of a series, in scheduling order
    async fn list_longterm_pending(&self, longterm_id: i64) -> StoreResult<Vec<Task>>;
}
