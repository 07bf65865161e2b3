use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::limiter::StartupLimiter;
use crate::analysis::{AnalysisContext, AnalysisError, AnalysisManager, ManagerCore, ManagerRegistry};
use crate::config::SchedulerConfig;
use crate::models::{Machine, Task, TaskStatus};
use crate::sandbox::MachineError;
use crate::storage::{FetchQuery, StoreError, TaskStore};
use crate::utils::{format_size_mb, free_space_mb};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The scheduler cannot run at all
    #[error("Critical error: {0}")]
    Critical(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Machine error: {0}")]
    Machine(#[from] MachineError),
}

/// Lets other tasks, such as a signal handler, ask the scheduler to stop
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

struct Worker {
    manager: Arc<dyn AnalysisManager>,
    handle: JoinHandle<()>,
}

/// Matches pending tasks to free machines and supervises their analysis
/// managers.
///
/// All machine locking and every store change that follows from a status
/// change happen on the scheduler's own task, one tick at a time.
pub struct Scheduler {
    config: SchedulerConfig,
    analyses_path: PathBuf,
    store: Arc<dyn TaskStore>,
    ctx: Arc<AnalysisContext>,
    registry: ManagerRegistry,
    limiter: StartupLimiter,
    workers: Vec<Worker>,
    total_analysis_count: u64,
    running: Arc<AtomicBool>,
    machinery_stopped: bool,
}

impl Scheduler {
    pub fn new(ctx: Arc<AnalysisContext>, store: Arc<dyn TaskStore>, registry: ManagerRegistry) -> Self {
        let config = ctx.config.scheduler.clone();
        Self {
            limiter: StartupLimiter::new(config.max_vmstartup_count),
            analyses_path: ctx.config.analysis.analyses_path(),
            config,
            store,
            ctx,
            registry,
            workers: Vec::new(),
            total_analysis_count: 0,
            running: Arc::new(AtomicBool::new(true)),
            machinery_stopped: false,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: self.running.clone(),
        }
    }

    pub fn total_analysis_count(&self) -> u64 {
        self.total_analysis_count
    }

    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn limiter(&self) -> &StartupLimiter {
        &self.limiter
    }

    /// Initialize the machinery and check there is something to run on
    pub async fn initialize(&self) -> Result<(), SchedulerError> {
        self.ctx.machinery.initialize().await?;

        let machines = self.ctx.machinery.machines().await?;
        if machines.is_empty() {
            return Err(SchedulerError::Critical(
                "No machines available, check the machinery configuration".to_string(),
            ));
        }

        if self.config.max_machines_count > 0 && self.config.max_machines_count > machines.len() {
            warn!(
                max_machines_count = self.config.max_machines_count,
                machines = machines.len(),
                "Machine ceiling is above the number of machines"
            );
        }

        info!(
            machines = machines.len(),
            max_vmstartup_count = self.limiter.max(),
            "Loaded machines"
        );
        Ok(())
    }

    /// Tick until stopped, then shut the machinery down
    pub async fn run(&mut self) {
        info!(tick_ms = self.config.tick_ms, "Waiting for analysis tasks");

        let mut ticker = interval(self.config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.tick().await;
        }

        self.stop().await;
    }

    /// One scheduling pass: intake of a pending task, then servicing of the
    /// workers
    pub async fn tick(&mut self) {
        match self.store.count_tasks(Some(TaskStatus::Pending)).await {
            Ok(0) => {}
            Ok(_) => {
                if self.ready_for_new_run().await {
                    if let Err(e) = self.handle_pending().await {
                        error!(error = %e, "Failed to schedule pending task");
                    }
                }
            }
            Err(e) => error!(error = %e, "Unable to count pending tasks"),
        }

        self.handle_managers().await;
    }

    /// Clear the running flag and stop any machine still running
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if self.machinery_stopped {
            return;
        }
        self.machinery_stopped = true;
        info!(workers = self.workers.len(), "Stopping scheduler");
        self.ctx.machinery.shutdown().await;
    }

    pub async fn ready_for_new_run(&mut self) -> bool {
        if !self.limiter.available() {
            debug!(in_use = self.limiter.in_use(), "All machine startup permits in use");
            return false;
        }

        if self.config.freespace_mb > 0 {
            match free_space_mb(&self.analyses_path) {
                Ok(free) if free <= self.config.freespace_mb => {
                    error!(
                        free = %format_size_mb(free),
                        path = %self.analyses_path.display(),
                        "Not enough free disk space, not starting new analyses"
                    );
                    return false;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Unable to determine free disk space, skipping check"),
            }
        }

        if self.config.max_machines_count > 0 {
            let running = self.ctx.machinery.running().await.len();
            if running >= self.config.max_machines_count {
                debug!(running, max = self.config.max_machines_count, "Maximum running machines reached");
                return false;
            }
        }

        if self.config.max_analysis_count > 0 && self.total_analysis_count >= self.config.max_analysis_count {
            if self.workers.is_empty() {
                info!(
                    total = self.total_analysis_count,
                    "Maximum analysis count reached, stopping"
                );
                self.stop().await;
            }
            return false;
        }

        match self.ctx.machinery.availables().await {
            Ok(0) => {
                debug!("No free machines");
                false
            }
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Unable to count free machines");
                false
            }
        }
    }

    /// Match one pending task to a machine and start its analysis
    pub async fn handle_pending(&mut self) -> Result<(), SchedulerError> {
        let Some(permit) = self.limiter.try_acquire() else {
            return Ok(());
        };

        let available = self.store.get_available_machines().await?;
        match self.select_task(&available).await? {
            Some((task, machine)) => self.start_analysis(task, machine, permit).await,
            None => Ok(()),
        }
    }

    async fn acquire_named(&self, name: &str, task_id: i64) -> Option<Machine> {
        match self.ctx.machinery.acquire(Some(name), None, &[], Some(task_id)).await {
            Ok(machine) => machine,
            Err(e) => {
                warn!(vmname = name, error = %e, "Unable to lock machine");
                None
            }
        }
    }

    async fn select_task(&self, available: &[Machine]) -> Result<Option<(Task, Machine)>, SchedulerError> {
        // Machines kept for the next task of a long-term series
        for machine in available {
            let Some(task_id) = machine.reserved_by else {
                continue;
            };
            if let Some(task) = self.store.fetch(FetchQuery::for_task(task_id)).await? {
                if let Some(locked) = self.acquire_named(&machine.name, task.id).await {
                    return Ok(Some((task, locked)));
                }
            }
        }

        // Tasks asking for a specific machine that is free now
        for machine in available {
            if let Some(task) = self.store.fetch(FetchQuery::for_machine(&machine.name)).await? {
                if let Some(locked) = self.acquire_named(&machine.name, task.id).await {
                    return Ok(Some((task, locked)));
                }
            }
        }

        if !available.iter().any(Machine::is_analysis) {
            debug!("Only service machines are free");
            return Ok(None);
        }

        let mut exclude = Vec::new();
        loop {
            let Some(task) = self.store.fetch(FetchQuery::analysis(&exclude)).await? else {
                return Ok(None);
            };

            match self
                .ctx
                .machinery
                .acquire(task.machine.as_deref(), task.platform.as_deref(), &task.tags, Some(task.id))
                .await
            {
                Ok(Some(machine)) => return Ok(Some((task, machine))),
                Ok(None) => {
                    debug!(task_id = task.id, requirements = %task.requirements_str(), "No matching machine free");
                    exclude.push(task.id);
                }
                Err(MachineError::NoMatch) => {
                    self.fail_unschedulable(&task).await?;
                    exclude.push(task.id);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn fail_unschedulable(&self, task: &Task) -> Result<(), SchedulerError> {
        let message = format!(
            "No machine matches the task requirements ({})",
            task.requirements_str()
        );
        error!(task_id = task.id, requirements = %task.requirements_str(), "Task cannot be run on any machine");
        self.store.set_status(task.id, TaskStatus::FailedAnalysis).await?;
        self.store.add_error(task.id, &message).await?;
        Ok(())
    }

    async fn release_machine(&self, machine: &Machine) {
        if let Err(e) = self.ctx.machinery.release(&machine.label).await {
            error!(vmname = %machine.name, error = %e, "Unable to release machine");
        }
    }

    async fn start_analysis(
        &mut self,
        task: Task,
        machine: Machine,
        permit: OwnedSemaphorePermit,
    ) -> Result<(), SchedulerError> {
        let core = ManagerCore::new(task.clone(), machine.clone(), self.ctx.machinery.clone(), Some(permit));
        let mut manager = match self.registry.build(core, self.ctx.clone()) {
            Ok(manager) => manager,
            Err(_core) => {
                error!(task_id = task.id, task_type = %task.task_type, "No analysis manager for task type");
                self.release_machine(&machine).await;
                return Ok(());
            }
        };

        info!(
            task_id = task.id,
            vmname = %machine.name,
            task_type = %task.task_type,
            "Task assigned to machine"
        );

        if let Err(e) = self.store.set_status(task.id, TaskStatus::Running).await {
            error!(task_id = task.id, error = %e, "Unable to mark task running");
            Self::abandon(manager.core()).await;
            return Ok(());
        }
        self.total_analysis_count += 1;

        if !manager.init(self.store.as_ref()).await {
            error!(task_id = task.id, "Initialization of analysis manager failed");
            if let Err(e) = self.store.set_status(task.id, TaskStatus::FailedAnalysis).await {
                error!(task_id = task.id, error = %e, "Unable to update task status");
            }
            Self::abandon(manager.core()).await;
            return Ok(());
        }

        let manager: Arc<dyn AnalysisManager> = Arc::from(manager);
        let runner = manager.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        self.workers.push(Worker { manager, handle });
        Ok(())
    }

    /// Give back the startup permit and machine of an analysis that never ran
    async fn abandon(core: &ManagerCore) {
        core.release_machine_lock();
        if let Err(e) = core.release_machine().await {
            error!(task_id = core.task().id, error = %e, "Unable to release machine");
        }
    }

    /// Run handlers for outstanding action requests and finalize workers
    /// that are done
    pub async fn handle_managers(&mut self) {
        for worker in &self.workers {
            let core = worker.manager.core();
            let Some(status) = core.requested_action() else {
                continue;
            };

            debug!(task_id = core.task().id, status = %status, "Handling scheduler action");
            match worker.manager.on_status(status, self.store.as_ref()).await {
                Ok(()) => {}
                Err(e @ AnalysisError::NoHandler(_)) => {
                    warn!(task_id = core.task().id, error = %e, "Action request without handler")
                }
                Err(e) => error!(task_id = core.task().id, status = %status, error = %e, "Action handler failed"),
            }
            core.release_action();
        }

        let (finished, live): (Vec<Worker>, Vec<Worker>) = std::mem::take(&mut self.workers)
            .into_iter()
            .partition(|w| w.handle.is_finished());
        self.workers = live;

        for worker in finished {
            let task_id = worker.manager.core().task().id;
            if let Err(e) = worker.handle.await {
                error!(task_id, error = %e, "Analysis worker panicked");
            }
            worker.manager.finalize(self.store.as_ref()).await;
            debug!(task_id, "Analysis worker finalized");
        }
    }
}
