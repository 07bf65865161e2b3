use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use shared::messaging::CommandChannel;

use super::{AnalysisContext, AnalysisError, AnalysisManager, AnalysisStatus, ManagerCore};
use crate::models::{TaskStatus, TaskType};
use crate::sandbox::{GuestManager, GuestOptions, MachineError, Route};
use crate::storage::TaskStore;
use crate::utils::{check_target_readable, TaskDir};

/// Everything built for a task by `init`
pub(crate) struct Session {
    pub options: GuestOptions,
    pub guest: Arc<dyn GuestManager>,
    pub route: Arc<dyn Route>,
    pub dir: TaskDir,
    pub control_enabled: bool,
}

/// How the machine is brought down after an analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopMode {
    /// Power off, discarding state
    Hard,
    /// Keep machine state for the next task of a series
    Safe,
}

/// Single target analysis: one file, URL or archive per machine run
pub struct Regular {
    core: ManagerCore,
    pub(crate) ctx: Arc<AnalysisContext>,
    pub(crate) session: Option<Session>,
    processing_success: AtomicBool,
}

impl Regular {
    pub const SUPPORTS: &'static [TaskType] = &[TaskType::Regular, TaskType::Baseline, TaskType::Service];

    pub fn new(core: ManagerCore, ctx: Arc<AnalysisContext>) -> Self {
        Self {
            core,
            ctx,
            session: None,
            processing_success: AtomicBool::new(false),
        }
    }

    pub fn boxed(core: ManagerCore, ctx: Arc<AnalysisContext>) -> Box<dyn AnalysisManager> {
        Box::new(Self::new(core, ctx))
    }

    pub(crate) fn session(&self) -> Result<&Session, AnalysisError> {
        self.session.as_ref().ok_or(AnalysisError::NotInitialized)
    }

    fn task_id(&self) -> i64 {
        self.core.task().id
    }

    /// Create the task directory, check the target and build the session
    pub(crate) async fn prepare(&mut self) -> bool {
        let task = self.core.task();
        let machine = self.core.machine();

        let target = task.primary_target();
        if target.is_none() && !matches!(task.task_type, TaskType::Baseline | TaskType::Service) {
            error!(task_id = task.id, "Task has no targets");
            return false;
        }

        let dir = TaskDir::new(&self.ctx.config.analysis.analyses_path(), task.id);
        if let Err(e) = dir.create().await {
            error!(task_id = task.id, error = %e, "Unable to create task directory");
            return false;
        }

        if let Some(target) = target {
            if let Err(e) = check_target_readable(target).await {
                error!(task_id = task.id, error = %e, "Target is not readable");
                return false;
            }
        }

        let options = GuestOptions::build(task, target, &machine);
        let guest = self.ctx.guests.create(task, &machine);
        let route = self.ctx.routing.route_for(task, &machine);
        let control_enabled =
            self.ctx.config.analysis.remote_control && task.options.contains_key("remotecontrol");

        if let Err(e) = dir.write_task_json(task, None).await {
            error!(task_id = task.id, error = %e, "Unable to write task.json");
            return false;
        }

        self.session = Some(Session {
            options,
            guest,
            route,
            dir,
            control_enabled,
        });
        true
    }

    /// Register the task, start helpers, start the machine and apply
    /// routing. The startup permit is given back once the machine runs.
    pub(crate) async fn bring_up(
        &self,
        revert: bool,
        channel: Option<Arc<CommandChannel>>,
    ) -> Result<(), AnalysisError> {
        let session = self.session()?;
        let task = self.core.task();
        let machine = self.core.machine();
        self.core.set_analysis_status(AnalysisStatus::Starting, false).await;

        info!(
            task_id = task.id,
            task_type = %task.task_type,
            category = %session.options.category,
            target = %session.options.target,
            package = ?task.package,
            options = %session.options.options,
            action = "task.init",
            "Starting analysis"
        );

        self.ctx.collector.add_task(task, &machine, channel).await;
        self.ctx.auxiliary.start(task, &machine).await;

        if session.control_enabled {
            self.core.machinery().enable_remote_control(&machine.label).await?;
        }

        info!(vmname = %machine.name, action = "vm.start", status = "pending", "Starting VM");
        if let Err(e) = self.core.machinery().start(&machine.label, task, revert).await {
            match &e {
                MachineError::Snapshot { .. } => error!(
                    vmname = %machine.name,
                    error = %e,
                    action = "vm.resume",
                    "Unable to restore the snapshot of this machine"
                ),
                _ => error!(vmname = %machine.name, error = %e, action = "vm.start", "Error starting machine"),
            }
            return Err(e.into());
        }
        info!(vmname = %machine.name, action = "vm.start", status = "success", "Started VM");

        if !session.route.route_network().await {
            warn!(task_id = task.id, route = session.route.name(), "Network route could not be applied");
        }

        self.core.release_machine_lock();
        self.core.request_scheduler_action(AnalysisStatus::Starting).await;
        Ok(())
    }

    /// Drive the guest until the analysis finishes
    async fn manage(&self) -> Result<(), AnalysisError> {
        let session = self.session()?;
        let task = self.core.task();
        let machine = self.core.machine();

        if machine.has_option("noagent") {
            debug!(task_id = task.id, "Machine has no agent, not waiting for guest");
            self.core.set_analysis_status(AnalysisStatus::Running, false).await;
        } else if task.task_type == TaskType::Baseline {
            debug!(task_id = task.id, "Sleeping until timeout for baseline");
            self.core.set_analysis_status(AnalysisStatus::Running, false).await;
            tokio::time::sleep(Duration::from_secs(session.options.timeout)).await;
        } else {
            let monitor = task.option("monitor").unwrap_or("latest");
            session.guest.start_analysis(&session.options, monitor).await?;

            if self.core.analysis_status() == AnalysisStatus::Starting {
                self.core.set_analysis_status(AnalysisStatus::Running, false).await;
                session.guest.wait_for_completion().await?;
            }
        }
        Ok(())
    }

    async fn start_and_wait(&self) -> Result<bool, AnalysisError> {
        self.bring_up(true, None).await?;
        if let Err(e) = self.manage().await {
            match &e {
                AnalysisError::Guest(crate::sandbox::GuestError::CriticalTimeout(_)) => error!(
                    task_id = self.task_id(),
                    error = %e,
                    action = "guest.handle",
                    "Host was unable to connect to the guest, check the machine network configuration"
                ),
                _ => error!(task_id = self.task_id(), error = %e, action = "guest.handle", "Guest failure"),
            }
            return Ok(false);
        }
        Ok(self.core.analysis_status() != AnalysisStatus::Failed)
    }

    /// Stop helpers and the machine and undo routing. Each step is tried
    /// even when an earlier one failed.
    pub(crate) async fn teardown(&self, mode: StopMode, memory_dump: bool) -> Result<(), AnalysisError> {
        let session = self.session()?;
        let task = self.core.task();
        let machine = self.core.machine();
        self.core.set_analysis_status(AnalysisStatus::Stopping, false).await;

        self.ctx.auxiliary.stop(task).await;

        if memory_dump {
            let dump_path = session.dir.path().join("memory").join("memory.dmp");
            info!(vmname = %machine.name, action = "vm.memdump", "Taking full memory dump");
            match self.core.machinery().dump_memory(&machine.label, &dump_path).await {
                Ok(()) => info!(vmname = %machine.name, action = "vm.memdump", status = "success", "Memory dump taken"),
                Err(e) => error!(vmname = %machine.name, error = %e, action = "vm.memdump", "Memory dump failed"),
            }
        }

        info!(vmname = %machine.name, action = "vm.stop", status = "pending", "Stopping VM");
        let stopped = match mode {
            StopMode::Hard => self.core.machinery().stop(&machine.label).await,
            StopMode::Safe => self.core.machinery().stop_safe(&machine.label).await,
        };
        if let Err(e) = stopped {
            warn!(vmname = %machine.name, error = %e, action = "vm.stop", "Unable to stop machine");
        }

        if session.control_enabled {
            if let Err(e) = self.core.machinery().disable_remote_control(&machine.label).await {
                warn!(vmname = %machine.name, error = %e, "Unable to disable remote control");
            }
        }

        self.ctx.collector.del_task(task, &machine).await;
        session.route.unroute_network().await;
        Ok(())
    }

    pub(crate) fn memory_dump_requested(&self) -> bool {
        self.ctx.config.analysis.memory_dump || self.core.task().memory
    }

    /// Run the result processor once, logging failures
    pub(crate) async fn process_results(&self) -> bool {
        info!(task_id = self.task_id(), action = "task.report", status = "pending", "Processing results");
        match self.ctx.processor.process(self.core.task()).await {
            Ok(success) => success,
            Err(e) => {
                error!(task_id = self.task_id(), error = %e, action = "task.report", "Error during processing");
                false
            }
        }
    }

    pub(crate) async fn write_task_json(&self, status: TaskStatus) {
        if let Ok(session) = self.session() {
            if let Err(e) = session.dir.write_task_json(self.core.task(), Some(status)).await {
                warn!(task_id = self.task_id(), error = %e, "Unable to write task.json");
            }
        }
    }

    /// Set a task status in the store and in task.json
    pub(crate) async fn set_task_status(&self, store: &dyn TaskStore, status: TaskStatus) {
        debug!(task_id = self.task_id(), status = %status, "Setting task status");
        self.write_task_json(status).await;
        if let Err(e) = store.set_status(self.task_id(), status).await {
            error!(task_id = self.task_id(), error = %e, "Unable to update task status");
        }
    }

    pub(crate) async fn on_starting(&self, store: &dyn TaskStore) -> Result<(), AnalysisError> {
        let route = self.session()?.route.name().to_string();
        let machine = self.core.machine();
        info!(task_id = self.task_id(), route = %route, "Using route");
        store.set_route(self.task_id(), &route).await?;
        store.set_machine(self.task_id(), &machine.name).await?;
        Ok(())
    }

    pub(crate) async fn on_stopped(&self, store: &dyn TaskStore) -> Result<(), AnalysisError> {
        self.set_task_status(store, TaskStatus::Completed).await;
        self.core.release_machine().await
    }

    pub(crate) async fn on_failed(&self) -> Result<(), AnalysisError> {
        error!(task_id = self.task_id(), "Analysis failed");
        self.core.release_machine().await
    }

    /// Mark the analysis failed unless it stopped cleanly
    pub(crate) async fn mark_if_failed(&self, store: &dyn TaskStore) {
        let status = self.core.analysis_status();
        if status != AnalysisStatus::Stopped {
            warn!(task_id = self.task_id(), status = %status, "Analysis did not stop cleanly");
            self.set_task_status(store, TaskStatus::FailedAnalysis).await;
        }
    }

    pub(crate) async fn set_latest(&self) {
        if let Ok(session) = self.session() {
            if let Err(e) = session.dir.set_latest().await {
                debug!(task_id = self.task_id(), error = %e, "Unable to update latest symlink");
            }
        }
    }
}

#[async_trait]
impl AnalysisManager for Regular {
    fn core(&self) -> &ManagerCore {
        &self.core
    }

    async fn init(&mut self, _store: &dyn TaskStore) -> bool {
        self.prepare().await
    }

    async fn run(&self) {
        let success = match self.start_and_wait().await {
            Ok(success) => success,
            Err(e) => {
                error!(task_id = self.task_id(), error = %e, action = "task.start", "Failure during the starting of task");
                false
            }
        };

        if let Err(e) = self.teardown(StopMode::Hard, self.memory_dump_requested()).await {
            error!(task_id = self.task_id(), error = %e, action = "task.stop", "Failure during the stopping of task");
        }

        let status = if success { AnalysisStatus::Stopped } else { AnalysisStatus::Failed };
        self.core.set_analysis_status(status, true).await;

        if !self.ctx.config.analysis.process_results {
            debug!(task_id = self.task_id(), "Result processing disabled");
            return;
        }
        let processed = self.process_results().await;
        self.processing_success.store(processed, Ordering::SeqCst);
        info!(task_id = self.task_id(), action = "task.report", status = "finished", "Analysis procedure completed");
    }

    async fn on_status(&self, status: AnalysisStatus, store: &dyn TaskStore) -> Result<(), AnalysisError> {
        match status {
            AnalysisStatus::Starting => self.on_starting(store).await,
            AnalysisStatus::Stopped => self.on_stopped(store).await,
            AnalysisStatus::Failed => self.on_failed().await,
            other => Err(AnalysisError::NoHandler(other)),
        }
    }

    async fn finalize(&self, store: &dyn TaskStore) {
        self.set_latest().await;
        self.core.release_machine_lock();

        let processing = self.ctx.config.analysis.process_results;
        if !processing {
            self.mark_if_failed(store).await;
        } else if self.processing_success.load(Ordering::SeqCst) {
            self.set_task_status(store, TaskStatus::Reported).await;
        } else {
            self.set_task_status(store, TaskStatus::FailedProcessing).await;
        }

        if let Err(e) = self.core.release_machine().await {
            error!(task_id = self.task_id(), error = %e, "Unable to release machine");
        }
    }
}
