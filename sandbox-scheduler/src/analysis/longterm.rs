use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::regular::{Regular, StopMode};
use super::{AnalysisContext, AnalysisError, AnalysisManager, AnalysisStatus, ManagerCore};
use crate::models::{self, TaskType};
use crate::storage::TaskStore;

/// One task of a long-term series. The series keeps a single machine;
/// only its first task starts from the clean snapshot.
pub struct Longterm {
    base: Regular,
    series: Option<models::Longterm>,
    first: bool,
}

impl Longterm {
    pub const SUPPORTS: &'static [TaskType] = &[TaskType::Longterm];

    pub fn new(core: ManagerCore, ctx: Arc<AnalysisContext>) -> Self {
        Self {
            base: Regular::new(core, ctx),
            series: None,
            first: false,
        }
    }

    pub fn boxed(core: ManagerCore, ctx: Arc<AnalysisContext>) -> Box<dyn AnalysisManager> {
        Box::new(Self::new(core, ctx))
    }

    fn task_id(&self) -> i64 {
        self.base.core().task().id
    }

    async fn prepare_and_start(&self) -> Result<bool, AnalysisError> {
        if !self.first {
            debug!(task_id = self.task_id(), "Not the first task of the series, starting without snapshot restore");
        }
        self.base.bring_up(self.first, None).await?;

        let session = self.base.session()?;
        let monitor = self.base.core().task().option("monitor").unwrap_or("latest");
        session.guest.start_analysis(&session.options, monitor).await?;

        let status = self.base.core().analysis_status();
        if status != AnalysisStatus::Starting {
            error!(task_id = self.task_id(), status = %status, "Analysis status changed unexpectedly while starting the guest");
            return Ok(false);
        }
        Ok(true)
    }

    /// Wait for the guest on a helper task while processing the results
    /// gathered so far every poll interval
    async fn wait_and_poll(&self) -> Result<bool, AnalysisError> {
        let guest = self.base.session()?.guest.clone();
        let mut wait = tokio::spawn(async move { guest.wait_for_completion().await });

        let mut ticker = interval(self.base.ctx.config.analysis.longterm_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                finished = &mut wait => {
                    return match finished {
                        Ok(Ok(())) => Ok(true),
                        Ok(Err(e)) => {
                            error!(task_id = self.task_id(), error = %e, "Guest failure while waiting for the analysis");
                            Ok(false)
                        }
                        Err(e) => {
                            error!(task_id = self.task_id(), error = %e, "Guest wait task died");
                            Ok(false)
                        }
                    };
                }
                _ = ticker.tick() => {
                    if self.base.core().analysis_status() != AnalysisStatus::Running {
                        wait.abort();
                        return Ok(false);
                    }
                    debug!(task_id = self.task_id(), "Processing intermediate results");
                    self.base.process_results().await;
                }
            }
        }
    }
}

#[async_trait]
impl AnalysisManager for Longterm {
    fn core(&self) -> &ManagerCore {
        self.base.core()
    }

    async fn init(&mut self, store: &dyn TaskStore) -> bool {
        if !self.base.prepare().await {
            return false;
        }

        let task = self.base.core().task().clone();
        let Some(longterm_id) = task.longterm_id else {
            warn!(task_id = task.id, "Longterm task without series id");
            return false;
        };
        let mut series = match store.view_longterm(longterm_id).await {
            Ok(Some(series)) => series,
            Ok(None) => {
                warn!(task_id = task.id, longterm_id, "No longterm analysis found");
                return false;
            }
            Err(e) => {
                error!(task_id = task.id, error = %e, "Unable to load longterm analysis");
                return false;
            }
        };

        // No completed task yet means this run starts the series
        self.first = series.last_completed.is_none();
        if let Some(session) = self.base.session.as_mut() {
            session.options.extra.insert("lta.first".to_string(), Value::Bool(self.first));
        }

        if series.machine.is_none() {
            let label = self.base.core().machine().label;
            if let Err(e) = store.set_longterm_machine(&label, series.id).await {
                error!(task_id = task.id, error = %e, "Unable to bind machine to longterm analysis");
                return false;
            }
            if let Err(e) = store.machine_reserve(&label, task.id).await {
                error!(task_id = task.id, error = %e, "Unable to reserve machine");
                return false;
            }
            series.machine = Some(label);
        }

        self.series = Some(series);
        true
    }

    async fn run(&self) {
        let mut success = match self.prepare_and_start().await {
            Ok(success) => success,
            Err(e) => {
                error!(task_id = self.task_id(), error = %e, action = "task.start", "Failure during the starting of task");
                false
            }
        };

        if success && self.base.core().analysis_status() == AnalysisStatus::Starting {
            self.base.core().set_analysis_status(AnalysisStatus::Running, false).await;
            success = match self.wait_and_poll().await {
                Ok(done) => done,
                Err(e) => {
                    error!(task_id = self.task_id(), error = %e, "Failure while waiting for the analysis");
                    false
                }
            };
        } else {
            success = false;
        }

        if let Err(e) = self.base.teardown(StopMode::Safe, self.base.memory_dump_requested()).await {
            error!(task_id = self.task_id(), error = %e, action = "task.stop", "Failure during the stopping of task");
        }

        let status = if success { AnalysisStatus::Stopped } else { AnalysisStatus::Failed };
        self.base.core().set_analysis_status(status, true).await;
    }

    async fn on_status(&self, status: AnalysisStatus, store: &dyn TaskStore) -> Result<(), AnalysisError> {
        self.base.on_status(status, store).await
    }

    async fn finalize(&self, store: &dyn TaskStore) {
        self.base.set_latest().await;
        self.base.core().release_machine_lock();
        self.base.mark_if_failed(store).await;

        let task = self.base.core().task();
        let (Some(longterm_id), Some(series)) = (task.longterm_id, self.series.as_ref()) else {
            return;
        };
        if let Err(e) = store.set_latest_longterm(task.id, longterm_id).await {
            error!(task_id = task.id, error = %e, "Unable to record latest task of series");
        }

        if let Some(label) = series.machine.as_deref() {
            let next = match store.list_longterm_pending(longterm_id).await {
                Ok(pending) => pending.into_iter().next(),
                Err(e) => {
                    error!(task_id = task.id, error = %e, "Unable to list pending series tasks");
                    None
                }
            };
            let result = match next {
                Some(next) => {
                    info!(vmname = label, next_task = next.id, "Moving machine reservation to next task of series");
                    store.machine_reserve(label, next.id).await
                }
                None => {
                    info!(vmname = label, "Last task of series done, clearing machine reservation");
                    store.clear_reservation(label).await
                }
            };
            if let Err(e) = result {
                error!(task_id = task.id, error = %e, "Unable to update machine reservation");
            }
        }

        if let Err(e) = self.base.core().release_machine().await {
            error!(task_id = task.id, error = %e, "Unable to release machine");
        }
    }
}
