use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use shared::messaging::{
    Command, CommandChannel, EventHub, EventMessage, EVENT_MASSURL_DETECTION, EVENT_MASSURL_TASK,
    EVENT_SIGNATURE,
};

use super::regular::{Regular, StopMode};
use super::{AnalysisContext, AnalysisError, AnalysisManager, AnalysisStatus, ManagerCore};
use crate::models::{Target, TaskStatus, TaskType, URLDiary};
use crate::sandbox::{GuestError, RealtimeError};
use crate::storage::TaskStore;

/// Seconds the guest gets per URL to answer a `start_package` command
const START_PACKAGE_SECS_PER_URL: u64 = 10;
const STOP_ANALYZER_MAXWAIT: Duration = Duration::from_secs(3);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Split targets into consecutive blocks of at most `size`
fn partition(targets: &[Target], size: usize) -> VecDeque<Vec<Target>> {
    targets.chunks(size.max(1)).map(|chunk| chunk.to_vec()).collect()
}

fn urls(block: &[Target]) -> Vec<String> {
    block.iter().map(|t| t.target.clone()).collect()
}

/// Keep only complete detection events raised for `task_id`
fn detection_filter(task_id: i64, detections: Arc<Mutex<Vec<Value>>>) -> shared::messaging::EventCallback {
    Arc::new(move |message: &EventMessage| {
        if message.body.get("taskid").and_then(Value::as_i64) != Some(task_id) {
            return Ok(());
        }
        if ["description", "ioc", "signature"]
            .iter()
            .any(|key| message.body.get(key).is_none())
        {
            return Ok(());
        }
        info!(task_id, "Incoming detection event");
        lock(&detections).push(message.body.clone());
        Ok(())
    })
}

/// Opens many URLs in one machine, a block at a time, and stops as soon as
/// one block triggers a detection
pub struct MassUrl {
    base: Regular,
    channel: Arc<CommandChannel>,
    blocks: Mutex<VecDeque<Vec<Target>>>,
    current: Mutex<Vec<Target>>,
    detections: Arc<Mutex<Vec<Value>>>,
    block_time: Duration,
    aborted: AtomicBool,
    completed: AtomicBool,
}

impl MassUrl {
    pub const SUPPORTS: &'static [TaskType] = &[TaskType::Massurl];

    pub fn new(core: ManagerCore, ctx: Arc<AnalysisContext>) -> Self {
        let block_time = core
            .task()
            .option_or("blocktime", ctx.config.massurl.block_time_secs);
        Self {
            base: Regular::new(core, ctx),
            channel: Arc::new(CommandChannel::new()),
            blocks: Mutex::new(VecDeque::new()),
            current: Mutex::new(Vec::new()),
            detections: Arc::new(Mutex::new(Vec::new())),
            block_time: Duration::from_secs(block_time),
            aborted: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        }
    }

    pub fn boxed(core: ManagerCore, ctx: Arc<AnalysisContext>) -> Box<dyn AnalysisManager> {
        Box::new(Self::new(core, ctx))
    }

    fn task_id(&self) -> i64 {
        self.base.core().task().id
    }

    fn current_block(&self) -> Vec<Target> {
        lock(&self.current).clone()
    }

    /// Move to the next block; false when none is left
    fn advance(&self) -> bool {
        match lock(&self.blocks).pop_front() {
            Some(block) => {
                *lock(&self.current) = block;
                true
            }
            None => {
                lock(&self.current).clear();
                false
            }
        }
    }

    fn announce(&self, hub: &dyn EventHub, event: &str, body: Value) {
        if let Err(e) = hub.send_event(event, body) {
            warn!(task_id = self.task_id(), event, error = %e, "Unable to send event");
        }
    }

    async fn start_run(&self) -> Result<bool, AnalysisError> {
        self.base.bring_up(true, Some(self.channel.clone())).await?;

        let session = self.base.session()?;
        let monitor = self.base.core().task().option("monitor").unwrap_or("latest");
        match session.guest.start_analysis(&session.options, monitor).await {
            Ok(()) => {}
            Err(e @ GuestError::CriticalTimeout(_)) => {
                error!(task_id = self.task_id(), error = %e, "Critical timeout reached while starting virtual machine");
                return Ok(false);
            }
            Err(e) => {
                error!(task_id = self.task_id(), error = %e, "Failed to prepare guest for analysis");
                return Ok(false);
            }
        }
        Ok(self.base.core().analysis_status() == AnalysisStatus::Starting)
    }

    /// Let the open block run, then close it. Returns the detections
    /// gathered for it.
    async fn run_block(&self, hub: &dyn EventHub, block: &[Target], diaries: &mut [URLDiary]) -> Vec<Value> {
        let task = self.base.core().task();
        lock(&self.detections).clear();

        self.announce(
            hub,
            EVENT_MASSURL_TASK,
            json!({
                "taskid": task.id,
                "status": self.base.core().analysis_status(),
                "action": "newbatch",
            }),
        );

        tokio::time::sleep(self.block_time).await;
        // Give signatures that already fired time to gather more context
        if !lock(&self.detections).is_empty() {
            tokio::time::sleep(self.block_time).await;
        }

        if let Err(e) = self.channel.send_command(Command::stop_all_packages(), None) {
            error!(task_id = task.id, error = %e, "Error sending package stop command");
        }

        self.announce(
            hub,
            EVENT_MASSURL_TASK,
            json!({
                "taskid": task.id,
                "status": self.base.core().analysis_status(),
                "action": "batchclosed",
            }),
        );

        let maxwait = self.base.ctx.config.massurl.realtime_maxwait();
        match self.base.ctx.realtime.summarize(task, &urls(block), maxwait).await {
            Ok(summary) => {
                for diary in diaries.iter_mut() {
                    if let Some(requested) = summary.requested.get(&diary.url) {
                        diary.requested_urls.extend(requested.iter().cloned());
                    }
                    if let Some(javascript) = summary.javascript.get(&diary.url) {
                        diary.javascript.extend(javascript.iter().cloned());
                    }
                }
                lock(&self.detections).extend(summary.signatures);
            }
            Err(e @ RealtimeError::BlockingExpired(_)) => {
                warn!(task_id = task.id, error = %e, "No block summary from realtime processor");
            }
            Err(e) => error!(task_id = task.id, error = %e, "Realtime processing of block failed"),
        }

        std::mem::take(&mut *lock(&self.detections))
    }

    async fn report_detection(&self, hub: &dyn EventHub, block: &[Target], diaries: &mut [URLDiary], detections: Vec<Value>) {
        let task_id = self.task_id();
        info!(task_id, count = detections.len(), "Detected events in block");

        let signatures: Vec<Value> = detections
            .iter()
            .map(|ev| {
                json!({
                    "signature": ev.get("signature"),
                    "description": ev.get("description"),
                    "ioc": ev.get("ioc"),
                })
            })
            .collect();

        let mut body = json!({
            "taskid": task_id,
            "status": AnalysisStatus::Aborted,
            "candidates": urls(block),
            "signatures": signatures,
        });

        // A single URL block pins the detection on that URL
        if let [diary] = diaries {
            diary.add_signatures(&signatures);
            match self.base.ctx.diaries.store_diary(diary).await {
                Ok(id) => body["diary_id"] = json!(id),
                Err(e) => error!(task_id, error = %e, "Unable to store URL diary"),
            }
        }

        self.announce(hub, EVENT_MASSURL_DETECTION, body);
    }

    async fn store_diaries(&self, diaries: &[URLDiary]) {
        for diary in diaries {
            if let Err(e) = self.base.ctx.diaries.store_diary(diary).await {
                error!(task_id = self.task_id(), url = %diary.url, error = %e, "Unable to store URL diary");
            }
        }
    }

    /// Feed blocks to the guest until the targets run out, a detection
    /// fires or the guest goes away
    async fn run_analysis(&self, hub: &dyn EventHub, wait: &JoinHandle<Result<(), GuestError>>) {
        loop {
            if wait.is_finished() {
                warn!(task_id = self.task_id(), "Guest stopped before all URLs were opened");
                return;
            }

            self.base.core().request_scheduler_action(AnalysisStatus::NewUrlBlock).await;

            let block = self.current_block();
            let mut diaries: Vec<URLDiary> = block
                .iter()
                .map(|t| URLDiary::new(t.target.clone(), t.sha256.clone()))
                .collect();

            let detections = self.run_block(hub, &block, &mut diaries).await;
            if !detections.is_empty() {
                self.report_detection(hub, &block, &mut diaries, detections).await;
                self.base.core().request_scheduler_action(AnalysisStatus::Aborted).await;
                return;
            }

            self.store_diaries(&diaries).await;

            if !self.advance() {
                break;
            }

            let next = self.current_block();
            let task = self.base.core().task();
            let maxwait = Duration::from_secs(START_PACKAGE_SECS_PER_URL * next.len() as u64);
            let command = Command::start_package("url", &urls(&next), task.package.as_deref(), &task.options);
            if let Err(e) = self.channel.send_command_blocking(command, maxwait).await {
                error!(task_id = task.id, error = %e, "No response from guest or it failed to open new URLs");
                return;
            }
            debug!(task_id = task.id, urls = next.len(), "Opened next URL block");
        }

        self.completed.store(true, Ordering::SeqCst);
    }

    async fn stop_and_wait(&self) {
        if self.channel.is_attached() {
            if let Err(e) = self
                .channel
                .send_command_blocking(Command::stop_analyzer(), STOP_ANALYZER_MAXWAIT)
                .await
            {
                warn!(task_id = self.task_id(), error = %e, "No response from analyzer to stopping request");
            }
        }
        if let Err(e) = self.base.teardown(StopMode::Hard, false).await {
            error!(task_id = self.task_id(), error = %e, action = "task.stop", "Failure while stopping analysis");
        }
    }
}

#[async_trait]
impl AnalysisManager for MassUrl {
    fn core(&self) -> &ManagerCore {
        self.base.core()
    }

    async fn init(&mut self, _store: &dyn TaskStore) -> bool {
        if !self.base.prepare().await {
            return false;
        }

        let task = self.base.core().task();
        let block_size = task.option_or("urlblocksize", self.base.ctx.config.massurl.block_size);
        let mut blocks = partition(&task.targets, block_size);
        let Some(first) = blocks.pop_front() else {
            error!(task_id = task.id, "Empty target list, cannot proceed");
            return false;
        };

        let timeout = task.targets.len() as u64 * self.block_time.as_secs() * 3;
        if let Some(session) = self.base.session.as_mut() {
            session.options.category = "url".to_string();
            session.options.target = urls(&first).join(",");
            session.options.enforce_timeout = true;
            session.options.timeout = timeout;
        }

        *lock(&self.blocks) = blocks;
        *lock(&self.current) = first;
        true
    }

    async fn run(&self) {
        let Some(hub) = self.base.ctx.events.connect().await else {
            error!(task_id = self.task_id(), "Could not connect to event bus, aborting");
            self.base.core().set_analysis_status(AnalysisStatus::Failed, true).await;
            return;
        };
        let subscription = hub.subscribe(
            EVENT_SIGNATURE,
            detection_filter(self.task_id(), self.detections.clone()),
        );

        info!(
            task_id = self.task_id(),
            urls = self.base.core().task().targets.len(),
            "Starting mass URL analysis"
        );

        match self.start_run().await {
            Ok(true) => {
                self.base.core().set_analysis_status(AnalysisStatus::Running, false).await;
                let guest = self.base.session.as_ref().map(|s| s.guest.clone());
                if let Some(guest) = guest {
                    let wait = tokio::spawn(async move { guest.wait_for_completion().await });
                    self.run_analysis(hub.as_ref(), &wait).await;
                    wait.abort();
                }
            }
            Ok(false) => {}
            Err(e) => error!(task_id = self.task_id(), error = %e, "Failure during analysis run"),
        }

        self.stop_and_wait().await;
        hub.unsubscribe(subscription);

        let status = if self.completed.load(Ordering::SeqCst) || self.aborted.load(Ordering::SeqCst) {
            AnalysisStatus::Stopped
        } else {
            AnalysisStatus::Failed
        };
        self.base.core().set_analysis_status(status, true).await;
    }

    async fn on_status(&self, status: AnalysisStatus, store: &dyn TaskStore) -> Result<(), AnalysisError> {
        match status {
            AnalysisStatus::Starting => self.base.on_starting(store).await,
            AnalysisStatus::NewUrlBlock => {
                let mut block = self.current_block();
                debug!(task_id = self.task_id(), urls = block.len(), "Uploaded new URL block");
                for target in block.iter_mut() {
                    target.analyzed = true;
                }
                store.update_targets(&block).await?;
                Ok(())
            }
            AnalysisStatus::Aborted => {
                info!(task_id = self.task_id(), "Task aborted");
                self.aborted.store(true, Ordering::SeqCst);
                self.base.set_task_status(store, TaskStatus::Aborted).await;
                Ok(())
            }
            AnalysisStatus::Stopped | AnalysisStatus::Failed => self.base.core().release_machine().await,
            other => Err(AnalysisError::NoHandler(other)),
        }
    }

    async fn finalize(&self, store: &dyn TaskStore) {
        self.base.set_latest().await;
        self.base.core().release_machine_lock();
        self.base.mark_if_failed(store).await;

        if self.completed.load(Ordering::SeqCst) {
            info!(task_id = self.task_id(), "Setting task to reported");
            self.base.set_task_status(store, TaskStatus::Reported).await;
        }

        if let Err(e) = self.base.core().release_machine().await {
            error!(task_id = self.task_id(), error = %e, "Unable to release machine");
        }
    }
}
