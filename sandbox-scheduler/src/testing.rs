//! Fakes and a harness for driving analysis managers in tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

use shared::messaging::{
    CommandChannel, EventCallback, EventHub, EventMessage, MessageResult, SubscriptionId,
    EVENT_MASSURL_TASK, EVENT_SIGNATURE,
};

use crate::analysis::{AnalysisContext, AnalysisManager, ManagerCore};
use crate::config::Config;
use crate::models::{Longterm, Machine, Target, Task, TaskStatus, URLDiary};
use crate::sandbox::{
    AuxiliaryRunner, BlockSummary, EventConnector, GuestError, GuestFactory, GuestManager,
    GuestOptions, JsonReporter, MachineResult, Machinery, RealtimeError, RealtimeProcessor,
    ResultCollector, ResultProcessor, StaticRouting,
};
use crate::storage::{DiaryStore, FetchQuery, MemoryStore, StoreError, StoreResult, TaskStore};

/// Machinery with lock state in a [`MemoryStore`] that records the
/// machine operations it was asked to do
pub struct FakeMachinery {
    store: Arc<MemoryStore>,
    calls: Mutex<Vec<String>>,
    fail_start: AtomicBool,
}

impl FakeMachinery {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            calls: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Machinery for FakeMachinery {
    async fn initialize(&self) -> MachineResult<()> {
        Ok(())
    }

    async fn machines(&self) -> MachineResult<Vec<Machine>> {
        Ok(self.store.list_machines().await?)
    }

    async fn availables(&self) -> MachineResult<usize> {
        Ok(self.store.get_available_machines().await?.len())
    }

    async fn running(&self) -> Vec<String> {
        Vec::new()
    }

    async fn acquire(
        &self,
        machine_id: Option<&str>,
        platform: Option<&str>,
        tags: &[String],
        task_id: Option<i64>,
    ) -> MachineResult<Option<Machine>> {
        Ok(self.store.lock_machine(machine_id, platform, tags, task_id).await?)
    }

    async fn release(&self, label: &str) -> MachineResult<Machine> {
        Ok(self.store.unlock_machine(label).await?)
    }

    async fn start(&self, label: &str, _task: &Task, revert: bool) -> MachineResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(crate::sandbox::MachineError::Snapshot {
                label: label.to_string(),
                reason: "no snapshot".to_string(),
            });
        }
        if revert {
            self.record(format!("start {} revert", label));
        } else {
            self.record(format!("start {}", label));
        }
        Ok(())
    }

    async fn stop(&self, label: &str) -> MachineResult<()> {
        self.record(format!("stop {}", label));
        Ok(())
    }

    async fn stop_safe(&self, label: &str) -> MachineResult<()> {
        self.record(format!("stop_safe {}", label));
        Ok(())
    }

    async fn dump_memory(&self, label: &str, _path: &Path) -> MachineResult<()> {
        self.record(format!("dump_memory {}", label));
        Ok(())
    }

    async fn enable_remote_control(&self, _label: &str) -> MachineResult<()> {
        Ok(())
    }

    async fn disable_remote_control(&self, _label: &str) -> MachineResult<()> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeGuestBehavior {
    /// Start and run until the analysis timeout
    Complete,
    /// Fail while starting the analysis
    FailStart,
}

pub struct FakeGuest {
    behavior: FakeGuestBehavior,
    timeout: AtomicU64,
}

#[async_trait]
impl GuestManager for FakeGuest {
    async fn start_analysis(&self, options: &GuestOptions, _monitor: &str) -> Result<(), GuestError> {
        match self.behavior {
            FakeGuestBehavior::Complete => {
                self.timeout.store(options.timeout, Ordering::SeqCst);
                Ok(())
            }
            FakeGuestBehavior::FailStart => Err(GuestError::Guest("agent unreachable".to_string())),
        }
    }

    async fn wait_for_completion(&self) -> Result<(), GuestError> {
        tokio::time::sleep(Duration::from_secs(self.timeout.load(Ordering::SeqCst))).await;
        Ok(())
    }
}

pub struct FakeGuestFactory(pub FakeGuestBehavior);

impl GuestFactory for FakeGuestFactory {
    fn create(&self, _task: &Task, _machine: &Machine) -> Arc<dyn GuestManager> {
        Arc::new(FakeGuest {
            behavior: self.0,
            timeout: AtomicU64::new(0),
        })
    }
}

/// Collector whose guest answers every command that asks for a response
#[derive(Default)]
pub struct FakeCollector {
    commands: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ResultCollector for FakeCollector {
    async fn add_task(&self, _task: &Task, _machine: &Machine, channel: Option<Arc<CommandChannel>>) {
        let Some(channel) = channel else {
            return;
        };
        let (sink, mut outgoing) = mpsc::unbounded_channel::<String>();
        channel.attach(sink);

        let commands = self.commands.clone();
        tokio::spawn(async move {
            while let Some(line) = outgoing.recv().await {
                let command: Value = serde_json::from_str(line.trim()).unwrap();
                commands
                    .lock()
                    .unwrap()
                    .push(command["method"].as_str().unwrap_or_default().to_string());
                if command["respond"] == json!(true) {
                    channel.on_message(json!({
                        "rid": command["command_id"],
                        "success": true,
                        "return_data": null,
                    }));
                }
            }
        });
    }

    async fn del_task(&self, _task: &Task, _machine: &Machine) {}
}

/// In-process event bus recording everything sent through it
#[derive(Default)]
pub struct FakeHub {
    sent: Mutex<Vec<(String, Value)>>,
    callbacks: Mutex<HashMap<u64, (String, EventCallback)>>,
    next_id: AtomicU64,
    batches: AtomicUsize,
    detection: Mutex<Option<(usize, Value)>>,
    unreachable: AtomicBool,
}

impl FakeHub {
    /// Bodies of the events of type `event` sent so far
    pub fn sent(&self, event: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// Publish a `signature` event carrying `body` when batch number
    /// `batch` (1 based) is announced
    pub fn detect_on_batch(&self, batch: usize, body: Value) {
        *self.detection.lock().unwrap() = Some((batch, body));
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn publish(&self, event: &str, body: Value) {
        let message = EventMessage::new(event, body);
        let callbacks: Vec<EventCallback> = self
            .callbacks
            .lock()
            .unwrap()
            .values()
            .filter(|(name, _)| name == event)
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(&message).unwrap();
        }
    }
}

impl EventHub for FakeHub {
    fn send_event(&self, event: &str, body: Value) -> MessageResult<()> {
        let newbatch = event == EVENT_MASSURL_TASK && body["action"] == "newbatch";
        self.sent.lock().unwrap().push((event.to_string(), body));

        if newbatch {
            let batch = self.batches.fetch_add(1, Ordering::SeqCst) + 1;
            let detection = self.detection.lock().unwrap().clone();
            if let Some((at, body)) = detection {
                if at == batch {
                    self.publish(EVENT_SIGNATURE, body);
                }
            }
        }
        Ok(())
    }

    fn subscribe(&self, event: &str, callback: EventCallback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks
            .lock()
            .unwrap()
            .insert(id, (event.to_string(), callback));
        SubscriptionId(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.callbacks.lock().unwrap().remove(&id.0);
    }
}

pub struct FakeConnector(pub Arc<FakeHub>);

#[async_trait]
impl EventConnector for FakeConnector {
    async fn connect(&self) -> Option<Arc<dyn EventHub>> {
        if self.0.unreachable.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.0.clone())
    }
}

#[derive(Default)]
pub struct MemoryDiaries {
    diaries: Mutex<Vec<URLDiary>>,
}

impl MemoryDiaries {
    pub fn stored(&self) -> Vec<URLDiary> {
        self.diaries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DiaryStore for MemoryDiaries {
    async fn store_diary(&self, diary: &URLDiary) -> anyhow::Result<Uuid> {
        self.diaries.lock().unwrap().push(diary.clone());
        Ok(diary.id)
    }
}

/// Report writer counting how often it ran
pub struct CountingProcessor {
    inner: JsonReporter,
    runs: AtomicUsize,
}

impl CountingProcessor {
    pub fn new(inner: JsonReporter) -> Self {
        Self {
            inner,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultProcessor for CountingProcessor {
    async fn process(&self, task: &Task) -> anyhow::Result<bool> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inner.process(task).await
    }
}

/// Realtime processor answering blocks with queued results, then with
/// empty summaries
#[derive(Default)]
pub struct FakeRealtime {
    results: Mutex<VecDeque<Result<BlockSummary, RealtimeError>>>,
    blocks: Mutex<Vec<Vec<String>>>,
}

impl FakeRealtime {
    pub fn push(&self, result: Result<BlockSummary, RealtimeError>) {
        self.results.lock().unwrap().push_back(result);
    }

    /// URLs of every block summarized so far
    pub fn blocks(&self) -> Vec<Vec<String>> {
        self.blocks.lock().unwrap().clone()
    }
}

#[async_trait]
impl RealtimeProcessor for FakeRealtime {
    async fn summarize(
        &self,
        _task: &Task,
        urls: &[String],
        _maxwait: Duration,
    ) -> Result<BlockSummary, RealtimeError> {
        self.blocks.lock().unwrap().push(urls.to_vec());
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(BlockSummary::default()))
    }
}

/// [`MemoryStore`] that refuses to move tasks into one status
pub struct RefusingStore {
    inner: Arc<MemoryStore>,
    refused: TaskStatus,
}

impl RefusingStore {
    pub fn new(inner: Arc<MemoryStore>, refused: TaskStatus) -> Self {
        Self { inner, refused }
    }
}

#[async_trait]
impl TaskStore for RefusingStore {
    async fn fetch(&self, query: FetchQuery) -> StoreResult<Option<Task>> {
        self.inner.fetch(query).await
    }

    async fn view_task(&self, task_id: i64) -> StoreResult<Option<Task>> {
        self.inner.view_task(task_id).await
    }

    async fn get_available_machines(&self) -> StoreResult<Vec<Machine>> {
        self.inner.get_available_machines().await
    }

    async fn list_machines(&self) -> StoreResult<Vec<Machine>> {
        self.inner.list_machines().await
    }

    async fn lock_machine(
        &self,
        name: Option<&str>,
        platform: Option<&str>,
        tags: &[String],
        task_id: Option<i64>,
    ) -> StoreResult<Option<Machine>> {
        self.inner.lock_machine(name, platform, tags, task_id).await
    }

    async fn unlock_machine(&self, label: &str) -> StoreResult<Machine> {
        self.inner.unlock_machine(label).await
    }

    async fn machine_reserve(&self, label: &str, task_id: i64) -> StoreResult<()> {
        self.inner.machine_reserve(label, task_id).await
    }

    async fn clear_reservation(&self, label: &str) -> StoreResult<()> {
        self.inner.clear_reservation(label).await
    }

    async fn set_status(&self, task_id: i64, status: TaskStatus) -> StoreResult<()> {
        if status == self.refused {
            return Err(StoreError::Internal("database is locked".to_string()));
        }
        self.inner.set_status(task_id, status).await
    }

    async fn set_machine(&self, task_id: i64, machine: &str) -> StoreResult<()> {
        self.inner.set_machine(task_id, machine).await
    }

    async fn set_route(&self, task_id: i64, route: &str) -> StoreResult<()> {
        self.inner.set_route(task_id, route).await
    }

    async fn add_error(&self, task_id: i64, message: &str) -> StoreResult<()> {
        self.inner.add_error(task_id, message).await
    }

    async fn count_tasks(&self, status: Option<TaskStatus>) -> StoreResult<usize> {
        self.inner.count_tasks(status).await
    }

    async fn update_targets(&self, targets: &[Target]) -> StoreResult<()> {
        self.inner.update_targets(targets).await
    }

    async fn view_longterm(&self, longterm_id: i64) -> StoreResult<Option<Longterm>> {
        self.inner.view_longterm(longterm_id).await
    }

    async fn set_longterm_machine(&self, label: &str, longterm_id: i64) -> StoreResult<()> {
        self.inner.set_longterm_machine(label, longterm_id).await
    }

    async fn set_latest_longterm(&self, task_id: i64, longterm_id: i64) -> StoreResult<()> {
        self.inner.set_latest_longterm(task_id, longterm_id).await
    }

    async fn list_longterm_pending(&self, longterm_id: i64) -> StoreResult<Vec<Task>> {
        self.inner.list_longterm_pending(longterm_id).await
    }
}

/// Store, machinery and collaborators wired up around one `win7` machine
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub machinery: Arc<FakeMachinery>,
    pub hub: Arc<FakeHub>,
    pub diaries: Arc<MemoryDiaries>,
    pub collector: Arc<FakeCollector>,
    pub processor: Arc<CountingProcessor>,
    pub realtime: Arc<FakeRealtime>,
    pub ctx: Arc<AnalysisContext>,
    _root: TempDir,
}

impl Harness {
    pub async fn new(behavior: FakeGuestBehavior) -> Self {
        Self::with_config(behavior, |_| {}).await
    }

    pub async fn with_config(behavior: FakeGuestBehavior, configure: impl FnOnce(&mut Config)) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.analysis.storage_path = root.path().to_path_buf();
        config.scheduler.freespace_mb = 0;
        configure(&mut config);

        let store = Arc::new(MemoryStore::new());
        store.add_machine(Machine::new("win7", "windows")).await;

        let machinery = Arc::new(FakeMachinery::new(store.clone()));
        let hub = Arc::new(FakeHub::default());
        let diaries = Arc::new(MemoryDiaries::default());
        let collector = Arc::new(FakeCollector::default());
        let processor = Arc::new(CountingProcessor::new(JsonReporter::new(config.analysis.analyses_path())));
        let realtime = Arc::new(FakeRealtime::default());

        let ctx = Arc::new(AnalysisContext {
            machinery: machinery.clone(),
            guests: Arc::new(FakeGuestFactory(behavior)),
            routing: Arc::new(StaticRouting::new(
                &config.analysis.default_route,
                config.analysis.routes.clone(),
            )),
            collector: collector.clone(),
            auxiliary: AuxiliaryRunner::default(),
            processor: processor.clone(),
            realtime: realtime.clone(),
            diaries: diaries.clone(),
            events: Arc::new(FakeConnector(hub.clone())),
            config,
        });

        Self {
            store,
            machinery,
            hub,
            diaries,
            collector,
            processor,
            realtime,
            ctx,
            _root: root,
        }
    }

    /// Lock the machine named `name` the way the scheduler would
    pub async fn lock(&self, name: &str) -> Machine {
        self.machinery
            .acquire(Some(name), None, &[], None)
            .await
            .unwrap()
            .unwrap()
    }

    pub fn core(&self, task: Task, machine: Machine) -> ManagerCore {
        ManagerCore::new(task, machine, self.machinery.clone(), None)
    }

    /// Methods of the commands the guest received
    pub fn guest_commands(&self) -> Vec<String> {
        self.collector.commands.lock().unwrap().clone()
    }

    /// Run `manager` to completion, servicing its action requests like the
    /// scheduler does, then finalize it
    pub async fn drive(&self, manager: &dyn AnalysisManager) {
        let run = manager.run();
        tokio::pin!(run);
        loop {
            tokio::select! {
                _ = &mut run => break,
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    if let Some(status) = manager.core().requested_action() {
                        let _ = manager.on_status(status, self.store.as_ref()).await;
                        manager.core().release_action();
                    }
                }
            }
        }
        manager.finalize(self.store.as_ref()).await;
    }
}
