//! Correlated command/response channel to the analyzer inside a guest.
//!
//! Commands are tagged with a per-connection monotonic `command_id`; the
//! guest answers with a message carrying the same id as `rid`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::event_types::{Command, CommandResponse, InboundMessage};
use super::transport::{encode_frame, FrameReader, FrameWriter};
use super::MessageError;

/// Invoked once with the response to a command sent with a callback
pub type ResponseCallback = Box<dyn FnOnce(CommandResponse) + Send>;

/// Invoked for every non-response message of a subscribed type
pub type MessageCallback = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// How long a response callback stays registered without an answer
pub const CALLBACK_MAXWAIT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Guest failed to execute command {id}: {data}")]
    CommandFailed { id: u64, data: Value },

    #[error("No response to command {id} within {maxwait:?}")]
    BlockingExpired { id: u64, maxwait: Duration },

    #[error("Command channel not connected")]
    NotConnected,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<MessageError> for CommandError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::Serialization(e) => CommandError::Serialization(e),
            _ => CommandError::NotConnected,
        }
    }
}

enum PendingResponse {
    Callback {
        callback: ResponseCallback,
        expires: Instant,
    },
    Waiter(oneshot::Sender<CommandResponse>),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Command channel bound to at most one guest connection at a time
#[derive(Default)]
pub struct CommandChannel {
    next_id: AtomicU64,
    generation: AtomicU64,
    /// Current connection and the generation it was attached as
    sink: Mutex<Option<(u64, mpsc::UnboundedSender<String>)>>,
    pending: Mutex<HashMap<u64, PendingResponse>>,
    handlers: Mutex<HashMap<String, Vec<MessageCallback>>>,
}

impl CommandChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route outgoing lines into `sink`, replacing any previous connection.
    ///
    /// Returns the generation of this attachment for [`CommandChannel::detach_if`].
    pub fn attach(&self, sink: mpsc::UnboundedSender<String>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.sink) = Some((generation, sink));
        generation
    }

    /// Drop the connection; outstanding blocking waits fail with `NotConnected`
    pub fn detach(&self) {
        lock(&self.sink).take();
        lock(&self.pending).clear();
    }

    /// Detach only if `generation` is still the attached connection.
    ///
    /// A closing connection that was already replaced leaves the newer one
    /// and its outstanding commands alone.
    pub fn detach_if(&self, generation: u64) -> bool {
        let mut sink = lock(&self.sink);
        if !matches!(sink.as_ref(), Some((current, _)) if *current == generation) {
            return false;
        }
        sink.take();
        drop(sink);
        lock(&self.pending).clear();
        true
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.sink)
            .as_ref()
            .is_some_and(|(_, sink)| !sink.is_closed())
    }

    /// Serve a guest connection until it closes
    pub fn serve<S>(self: &Arc<Self>, stream: S) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (sink, mut outgoing) = mpsc::unbounded_channel::<String>();
        let generation = self.attach(sink);

        tokio::spawn(async move {
            let mut writer = FrameWriter::new(write_half);
            while let Some(line) = outgoing.recv().await {
                if let Err(e) = writer.write_line(&line).await {
                    warn!(error = %e, "Write to guest failed");
                    break;
                }
            }
        });

        let channel = self.clone();
        tokio::spawn(async move {
            let mut reader = FrameReader::new(read_half);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => channel.on_message(frame),
                    Ok(None) => break,
                    Err(MessageError::Serialization(e)) => {
                        warn!(error = %e, "Malformed message from guest");
                    }
                    Err(e) => {
                        debug!(error = %e, "Guest connection read failed");
                        break;
                    }
                }
            }
            if !channel.detach_if(generation) {
                debug!(generation, "Replaced guest connection closed");
            }
        })
    }

    /// Handle one message received from the guest
    pub fn on_message(&self, raw: Value) {
        match InboundMessage::classify(raw) {
            InboundMessage::Response(response) => {
                let slot = lock(&self.pending).remove(&response.rid);
                match slot {
                    Some(PendingResponse::Callback { callback, .. }) => callback(response),
                    Some(PendingResponse::Waiter(waiter)) => {
                        let _ = waiter.send(response);
                    }
                    None => debug!(rid = response.rid, "Response for unknown or expired command"),
                }
            }
            InboundMessage::Message { msg_type: Some(msg_type), raw } => {
                let handlers = lock(&self.handlers)
                    .get(&msg_type)
                    .cloned()
                    .unwrap_or_default();
                if handlers.is_empty() {
                    debug!(msg_type = %msg_type, "No handler for guest message");
                }
                for handler in handlers {
                    if let Err(e) = handler(&raw) {
                        error!(msg_type = %msg_type, error = %e, "Guest message handler failed");
                    }
                }
            }
            InboundMessage::Message { msg_type: None, .. } => {
                warn!("Guest message without type ignored");
            }
        }
    }

    pub fn subscribe_callback(&self, msg_type: &str, callback: MessageCallback) {
        lock(&self.handlers)
            .entry(msg_type.to_string())
            .or_default()
            .push(callback);
    }

    /// Send a command; `callback` receives the response if one arrives
    pub fn send_command(
        &self,
        mut command: Command,
        callback: Option<ResponseCallback>,
    ) -> Result<u64, CommandError> {
        let id = self.allocate_id();
        command.command_id = Some(id);
        self.expire_callbacks();
        if let Some(callback) = callback {
            command.respond = true;
            let expires = Instant::now() + CALLBACK_MAXWAIT;
            lock(&self.pending).insert(id, PendingResponse::Callback { callback, expires });
        }

        if let Err(e) = self.write(&command) {
            lock(&self.pending).remove(&id);
            return Err(e);
        }
        debug!(command_id = id, method = %command.method, "Sent guest command");
        Ok(id)
    }

    /// Send a command and wait up to `maxwait` for its response data
    pub async fn send_command_blocking(
        &self,
        mut command: Command,
        maxwait: Duration,
    ) -> Result<Value, CommandError> {
        let id = self.allocate_id();
        command.command_id = Some(id);
        command.respond = true;

        let (waiter, response) = oneshot::channel();
        lock(&self.pending).insert(id, PendingResponse::Waiter(waiter));

        if let Err(e) = self.write(&command) {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(maxwait, response).await {
            Ok(Ok(response)) if response.success => Ok(response.return_data),
            Ok(Ok(response)) => Err(CommandError::CommandFailed {
                id,
                data: response.return_data,
            }),
            Ok(Err(_)) => Err(CommandError::NotConnected),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(CommandError::BlockingExpired { id, maxwait })
            }
        }
    }

    /// Forget callbacks whose guest never answered
    fn expire_callbacks(&self) {
        let now = Instant::now();
        let mut pending = lock(&self.pending);
        let before = pending.len();
        pending.retain(|_, slot| match slot {
            PendingResponse::Callback { expires, .. } => *expires > now,
            PendingResponse::Waiter(waiter) => !waiter.is_closed(),
        });
        let expired = before - pending.len();
        if expired > 0 {
            debug!(expired, "Dropped unanswered command slots");
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn write(&self, command: &Command) -> Result<(), CommandError> {
        let line = encode_frame(command)?;
        let sink = lock(&self.sink);
        let (_, sink) = sink.as_ref().ok_or(CommandError::NotConnected)?;
        sink.send(line).map_err(|_| CommandError::NotConnected)
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

fn args(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl Command {
    pub fn analyzer(method: &str, args: Map<String, Value>, respond: bool) -> Self {
        Self {
            category: "analyzer".to_string(),
            method: method.to_string(),
            args,
            respond,
            command_id: None,
        }
    }

    /// Open targets in the guest with an analysis package
    pub fn start_package(
        category: &str,
        targets: &[String],
        package: Option<&str>,
        options: &HashMap<String, String>,
    ) -> Self {
        Self::analyzer(
            "start_package",
            args(json!({
                "config": {
                    "category": category,
                    "target": targets,
                    "package": package,
                    "file_name": null,
                    "file_type": null,
                    "pkg_id": null,
                    "options": options,
                }
            })),
            true,
        )
    }

    pub fn stop_package(pkg_id: &str) -> Self {
        Self::analyzer("stop_package", args(json!({ "pkg_id": pkg_id })), true)
    }

    pub fn stop_all_packages() -> Self {
        Self::analyzer("stop_all_packages", Map::new(), false)
    }

    pub fn list_packages() -> Self {
        Self::analyzer("list_packages", Map::new(), true)
    }

    /// Ask the analyzer to finish so logs are closed cleanly
    pub fn stop_analyzer() -> Self {
        Self::analyzer("stop", Map::new(), true)
    }

    pub fn dump_memory(pid: u32) -> Self {
        Self::analyzer("dump_memory", args(json!({ "pid": pid })), true)
    }

    pub fn list_tracked_pids() -> Self {
        Self::analyzer("list_tracked_pids", Map::new(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    /// Attach a responder that answers every command via `reply`
    fn responder<F>(channel: &Arc<CommandChannel>, reply: F)
    where
        F: Fn(&Value) -> Option<Value> + Send + 'static,
    {
        let (sink, mut outgoing) = mpsc::unbounded_channel::<String>();
        channel.attach(sink);
        let channel = channel.clone();
        tokio::spawn(async move {
            while let Some(line) = outgoing.recv().await {
                let command: Value = serde_json::from_str(line.trim()).unwrap();
                if let Some(response) = reply(&command) {
                    channel.on_message(response);
                }
            }
        });
    }

    #[tokio::test]
    async fn test_blocking_command_returns_data() {
        let channel = Arc::new(CommandChannel::new());
        responder(&channel, |cmd| {
            Some(json!({"rid": cmd["command_id"], "success": true, "return_data": {"1": "ie"}}))
        });

        let data = channel
            .send_command_blocking(Command::list_packages(), Duration::from_secs(1))
            .await;

        assert_eq!(assert_ok!(data), json!({"1": "ie"}));
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_blocking_command_failure_response() {
        let channel = Arc::new(CommandChannel::new());
        responder(&channel, |cmd| {
            Some(json!({"rid": cmd["command_id"], "success": false}))
        });

        let result = channel
            .send_command_blocking(Command::stop_analyzer(), Duration::from_secs(1))
            .await;

        assert!(matches!(result, Err(CommandError::CommandFailed { .. })));
    }

    #[tokio::test]
    async fn test_blocking_command_expires_and_clears_slot() {
        let channel = Arc::new(CommandChannel::new());
        responder(&channel, |_| None);

        let result = channel
            .send_command_blocking(Command::stop_analyzer(), Duration::from_millis(50))
            .await;

        assert!(matches!(result, Err(CommandError::BlockingExpired { .. })));
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_command_ids_are_monotonic() {
        let channel = CommandChannel::new();
        let (sink, mut outgoing) = mpsc::unbounded_channel();
        channel.attach(sink);

        let first = assert_ok!(channel.send_command(Command::stop_all_packages(), None));
        let second = assert_ok!(channel.send_command(Command::list_tracked_pids(), None));
        assert!(second > first);

        let line = outgoing.recv().await.unwrap();
        let sent: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(sent["command_id"], first);
        assert_eq!(sent["respond"], false);
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let channel = CommandChannel::new();
        assert_err!(channel.send_command(Command::list_packages(), None));
        assert!(!channel.is_attached());
    }

    #[tokio::test]
    async fn test_typed_messages_dispatch_to_callbacks() {
        let channel = CommandChannel::new();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        channel.subscribe_callback(
            "screenshot",
            Arc::new(move |raw: &Value| {
                seen_tx.send(raw["index"].clone())?;
                Ok(())
            }),
        );

        channel.on_message(json!({"type": "screenshot", "index": 3}));
        channel.on_message(json!({"type": "other"}));

        assert_eq!(seen_rx.try_recv().unwrap(), json!(3));
        assert!(seen_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closing_replaced_connection_keeps_new_one() {
        let channel = Arc::new(CommandChannel::new());
        let (old_local, old_peer) = tokio::io::duplex(1024);
        let (new_local, mut new_peer) = tokio::io::duplex(1024);

        let old_reader = channel.serve(old_local);
        let _new_reader = channel.serve(new_local);

        drop(old_peer);
        old_reader.await.unwrap();
        assert!(channel.is_attached());

        // The new connection still carries commands and their responses
        let guest = tokio::spawn(async move {
            use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
            let (read, mut write) = tokio::io::split(&mut new_peer);
            let mut lines = BufReader::new(read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let command: Value = serde_json::from_str(&line).unwrap();
            let reply = json!({"rid": command["command_id"], "success": true, "return_data": [7]});
            write.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
            write.flush().await.unwrap();
            // Keep the connection open until the answer has been read
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let data = channel
            .send_command_blocking(Command::list_tracked_pids(), Duration::from_secs(1))
            .await;
        assert_eq!(assert_ok!(data), json!([7]));
        guest.await.unwrap();
    }

    #[test]
    fn test_detach_if_ignores_stale_generation() {
        let channel = CommandChannel::new();
        let (first, _first_rx) = mpsc::unbounded_channel();
        let (second, _second_rx) = mpsc::unbounded_channel();
        let old = channel.attach(first);
        let current = channel.attach(second);

        assert!(!channel.detach_if(old));
        assert!(channel.is_attached());
        assert!(channel.detach_if(current));
        assert!(!channel.is_attached());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_callbacks_expire() {
        let channel = CommandChannel::new();
        let (sink, _outgoing) = mpsc::unbounded_channel();
        channel.attach(sink);

        assert_ok!(channel.send_command(Command::list_packages(), Some(Box::new(|_| {}))));
        assert_eq!(channel.pending_count(), 1);

        tokio::time::advance(CALLBACK_MAXWAIT + Duration::from_secs(1)).await;
        assert_ok!(channel.send_command(Command::list_packages(), Some(Box::new(|_| {}))));
        assert_eq!(channel.pending_count(), 1);
    }

    #[test]
    fn test_start_package_carries_targets() {
        let cmd = Command::start_package(
            "url",
            &["http://a.example".to_string(), "http://b.example".to_string()],
            Some("ie"),
            &HashMap::new(),
        );
        assert_eq!(cmd.method, "start_package");
        assert_eq!(cmd.args["config"]["target"][1], "http://b.example");
        assert!(cmd.respond);
    }
}
