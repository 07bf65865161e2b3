use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::event_types::{BusMessage, EventMessage};
use super::transport::{encode_frame, FrameReader, FrameWriter};
use super::{EventHub, MessageError, MessageResult, SubscriptionId};

/// Callback invoked for every received event of a subscribed type.
/// Errors are logged by the client and never reach the sender.
pub type EventCallback = Arc<dyn Fn(&EventMessage) -> anyhow::Result<()> + Send + Sync>;

/// Event client configuration
#[derive(Debug, Clone)]
pub struct EventClientConfig {
    pub host: String,
    pub port: u16,
    /// Connection attempts before giving up on a (re)connect
    pub max_tries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for EventClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 42037,
            max_tries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl EventClientConfig {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

enum ClientCommand {
    Send(String),
    Subscribe(String),
    Unsubscribe(String),
    Stop,
}

#[derive(Default)]
struct CallbackRegistry {
    next_id: u64,
    by_event: HashMap<String, Vec<(SubscriptionId, EventCallback)>>,
    events_by_id: HashMap<SubscriptionId, String>,
}

impl CallbackRegistry {
    /// Returns the id and whether this is the first callback for `event`
    fn add(&mut self, event: &str, callback: EventCallback) -> (SubscriptionId, bool) {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let callbacks = self.by_event.entry(event.to_string()).or_default();
        let first = callbacks.is_empty();
        callbacks.push((id, callback));
        self.events_by_id.insert(id, event.to_string());
        (id, first)
    }

    /// Returns the event type when its last callback was removed
    fn remove(&mut self, id: SubscriptionId) -> Option<String> {
        let event = self.events_by_id.remove(&id)?;
        let callbacks = self.by_event.get_mut(&event)?;
        callbacks.retain(|(cb_id, _)| *cb_id != id);
        if callbacks.is_empty() {
            self.by_event.remove(&event);
            return Some(event);
        }
        None
    }

    fn callbacks(&self, event: &str) -> Vec<EventCallback> {
        self.by_event
            .get(event)
            .map(|callbacks| callbacks.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }

    fn events(&self) -> Vec<String> {
        self.by_event.keys().cloned().collect()
    }
}

/// Event bus client with its own reconnect loop.
///
/// Outgoing traffic is queued from construction on, so events sent before
/// [`EventClient::start`] or during a reconnect are delivered once a
/// connection is up.
pub struct EventClient {
    config: EventClientConfig,
    commands: mpsc::UnboundedSender<ClientCommand>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<ClientCommand>>>,
    registry: Arc<Mutex<CallbackRegistry>>,
    connected: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EventClient {
    pub fn new(config: EventClientConfig) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        Self {
            config,
            commands,
            inbox: Mutex::new(Some(inbox)),
            registry: Arc::new(Mutex::new(CallbackRegistry::default())),
            connected: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Connect with up to `max_tries` attempts and start the client loop.
    /// Returns whether the initial connection succeeded.
    pub async fn start(&self, max_tries: u32) -> bool {
        let Some(stream) = connect(&self.config, max_tries).await else {
            error!(addr = %self.config.addr(), "Could not connect to event server");
            return false;
        };

        let Some(inbox) = lock(&self.inbox).take() else {
            warn!("Event client already started");
            return self.is_connected();
        };

        self.connected.store(true, Ordering::SeqCst);
        info!(addr = %self.config.addr(), "Connected to event server");

        let handle = tokio::spawn(run_loop(
            self.config.clone(),
            inbox,
            self.registry.clone(),
            self.connected.clone(),
            stream,
        ));
        *lock(&self.handle) = Some(handle);
        true
    }

    /// Stop the client loop and wait for it to exit
    pub async fn stop(&self) {
        let _ = self.commands.send(ClientCommand::Stop);
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Event client loop ended abnormally");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl EventHub for EventClient {
    fn send_event(&self, event: &str, body: Value) -> MessageResult<()> {
        let line = encode_frame(&BusMessage::event(event, body))?;
        self.commands
            .send(ClientCommand::Send(line))
            .map_err(|_| MessageError::NotConnected)
    }

    fn subscribe(&self, event: &str, callback: EventCallback) -> SubscriptionId {
        let (id, first) = lock(&self.registry).add(event, callback);
        if first {
            let _ = self.commands.send(ClientCommand::Subscribe(event.to_string()));
        }
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let emptied = lock(&self.registry).remove(id);
        if let Some(event) = emptied {
            let _ = self.commands.send(ClientCommand::Unsubscribe(event));
        }
    }
}

async fn connect(config: &EventClientConfig, max_tries: u32) -> Option<TcpStream> {
    let addr = config.addr();
    let attempts = max_tries.max(1);
    let mut backoff = config.initial_backoff;

    for attempt in 1..=attempts {
        match TcpStream::connect(&addr).await {
            Ok(stream) => return Some(stream),
            Err(e) => {
                warn!(addr = %addr, attempt, error = %e, "Event server connection attempt failed");
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(config.max_backoff);
                }
            }
        }
    }
    None
}

enum SessionEnd {
    Stopped,
    Lost,
}

async fn run_loop(
    config: EventClientConfig,
    mut inbox: mpsc::UnboundedReceiver<ClientCommand>,
    registry: Arc<Mutex<CallbackRegistry>>,
    connected: Arc<AtomicBool>,
    stream: TcpStream,
) {
    let mut backlog: VecDeque<String> = VecDeque::new();
    let mut stream = Some(stream);

    loop {
        let current = match stream.take() {
            Some(current) => current,
            None => match connect(&config, config.max_tries).await {
                Some(current) => {
                    info!(addr = %config.addr(), "Reconnected to event server");
                    current
                }
                None => {
                    error!(
                        addr = %config.addr(),
                        queued = backlog.len(),
                        "Giving up on event server"
                    );
                    connected.store(false, Ordering::SeqCst);
                    return;
                }
            },
        };
        connected.store(true, Ordering::SeqCst);

        match session(current, &mut inbox, &registry, &mut backlog).await {
            SessionEnd::Stopped => {
                connected.store(false, Ordering::SeqCst);
                debug!("Event client stopped");
                return;
            }
            SessionEnd::Lost => {
                connected.store(false, Ordering::SeqCst);
                warn!(queued = backlog.len(), "Lost event server connection");
            }
        }
    }
}

async fn session(
    stream: TcpStream,
    inbox: &mut mpsc::UnboundedReceiver<ClientCommand>,
    registry: &Mutex<CallbackRegistry>,
    backlog: &mut VecDeque<String>,
) -> SessionEnd {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    let events = lock(registry).events();
    if !events.is_empty() {
        if let Err(e) = writer.write_frame(&BusMessage::subscribe(events)).await {
            debug!(error = %e, "Re-subscribe failed");
            return SessionEnd::Lost;
        }
    }
    if flush(&mut writer, backlog).await.is_err() {
        return SessionEnd::Lost;
    }

    loop {
        tokio::select! {
            command = inbox.recv() => {
                let result = match command {
                    None | Some(ClientCommand::Stop) => return SessionEnd::Stopped,
                    Some(ClientCommand::Send(line)) => {
                        backlog.push_back(line);
                        flush(&mut writer, backlog).await
                    }
                    Some(ClientCommand::Subscribe(event)) => {
                        writer.write_frame(&BusMessage::subscribe(vec![event])).await
                    }
                    Some(ClientCommand::Unsubscribe(event)) => {
                        writer.write_frame(&BusMessage::unsubscribe(vec![event])).await
                    }
                };
                if let Err(e) = result {
                    debug!(error = %e, "Write to event server failed");
                    return SessionEnd::Lost;
                }
            }
            frame = reader.read_frame() => {
                match frame {
                    Ok(Some(frame)) => dispatch(registry, frame),
                    Ok(None) => return SessionEnd::Lost,
                    Err(MessageError::Serialization(e)) => {
                        warn!(error = %e, "Malformed frame from event server");
                    }
                    Err(e) => {
                        debug!(error = %e, "Read from event server failed");
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }
}

/// Write queued lines in order; a line stays queued until written
async fn flush<W>(writer: &mut FrameWriter<W>, backlog: &mut VecDeque<String>) -> MessageResult<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(line) = backlog.front() {
        writer.write_line(line).await?;
        backlog.pop_front();
    }
    Ok(())
}

fn dispatch(registry: &Mutex<CallbackRegistry>, frame: Value) {
    let message = match serde_json::from_value::<BusMessage>(frame) {
        Ok(BusMessage::Event { body }) => body,
        Ok(BusMessage::Protocol { .. }) => return,
        Err(e) => {
            warn!(error = %e, "Dropping unrecognized bus message");
            return;
        }
    };

    let callbacks = lock(registry).callbacks(&message.event);
    for callback in callbacks {
        if let Err(e) = callback(&message) {
            error!(event = %message.event, error = %e, "Event callback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::server::{EventServer, EventServerConfig};
    use serde_json::json;
    use tokio::sync::watch;
    use tokio::time::timeout;

    async fn spawn_server() -> (u16, watch::Sender<bool>) {
        let server = EventServer::bind(EventServerConfig {
            port: 0,
            ..Default::default()
        })
        .await
        .unwrap();
        let port = server.local_addr().unwrap().port();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(server.run(shutdown_rx));
        (port, shutdown_tx)
    }

    fn client_for(port: u16) -> EventClient {
        EventClient::new(EventClientConfig {
            port,
            initial_backoff: Duration::from_millis(10),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_event_is_relayed_to_subscriber_unchanged() {
        let (port, shutdown) = spawn_server().await;
        let sender = client_for(port);
        let receiver = client_for(port);
        assert!(sender.start(3).await);
        assert!(receiver.start(3).await);

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        receiver.subscribe(
            "signature",
            Arc::new(move |msg: &EventMessage| {
                seen_tx.send(msg.body.clone())?;
                Ok(())
            }),
        );

        let body = json!({"taskid": 9, "signature": "js_eval", "nested": [1, 2]});
        let received = timeout(Duration::from_secs(5), async {
            loop {
                sender.send_event("signature", body.clone()).unwrap();
                if let Ok(Some(got)) = timeout(Duration::from_millis(100), seen_rx.recv()).await {
                    return got;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(received, body);

        sender.stop().await;
        receiver.stop().await;
        let _ = shutdown.send(true);
    }

    #[tokio::test]
    async fn test_failing_callback_does_not_block_others() {
        let registry = Mutex::new(CallbackRegistry::default());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        lock(&registry).add("tick", Arc::new(|_: &EventMessage| -> anyhow::Result<()> { anyhow::bail!("boom") }));
        lock(&registry).add(
            "tick",
            Arc::new(move |msg: &EventMessage| {
                seen_tx.send(msg.body.clone())?;
                Ok(())
            }),
        );

        dispatch(
            &registry,
            serde_json::to_value(BusMessage::event("tick", json!(1))).unwrap(),
        );

        assert_eq!(seen_rx.try_recv().unwrap(), json!(1));
    }

    #[test]
    fn test_last_unsubscribe_reports_event() {
        let mut registry = CallbackRegistry::default();
        let noop: EventCallback = Arc::new(|_: &EventMessage| Ok(()));
        let (a, first_a) = registry.add("signature", noop.clone());
        let (b, first_b) = registry.add("signature", noop);

        assert!(first_a);
        assert!(!first_b);
        assert_eq!(registry.remove(a), None);
        assert_eq!(registry.remove(b), Some("signature".to_string()));
        assert!(registry.events().is_empty());
    }

    #[tokio::test]
    async fn test_start_fails_without_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = client_for(port);
        assert!(!client.start(2).await);
        assert!(!client.is_connected());
    }
}
