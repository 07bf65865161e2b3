use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::event_types::{BusMessage, ProtocolAction};
use super::transport::{encode_frame, FrameReader, FrameWriter};
use super::{MessageError, MessageResult};

type ConnId = u64;

/// Frames kept for a connection that is not write-ready
pub const DEFAULT_BACKLOG_LIMIT: usize = 1024;

/// Event server configuration
#[derive(Debug, Clone)]
pub struct EventServerConfig {
    pub host: String,
    pub port: u16,
    /// Frames handed to a connection's writer before it counts as not
    /// write-ready
    pub outbox_capacity: usize,
    /// How often backlogged connections are retried
    pub relay_interval: Duration,
    /// Queued frames per connection before the oldest are dropped
    pub backlog_limit: usize,
}

impl Default for EventServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 42037,
            outbox_capacity: 64,
            relay_interval: Duration::from_millis(100),
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
        }
    }
}

/// Reverse index from event type to subscribed connections
#[derive(Debug, Default)]
pub(crate) struct SubscriptionTable {
    by_event: HashMap<String, HashSet<ConnId>>,
    by_conn: HashMap<ConnId, HashSet<String>>,
}

impl SubscriptionTable {
    pub(crate) fn subscribe(&mut self, conn: ConnId, event: &str) {
        self.by_event
            .entry(event.to_string())
            .or_default()
            .insert(conn);
        self.by_conn
            .entry(conn)
            .or_default()
            .insert(event.to_string());
    }

    pub(crate) fn unsubscribe(&mut self, conn: ConnId, event: &str) {
        if let Some(subscribers) = self.by_event.get_mut(event) {
            subscribers.remove(&conn);
            if subscribers.is_empty() {
                self.by_event.remove(event);
            }
        }
        if let Some(events) = self.by_conn.get_mut(&conn) {
            events.remove(event);
            if events.is_empty() {
                self.by_conn.remove(&conn);
            }
        }
    }

    /// Drop every subscription held by a connection
    pub(crate) fn remove_connection(&mut self, conn: ConnId) {
        let Some(events) = self.by_conn.remove(&conn) else {
            return;
        };
        for event in events {
            if let Some(subscribers) = self.by_event.get_mut(&event) {
                subscribers.remove(&conn);
                if subscribers.is_empty() {
                    self.by_event.remove(&event);
                }
            }
        }
    }

    pub(crate) fn subscribers(&self, event: &str) -> Vec<ConnId> {
        self.by_event
            .get(event)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn event_count(&self) -> usize {
        self.by_event.len()
    }
}

/// Server-side state of one client connection
struct Connection {
    peer: SocketAddr,
    outbox: mpsc::Sender<String>,
    backlog: VecDeque<String>,
    backlog_limit: usize,
    dropped: u64,
    closed: bool,
}

impl Connection {
    fn enqueue(&mut self, id: ConnId, line: String) {
        if self.backlog.len() >= self.backlog_limit {
            self.backlog.pop_front();
            self.dropped += 1;
            warn!(
                conn = id,
                peer = %self.peer,
                dropped = self.dropped,
                "Backlog full, dropping oldest event"
            );
        }
        self.backlog.push_back(line);
    }

    /// Hand queued frames to the writer until it stops accepting more
    fn flush(&mut self, id: ConnId) {
        while let Some(line) = self.backlog.pop_front() {
            match self.outbox.try_send(line) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(line)) => {
                    debug!(conn = id, pending = self.backlog.len() + 1, "Connection not write-ready");
                    self.backlog.push_front(line);
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.closed = true;
                    self.backlog.clear();
                    return;
                }
            }
        }
    }
}

enum ConnEvent {
    Frame(ConnId, Value),
    Closed(ConnId),
}

/// Loop-owned broker state
struct BusState {
    connections: HashMap<ConnId, Connection>,
    subscriptions: SubscriptionTable,
    next_id: ConnId,
    backlog_limit: usize,
}

impl Default for BusState {
    fn default() -> Self {
        Self::with_backlog_limit(DEFAULT_BACKLOG_LIMIT)
    }
}

impl BusState {
    fn with_backlog_limit(backlog_limit: usize) -> Self {
        Self {
            connections: HashMap::new(),
            subscriptions: SubscriptionTable::default(),
            next_id: 0,
            backlog_limit: backlog_limit.max(1),
        }
    }

    fn add_connection(&mut self, peer: SocketAddr, outbox: mpsc::Sender<String>) -> ConnId {
        self.next_id += 1;
        let id = self.next_id;
        self.connections.insert(
            id,
            Connection {
                peer,
                outbox,
                backlog: VecDeque::new(),
                backlog_limit: self.backlog_limit,
                dropped: 0,
                closed: false,
            },
        );
        id
    }

    fn remove_connection(&mut self, id: ConnId) {
        self.subscriptions.remove_connection(id);
        if let Some(conn) = self.connections.remove(&id) {
            info!(conn = id, peer = %conn.peer, "Event client disconnected");
        }
    }

    fn handle_frame(&mut self, id: ConnId, frame: Value) {
        let message: BusMessage = match serde_json::from_value(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(conn = id, error = %e, "Dropping unrecognized bus message");
                return;
            }
        };

        match message {
            BusMessage::Protocol { action, body } => {
                for event in &body.events {
                    match action {
                        ProtocolAction::Subscribe => self.subscriptions.subscribe(id, event),
                        ProtocolAction::Unsubscribe => self.subscriptions.unsubscribe(id, event),
                    }
                }
                debug!(conn = id, ?action, events = ?body.events, "Subscription change");
            }
            BusMessage::Event { body } => {
                let event = body.event.clone();
                let line = match encode_frame(&BusMessage::Event { body }) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(error = %e, "Failed to encode event");
                        return;
                    }
                };
                self.route(&event, line);
            }
        }
    }

    /// Queue an encoded event for every subscriber and push what fits
    fn route(&mut self, event: &str, line: String) {
        let subscribers = self.subscriptions.subscribers(event);
        debug!(event = %event, subscribers = subscribers.len(), "Relaying event");

        for conn_id in subscribers {
            if let Some(conn) = self.connections.get_mut(&conn_id) {
                conn.enqueue(conn_id, line.clone());
                conn.flush(conn_id);
            }
        }
        self.reap_closed();
    }

    /// Retry connections that were not write-ready on an earlier pass
    fn relay_pending(&mut self) {
        for (id, conn) in self.connections.iter_mut() {
            if !conn.backlog.is_empty() {
                conn.flush(*id);
            }
        }
        self.reap_closed();
    }

    fn reap_closed(&mut self) {
        let closed: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.closed)
            .map(|(id, _)| *id)
            .collect();
        for id in closed {
            self.remove_connection(id);
        }
    }
}

/// Pub/sub broker relaying events between connected clients
pub struct EventServer {
    listener: TcpListener,
    config: EventServerConfig,
}

impl EventServer {
    pub async fn bind(config: EventServerConfig) -> MessageResult<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| MessageError::Connection(format!("bind {}: {}", addr, e)))?;

        info!("Event server listening on {}", listener.local_addr()?);
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> MessageResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the broker until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> MessageResult<()> {
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<ConnEvent>();
        let mut state = BusState::with_backlog_limit(self.config.backlog_limit);
        let mut relay = interval(self.config.relay_interval);
        relay.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let (outbox_tx, outbox_rx) = mpsc::channel(self.config.outbox_capacity);
                            let id = state.add_connection(peer, outbox_tx);
                            info!(conn = id, peer = %peer, "Event client connected");
                            spawn_connection(id, stream, outbox_rx, conn_tx.clone());
                        }
                        Err(e) => warn!(error = %e, "Failed to accept event client"),
                    }
                }
                Some(event) = conn_rx.recv() => {
                    match event {
                        ConnEvent::Frame(id, frame) => state.handle_frame(id, frame),
                        ConnEvent::Closed(id) => state.remove_connection(id),
                    }
                }
                _ = relay.tick() => state.relay_pending(),
            }
        }

        info!(
            connections = state.connections.len(),
            event_types = state.subscriptions.event_count(),
            "Event server stopped"
        );
        Ok(())
    }
}

fn spawn_connection(
    id: ConnId,
    stream: TcpStream,
    mut outbox: mpsc::Receiver<String>,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    let (read_half, write_half) = stream.into_split();

    tokio::spawn(async move {
        let mut writer = FrameWriter::new(write_half);
        while let Some(line) = outbox.recv().await {
            if let Err(e) = writer.write_line(&line).await {
                debug!(conn = id, error = %e, "Write to event client failed");
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut reader = FrameReader::new(read_half);
        loop {
            match reader.read_frame().await {
                Ok(Some(frame)) => {
                    if events.send(ConnEvent::Frame(id, frame)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(MessageError::Serialization(e)) => {
                    warn!(conn = id, error = %e, "Malformed frame from event client");
                }
                Err(e) => {
                    debug!(conn = id, error = %e, "Event client read failed");
                    break;
                }
            }
        }
        let _ = events.send(ConnEvent::Closed(id));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[test]
    fn test_subscription_table_cleanup_on_disconnect() {
        let mut table = SubscriptionTable::default();
        table.subscribe(1, "signature");
        table.subscribe(1, "massurltask");
        table.subscribe(2, "signature");

        table.remove_connection(1);

        assert_eq!(table.subscribers("signature"), vec![2]);
        assert!(table.subscribers("massurltask").is_empty());
        assert_eq!(table.event_count(), 1);
    }

    #[test]
    fn test_unsubscribe_last_subscriber_drops_event() {
        let mut table = SubscriptionTable::default();
        table.subscribe(5, "signature");
        table.unsubscribe(5, "signature");

        assert_eq!(table.event_count(), 0);
    }

    #[tokio::test]
    async fn test_events_reach_only_subscribers() {
        let mut state = BusState::default();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let a = state.add_connection(peer(), tx_a);
        let b = state.add_connection(peer(), tx_b);

        state.handle_frame(
            a,
            serde_json::to_value(BusMessage::subscribe(vec!["signature".into()])).unwrap(),
        );
        state.handle_frame(
            b,
            serde_json::to_value(BusMessage::event("signature", json!({"taskid": 1}))).unwrap(),
        );

        let line = rx_a.try_recv().unwrap();
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["body"]["body"]["taskid"], 1);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_consumer_is_retried_on_next_pass() {
        let mut state = BusState::default();
        let (tx, mut rx) = mpsc::channel(1);
        let id = state.add_connection(peer(), tx);
        state.subscriptions.subscribe(id, "tick");

        for n in 0..3 {
            state.handle_frame(
                id,
                serde_json::to_value(BusMessage::event("tick", json!({ "n": n }))).unwrap(),
            );
        }
        assert_eq!(state.connections[&id].backlog.len(), 2);

        let mut received = vec![rx.try_recv().unwrap()];
        while received.len() < 3 {
            state.relay_pending();
            received.push(rx.try_recv().unwrap());
        }

        let order: Vec<i64> = received
            .iter()
            .map(|line| serde_json::from_str::<Value>(line.trim()).unwrap()["body"]["body"]["n"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_backlog_drops_oldest_when_full() {
        let mut state = BusState::with_backlog_limit(2);
        let (tx, mut rx) = mpsc::channel(1);
        let id = state.add_connection(peer(), tx);
        state.subscriptions.subscribe(id, "tick");

        for n in 0..5 {
            state.handle_frame(
                id,
                serde_json::to_value(BusMessage::event("tick", json!({ "n": n }))).unwrap(),
            );
        }
        assert_eq!(state.connections[&id].backlog.len(), 2);
        assert_eq!(state.connections[&id].dropped, 2);

        let mut received = Vec::new();
        while let Ok(line) = rx.try_recv() {
            received.push(line);
            state.relay_pending();
        }
        let order: Vec<i64> = received
            .iter()
            .map(|line| serde_json::from_str::<Value>(line.trim()).unwrap()["body"]["body"]["n"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 3, 4]);
    }

    #[tokio::test]
    async fn test_closed_outbox_removes_connection() {
        let mut state = BusState::default();
        let (tx, rx) = mpsc::channel(1);
        let id = state.add_connection(peer(), tx);
        state.subscriptions.subscribe(id, "tick");
        drop(rx);

        state.handle_frame(
            id,
            serde_json::to_value(BusMessage::event("tick", json!({}))).unwrap(),
        );

        assert!(state.connections.is_empty());
        assert!(state.subscriptions.subscribers("tick").is_empty());
    }
}
