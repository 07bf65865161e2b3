use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use shared::messaging::CommandChannel;

use crate::models::{Machine, Task};

/// Receives results uploaded by guests while their task runs
#[async_trait]
pub trait ResultCollector: Send + Sync {
    /// Expect results for `task` from `machine`; guest command connections
    /// go to `channel` when one is given
    async fn add_task(&self, task: &Task, machine: &Machine, channel: Option<Arc<CommandChannel>>);

    async fn del_task(&self, task: &Task, machine: &Machine);
}

struct Registration {
    task_id: i64,
    channel: Option<Arc<CommandChannel>>,
}

/// Maps guest IPs to their running task and hands guest connections to
/// the task's command channel
#[derive(Default)]
pub struct ResultRegistry {
    by_ip: RwLock<HashMap<String, Registration>>,
}

impl ResultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn task_for(&self, ip: &str) -> Option<i64> {
        self.by_ip.read().await.get(ip).map(|r| r.task_id)
    }

    /// Route one incoming guest connection
    pub async fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        let ip = peer.ip().to_string();
        let registry = self.by_ip.read().await;
        match registry.get(&ip) {
            Some(Registration {
                task_id,
                channel: Some(channel),
            }) => {
                info!(task_id, peer = %peer, "Guest command connection established");
                channel.serve(stream);
            }
            Some(Registration { task_id, channel: None }) => {
                debug!(task_id, peer = %peer, "Task has no command channel, dropping connection");
            }
            None => warn!(peer = %peer, "Connection from unknown guest rejected"),
        }
    }

    /// Accept guest connections until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer).await,
                    Err(e) => warn!(error = %e, "Failed to accept guest connection"),
                },
            }
        }
    }
}

#[async_trait]
impl ResultCollector for ResultRegistry {
    async fn add_task(&self, task: &Task, machine: &Machine, channel: Option<Arc<CommandChannel>>) {
        let previous = self.by_ip.write().await.insert(
            machine.ip.clone(),
            Registration {
                task_id: task.id,
                channel,
            },
        );
        if let Some(previous) = previous {
            warn!(
                task_id = task.id,
                previous_task = previous.task_id,
                ip = %machine.ip,
                "Guest IP was still registered to another task"
            );
        }
    }

    async fn del_task(&self, task: &Task, machine: &Machine) {
        let mut registry = self.by_ip.write().await;
        if registry.get(&machine.ip).is_some_and(|r| r.task_id == task.id) {
            if let Some(Registration { channel: Some(channel), .. }) = registry.remove(&machine.ip) {
                channel.detach();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskType;
    use shared::messaging::event_types::Command;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_guest_connection_reaches_command_channel() {
        let registry = Arc::new(ResultRegistry::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(registry.clone().run(listener, stop_rx));

        let task = Task::new(12, TaskType::Massurl);
        let mut machine = Machine::new("win7", "windows");
        machine.ip = "127.0.0.1".to_string();
        let channel = Arc::new(CommandChannel::new());
        registry.add_task(&task, &machine, Some(channel.clone())).await;
        assert_eq!(registry.task_for("127.0.0.1").await, Some(12));

        let guest = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !channel.is_attached() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        channel.send_command(Command::list_packages(), None).unwrap();
        let mut lines = BufReader::new(guest).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let sent: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(sent["method"], "list_packages");

        registry.del_task(&task, &machine).await;
        assert!(!channel.is_attached());
        assert_eq!(registry.task_for("127.0.0.1").await, None);
        let _ = stop_tx.send(true);
    }

    #[tokio::test]
    async fn test_del_task_ignores_other_tasks() {
        let registry = ResultRegistry::new();
        let machine = Machine::new("win7", "windows");
        registry.add_task(&Task::new(1, TaskType::Regular), &machine, None).await;
        registry.del_task(&Task::new(2, TaskType::Regular), &machine).await;
        assert_eq!(registry.task_for(&machine.ip).await, Some(1));
    }
}
