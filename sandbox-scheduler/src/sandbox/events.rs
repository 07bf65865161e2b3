use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use shared::messaging::{EventClient, EventClientConfig, EventHub};

use crate::config::EventBusConfig;

/// Opens an event bus connection for one analysis
#[async_trait]
pub trait EventConnector: Send + Sync {
    /// `None` when the bus could not be reached
    async fn connect(&self) -> Option<Arc<dyn EventHub>>;
}

/// Connects a fresh [`EventClient`] to the configured event server
#[derive(Debug, Clone)]
pub struct BusConnector {
    config: EventBusConfig,
}

impl BusConnector {
    pub fn new(config: EventBusConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EventConnector for BusConnector {
    async fn connect(&self) -> Option<Arc<dyn EventHub>> {
        let client = EventClient::new(EventClientConfig {
            host: self.config.host.clone(),
            port: self.config.port,
            max_tries: self.config.client_max_tries,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        });

        if client.start(self.config.client_max_tries).await {
            Some(Arc::new(client))
        } else {
            None
        }
    }
}
