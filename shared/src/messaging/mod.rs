/// Messaging: line-framed JSON transport, pub/sub event bus and the
/// correlated command channel used to talk to analysis guests.
pub mod client;
pub mod command;
pub mod event_types;
pub mod server;
pub mod transport;

pub use client::{EventCallback, EventClient, EventClientConfig};
pub use command::{CommandChannel, CommandError, ResponseCallback};
pub use event_types::*;
pub use server::{EventServer, EventServerConfig};

/// Handle returned by [`EventHub::subscribe`], used to unsubscribe again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Publishing side of the event bus plus local callback registration.
///
/// Implemented by [`EventClient`]; analysis code depends on this trait so
/// it can run against any bus connection.
pub trait EventHub: Send + Sync {
    /// Queue an event for delivery to every subscriber of `event`
    fn send_event(&self, event: &str, body: serde_json::Value) -> MessageResult<()>;

    /// Register a callback for incoming events of type `event`
    fn subscribe(&self, event: &str, callback: EventCallback) -> SubscriptionId;

    /// Remove a callback registered with [`EventHub::subscribe`]
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Message transport errors
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,
}

impl From<std::io::Error> for MessageError {
    fn from(err: std::io::Error) -> Self {
        MessageError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for MessageError {
    fn from(err: serde_json::Error) -> Self {
        MessageError::Serialization(err.to_string())
    }
}

pub type MessageResult<T> = Result<T, MessageError>;
