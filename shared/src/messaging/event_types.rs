use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event announcing a new or closed MassURL URL batch
pub const EVENT_MASSURL_TASK: &str = "massurltask";
/// Event emitted when a MassURL block triggered a detection
pub const EVENT_MASSURL_DETECTION: &str = "massurldetection";
/// Signature hit reported by a realtime processor
pub const EVENT_SIGNATURE: &str = "signature";

/// Payload of an `"event"` bus message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: String,
    #[serde(default)]
    pub body: Value,
}

impl EventMessage {
    pub fn new(event: impl Into<String>, body: Value) -> Self {
        Self {
            event: event.into(),
            body,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolAction {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolBody {
    #[serde(default)]
    pub events: Vec<String>,
}

/// Messages understood by the event bus broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BusMessage {
    Event {
        body: EventMessage,
    },
    Protocol {
        action: ProtocolAction,
        body: ProtocolBody,
    },
}

impl BusMessage {
    pub fn event(event: impl Into<String>, body: Value) -> Self {
        BusMessage::Event {
            body: EventMessage::new(event, body),
        }
    }

    pub fn subscribe(events: Vec<String>) -> Self {
        BusMessage::Protocol {
            action: ProtocolAction::Subscribe,
            body: ProtocolBody { events },
        }
    }

    pub fn unsubscribe(events: Vec<String>) -> Self {
        BusMessage::Protocol {
            action: ProtocolAction::Unsubscribe,
            body: ProtocolBody { events },
        }
    }
}

/// A command sent to the analyzer running inside a guest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub category: String,
    pub method: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub respond: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<u64>,
}

/// Reply to a [`Command`], correlated through `rid`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub rid: u64,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub return_data: Value,
}

/// Classification of a line received on a command connection
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Response(CommandResponse),
    /// Anything that is not a response; dispatched on its `type` field
    Message { msg_type: Option<String>, raw: Value },
}

impl InboundMessage {
    pub fn classify(raw: Value) -> Self {
        if raw.get("rid").is_some_and(|rid| !rid.is_null()) {
            if let Ok(response) = serde_json::from_value::<CommandResponse>(raw.clone()) {
                return InboundMessage::Response(response);
            }
        }

        let msg_type = raw
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);
        InboundMessage::Message { msg_type, raw }
    }
}
