//! Shared messaging and observability for the sandbox services
//!
//! - [`messaging`]: newline-delimited JSON transport, the event bus broker
//!   and client, and the guest command channel
//! - [`observability`]: structured logging setup

// Re-export common dependencies
pub use anyhow;
pub use chrono;
pub use serde;
pub use serde_json;
pub use thiserror;
pub use tracing;
pub use uuid;

pub mod messaging;
pub mod observability;
