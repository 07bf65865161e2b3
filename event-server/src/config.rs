use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use shared::messaging::server::DEFAULT_BACKLOG_LIMIT;
use shared::messaging::EventServerConfig;
use shared::observability::{LogConfig, LogFormat, LogLevel};

/// Event server configuration, loaded from the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub outbox_capacity: usize,
    pub relay_interval_ms: u64,
    pub backlog_limit: usize,
    pub log_level: String,
    pub log_format: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("EVENT_SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("EVENT_SERVER_PORT")
                .unwrap_or_else(|_| "42037".to_string())
                .parse()
                .context("Invalid EVENT_SERVER_PORT")?,
            outbox_capacity: env::var("EVENT_SERVER_OUTBOX")
                .unwrap_or_else(|_| "64".to_string())
                .parse()
                .context("Invalid EVENT_SERVER_OUTBOX")?,
            relay_interval_ms: env::var("EVENT_SERVER_RELAY_MS")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .context("Invalid EVENT_SERVER_RELAY_MS")?,
            backlog_limit: env::var("EVENT_SERVER_BACKLOG")
                .unwrap_or_else(|_| DEFAULT_BACKLOG_LIMIT.to_string())
                .parse()
                .context("Invalid EVENT_SERVER_BACKLOG")?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.outbox_capacity == 0 {
            anyhow::bail!("Outbox capacity must be at least 1");
        }
        if self.relay_interval_ms == 0 {
            anyhow::bail!("Relay interval cannot be 0");
        }
        if self.backlog_limit == 0 {
            anyhow::bail!("Backlog limit must be at least 1");
        }
        Ok(())
    }

    pub fn server_config(&self) -> EventServerConfig {
        EventServerConfig {
            host: self.host.clone(),
            port: self.port,
            outbox_capacity: self.outbox_capacity,
            relay_interval: Duration::from_millis(self.relay_interval_ms),
            backlog_limit: self.backlog_limit,
        }
    }

    pub fn log_config(&self) -> Result<LogConfig> {
        let level: LogLevel = self.log_level.parse().context("Invalid LOG_LEVEL")?;
        let format: LogFormat = self.log_format.parse().context("Invalid LOG_FORMAT")?;

        Ok(LogConfig {
            level,
            format,
            service_name: "event-server".to_string(),
            include_line_numbers: !matches!(format, LogFormat::Json),
            include_thread_ids: matches!(format, LogFormat::Json),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 42037,
            outbox_capacity: 64,
            relay_interval_ms: 100,
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_server_config_from_defaults() {
        let server = Config::default().server_config();
        assert_eq!(server.port, 42037);
        assert_eq!(server.outbox_capacity, 64);
        assert_eq!(server.relay_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_rejects_zero_outbox() {
        let config = Config {
            outbox_capacity: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_log_level() {
        let config = Config {
            log_level: "loud".to_string(),
            ..Config::default()
        };
        assert!(config.log_config().is_err());
    }
}
