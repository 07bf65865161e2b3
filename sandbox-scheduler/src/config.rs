/// Configuration module for the sandbox scheduler
///
/// Every section is loaded from environment variables (a `.env` file is
/// honored) with defaults for anything unset, then validated as a whole.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use shared::observability::{LogConfig, LogFormat, LogLevel};

/// Main configuration structure for the scheduler service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub analysis: AnalysisConfig,
    pub massurl: MassUrlConfig,
    pub event_bus: EventBusConfig,
    pub machinery: MachineryConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        Ok(Self {
            scheduler: SchedulerConfig::from_env()?,
            analysis: AnalysisConfig::from_env()?,
            massurl: MassUrlConfig::from_env()?,
            event_bus: EventBusConfig::from_env()?,
            machinery: MachineryConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.analysis.validate()?;
        self.massurl.validate()?;
        self.event_bus.validate()?;
        self.machinery.validate()?;
        Ok(())
    }
}

/// Scheduler loop and global ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Machines allowed to be starting at the same time
    pub max_vmstartup_count: usize,
    /// Running machines ceiling, 0 for unlimited
    pub max_machines_count: usize,
    /// Total analyses before the scheduler stops, 0 for unlimited
    pub max_analysis_count: u64,
    /// Minimum free space in the analyses storage, 0 disables the check
    pub freespace_mb: u64,
    pub tick_ms: u64,
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            max_vmstartup_count: env::var("MAX_VMSTARTUP_COUNT")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("Invalid MAX_VMSTARTUP_COUNT")?,
            max_machines_count: env::var("MAX_MACHINES_COUNT")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("Invalid MAX_MACHINES_COUNT")?,
            max_analysis_count: env::var("MAX_ANALYSIS_COUNT")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("Invalid MAX_ANALYSIS_COUNT")?,
            freespace_mb: env::var("FREESPACE_MB")
                .unwrap_or_else(|_| "1024".to_string())
                .parse()
                .context("Invalid FREESPACE_MB")?,
            tick_ms: env::var("SCHEDULER_TICK_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("Invalid SCHEDULER_TICK_MS")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_vmstartup_count == 0 {
            anyhow::bail!("MAX_VMSTARTUP_COUNT must be at least 1");
        }
        if self.tick_ms == 0 {
            anyhow::bail!("Scheduler tick cannot be 0");
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_vmstartup_count: 1,
            max_machines_count: 0,
            max_analysis_count: 0,
            freespace_mb: 1024,
            tick_ms: 1000,
        }
    }
}

/// Behavior shared by all analysis managers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Root of the sandbox storage, analyses live under `analyses/<id>`
    pub storage_path: PathBuf,
    pub memory_dump: bool,
    pub remote_control: bool,
    /// Run result processing right after an analysis stops
    pub process_results: bool,
    pub default_route: String,
    pub routes: Vec<String>,
    pub longterm_poll_interval_secs: u64,
}

impl AnalysisConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            storage_path: PathBuf::from(
                env::var("STORAGE_PATH").unwrap_or_else(|_| "./storage".to_string()),
            ),
            memory_dump: env::var("MEMORY_DUMP")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            remote_control: env::var("REMOTE_CONTROL")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            process_results: env::var("PROCESS_RESULTS")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            default_route: env::var("DEFAULT_ROUTE").unwrap_or_else(|_| "none".to_string()),
            routes: env::var("ROUTES")
                .unwrap_or_else(|_| "none,drop,internet".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            longterm_poll_interval_secs: env::var("LONGTERM_POLL_INTERVAL")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("Invalid LONGTERM_POLL_INTERVAL")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_path.as_os_str().is_empty() {
            anyhow::bail!("Storage path cannot be empty");
        }
        if !self.routes.iter().any(|r| r == &self.default_route) {
            anyhow::bail!("Default route '{}' is not a configured route", self.default_route);
        }
        if self.longterm_poll_interval_secs == 0 {
            anyhow::bail!("Longterm poll interval cannot be 0");
        }
        Ok(())
    }

    pub fn analyses_path(&self) -> PathBuf {
        self.storage_path.join("analyses")
    }

    pub fn longterm_poll_interval(&self) -> Duration {
        Duration::from_secs(self.longterm_poll_interval_secs)
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./storage"),
            memory_dump: false,
            remote_control: false,
            process_results: false,
            default_route: "none".to_string(),
            routes: vec!["none".to_string(), "drop".to_string(), "internet".to_string()],
            longterm_poll_interval_secs: 60,
        }
    }
}

/// MassURL batch pipeline defaults, overridable per task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MassUrlConfig {
    pub block_size: usize,
    pub block_time_secs: u64,
    pub realtime_maxwait_secs: u64,
    pub diary_path: PathBuf,
}

impl MassUrlConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            block_size: env::var("MASSURL_BLOCK_SIZE")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Invalid MASSURL_BLOCK_SIZE")?,
            block_time_secs: env::var("MASSURL_BLOCK_TIME")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .context("Invalid MASSURL_BLOCK_TIME")?,
            realtime_maxwait_secs: env::var("MASSURL_REALTIME_MAXWAIT")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("Invalid MASSURL_REALTIME_MAXWAIT")?,
            diary_path: PathBuf::from(
                env::var("MASSURL_DIARY_PATH")
                    .unwrap_or_else(|_| "./storage/massurl/diaries".to_string()),
            ),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            anyhow::bail!("MassURL block size must be at least 1");
        }
        Ok(())
    }

    pub fn realtime_maxwait(&self) -> Duration {
        Duration::from_secs(self.realtime_maxwait_secs)
    }
}

impl Default for MassUrlConfig {
    fn default() -> Self {
        Self {
            block_size: 5,
            block_time_secs: 20,
            realtime_maxwait_secs: 60,
            diary_path: PathBuf::from("./storage/massurl/diaries"),
        }
    }
}

/// Where the event bus server lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    pub host: String,
    pub port: u16,
    pub client_max_tries: u32,
}

impl EventBusConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("EVENT_SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("EVENT_SERVER_PORT")
                .unwrap_or_else(|_| "42037".to_string())
                .parse()
                .context("Invalid EVENT_SERVER_PORT")?,
            client_max_tries: env::var("EVENT_CLIENT_MAX_TRIES")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("Invalid EVENT_CLIENT_MAX_TRIES")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Event server port cannot be 0");
        }
        Ok(())
    }
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 42037,
            client_max_tries: 2,
        }
    }
}

/// Machine control and the machine/task inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineryConfig {
    /// Control program invoked as `<command> <action> <label> [args]`
    pub command: String,
    /// JSON file with machines and tasks loaded at startup
    pub seed_file: Option<PathBuf>,
    /// Address guests connect back to
    pub result_server_host: String,
    pub result_server_port: u16,
}

impl MachineryConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            command: env::var("MACHINERY_COMMAND").unwrap_or_else(|_| "vmctl".to_string()),
            seed_file: env::var("SEED_FILE").ok().map(PathBuf::from),
            result_server_host: env::var("RESULT_SERVER_HOST")
                .unwrap_or_else(|_| "0.0.0.0".to_string()),
            result_server_port: env::var("RESULT_SERVER_PORT")
                .unwrap_or_else(|_| "2042".to_string())
                .parse()
                .context("Invalid RESULT_SERVER_PORT")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            anyhow::bail!("Machinery command cannot be empty");
        }
        Ok(())
    }

    pub fn result_server_addr(&self) -> String {
        format!("{}:{}", self.result_server_host, self.result_server_port)
    }
}

impl Default for MachineryConfig {
    fn default() -> Self {
        Self {
            command: "vmctl".to_string(),
            seed_file: None,
            result_server_host: "0.0.0.0".to_string(),
            result_server_port: 2042,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
        })
    }

    /// Build the subscriber configuration for `service_name`
    pub fn log_config(&self, service_name: &str) -> Result<LogConfig> {
        let level: LogLevel = self.level.parse().context("Invalid LOG_LEVEL")?;
        let format: LogFormat = self.format.parse().context("Invalid LOG_FORMAT")?;

        Ok(LogConfig {
            level,
            format,
            service_name: service_name.to_string(),
            include_line_numbers: !matches!(format, LogFormat::Json),
            include_thread_ids: matches!(format, LogFormat::Json),
        })
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
