use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Kind of analysis a task asks for; selects the analysis manager
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Regular,
    /// Clean run of a machine without a target, used as a behavior baseline
    Baseline,
    Service,
    /// One task in a series that shares a single machine
    Longterm,
    /// Batch of URLs opened block by block in one machine
    Massurl,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Regular => "regular",
            TaskType::Baseline => "baseline",
            TaskType::Service => "service",
            TaskType::Longterm => "longterm",
            TaskType::Massurl => "massurl",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for TaskType {
    fn default() -> Self {
        TaskType::Regular
    }
}

/// Persisted status of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted and waiting for a machine
    Pending,
    Running,
    /// Analysis finished, results not processed yet
    Completed,
    /// Results processed
    Reported,
    FailedAnalysis,
    FailedProcessing,
    /// Stopped early, remaining targets need a new task
    Aborted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Reported => "reported",
            TaskStatus::FailedAnalysis => "failed_analysis",
            TaskStatus::FailedProcessing => "failed_processing",
            TaskStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetCategory {
    File,
    Url,
    Archive,
}

impl TargetCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetCategory::File => "file",
            TargetCategory::Url => "url",
            TargetCategory::Archive => "archive",
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, TargetCategory::File | TargetCategory::Archive)
    }
}

/// Something to open inside the machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub id: i64,
    pub category: TargetCategory,
    /// File name or URL
    pub target: String,
    #[serde(default)]
    pub sha256: Option<String>,
    /// Location of the submitted file on disk
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Set once the target has been opened in a MassURL block
    #[serde(default)]
    pub analyzed: bool,
}

impl Target {
    pub fn url(id: i64, url: impl Into<String>) -> Self {
        Self {
            id,
            category: TargetCategory::Url,
            target: url.into(),
            sha256: None,
            path: None,
            analyzed: false,
        }
    }

    pub fn file(id: i64, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            id,
            category: TargetCategory::File,
            target: name,
            sha256: None,
            path: Some(path),
            analyzed: false,
        }
    }
}

/// Error message recorded against a task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    pub message: String,
    pub created_on: DateTime<Utc>,
}

/// A unit of analysis work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: i32,
    /// Name of the only machine this task may run on
    #[serde(default)]
    pub machine: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    pub added_on: DateTime<Utc>,
    /// Not handed out before this time
    #[serde(default)]
    pub start_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub options: HashMap<String, String>,
    #[serde(default)]
    pub package: Option<String>,
    /// Analysis timeout in seconds, 0 uses the guest default
    #[serde(default)]
    pub timeout: u64,
    /// Dump machine memory after the analysis
    #[serde(default)]
    pub memory: bool,
    #[serde(default)]
    pub longterm_id: Option<i64>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub errors: Vec<TaskError>,
}

impl Task {
    pub fn new(id: i64, task_type: TaskType) -> Self {
        Self {
            id,
            task_type,
            priority: 1,
            machine: None,
            platform: None,
            tags: Vec::new(),
            status: TaskStatus::Pending,
            added_on: Utc::now(),
            start_on: None,
            started_on: None,
            completed_on: None,
            owner: None,
            route: None,
            options: HashMap::new(),
            package: None,
            timeout: 0,
            memory: false,
            longterm_id: None,
            targets: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Whether the task may be scheduled at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.start_on.map_or(true, |start_on| start_on <= now)
    }

    pub fn primary_target(&self) -> Option<&Target> {
        self.targets.first()
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Parse an option, falling back to `default` when missing or invalid
    pub fn option_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.option(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Options given as `yes`, `true`, `on` or `1` count as enabled
    pub fn option_enabled(&self, key: &str) -> bool {
        matches!(
            self.option(key).map(|v| v.trim().to_ascii_lowercase()).as_deref(),
            Some("yes" | "true" | "on" | "1")
        )
    }

    /// Options rendered as `key=value,...` in a stable order
    pub fn options_string(&self) -> String {
        let mut pairs: Vec<_> = self.options.iter().collect();
        pairs.sort();
        pairs
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Human readable machine constraints for log lines
    pub fn requirements_str(&self) -> String {
        let mut parts = Vec::new();
        if let Some(machine) = &self.machine {
            parts.push(format!("machine={}", machine));
        }
        if let Some(platform) = &self.platform {
            parts.push(format!("platform={}", platform));
        }
        if !self.tags.is_empty() {
            parts.push(format!("tags={}", self.tags.join(",")));
        }
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(" ")
        }
    }
}
