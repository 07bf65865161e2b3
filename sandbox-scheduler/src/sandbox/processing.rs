//! Result processing
//!
//! `ResultProcessor` turns a finished (or, for long-term series, running)
//! analysis into a report. `RealtimeProcessor` summarizes what a MassURL
//! block did while its URLs were open.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::models::Task;
use crate::utils::TaskDir;

#[async_trait]
pub trait ResultProcessor: Send + Sync {
    /// Process the results collected so far; false when processing failed
    async fn process(&self, task: &Task) -> Result<bool>;
}

/// Writes `reports/report.json` with the task and the files collected in
/// its directory
#[derive(Debug, Clone)]
pub struct JsonReporter {
    analyses: PathBuf,
}

impl JsonReporter {
    pub fn new(analyses: impl Into<PathBuf>) -> Self {
        Self {
            analyses: analyses.into(),
        }
    }

    async fn collected_files(dir: &TaskDir) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for sub in ["logs", "files", "shots", "memory"] {
            let path = dir.path().join(sub);
            let Ok(mut entries) = tokio::fs::read_dir(&path).await else {
                continue;
            };
            while let Some(entry) = entries.next_entry().await? {
                files.push(format!("{}/{}", sub, entry.file_name().to_string_lossy()));
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl ResultProcessor for JsonReporter {
    async fn process(&self, task: &Task) -> Result<bool> {
        let dir = TaskDir::new(&self.analyses, task.id);
        if !dir.exists() {
            return Ok(false);
        }

        let report = json!({
            "info": {
                "id": task.id,
                "type": task.task_type,
                "machine": task.machine,
                "route": task.route,
                "started": task.started_on,
                "generated": Utc::now(),
            },
            "targets": task.targets,
            "files": Self::collected_files(&dir).await?,
        });

        tokio::fs::create_dir_all(dir.reports())
            .await
            .context("Failed to create reports directory")?;
        let path = dir.reports().join("report.json");
        tokio::fs::write(&path, serde_json::to_vec_pretty(&report)?)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!(task_id = task.id, action = "task.report", "Report generated");
        Ok(true)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("No block summary within {0:?}")]
    BlockingExpired(Duration),

    #[error("Realtime processing failed: {0}")]
    Processor(String),
}

/// What happened while one block of URLs was open
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub signatures: Vec<Value>,
    /// Requests made by the browser, per opened URL
    pub requested: HashMap<String, Vec<Value>>,
    pub javascript: HashMap<String, Vec<String>>,
}

#[async_trait]
pub trait RealtimeProcessor: Send + Sync {
    async fn summarize(
        &self,
        task: &Task,
        urls: &[String],
        maxwait: Duration,
    ) -> Result<BlockSummary, RealtimeError>;
}

/// Processor reporting empty summaries
#[derive(Debug, Clone, Default)]
pub struct NullRealtime;

#[async_trait]
impl RealtimeProcessor for NullRealtime {
    async fn summarize(
        &self,
        _task: &Task,
        _urls: &[String],
        _maxwait: Duration,
    ) -> Result<BlockSummary, RealtimeError> {
        Ok(BlockSummary::default())
    }
}
