use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;

use crate::models::{Target, Task, TaskStatus};

const SUBDIRS: &[&str] = &["logs", "files", "shots", "memory", "reports"];

/// Directory holding everything produced for one task:
/// `<analyses>/<task id>`
#[derive(Debug, Clone)]
pub struct TaskDir {
    analyses: PathBuf,
    path: PathBuf,
}

impl TaskDir {
    pub fn new(analyses: &Path, task_id: i64) -> Self {
        Self {
            analyses: analyses.to_path_buf(),
            path: analyses.join(task_id.to_string()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reports(&self) -> PathBuf {
        self.path.join("reports")
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Create the task directory and its subdirectories
    pub async fn create(&self) -> Result<()> {
        for sub in SUBDIRS {
            let dir = self.path.join(sub);
            async_fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Write `task.json`, optionally with a status differing from the
    /// task's current one
    pub async fn write_task_json(&self, task: &Task, status: Option<TaskStatus>) -> Result<()> {
        let mut snapshot = task.clone();
        if let Some(status) = status {
            snapshot.status = status;
        }
        let data = serde_json::to_vec_pretty(&snapshot)?;
        let path = self.path.join("task.json");
        async_fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Point `<analyses>/latest` at this task
    #[cfg(unix)]
    pub async fn set_latest(&self) -> Result<()> {
        let latest = self.analyses.join("latest");
        if async_fs::symlink_metadata(&latest).await.is_ok() {
            async_fs::remove_file(&latest)
                .await
                .context("Failed to remove latest symlink")?;
        }
        async_fs::symlink(&self.path, &latest)
            .await
            .context("Failed to create latest symlink")
    }

    #[cfg(not(unix))]
    pub async fn set_latest(&self) -> Result<()> {
        Ok(())
    }
}

/// Ensure a file target can be read before a machine is spent on it
pub async fn check_target_readable(target: &Target) -> Result<()> {
    if !target.category.is_file() {
        return Ok(());
    }
    let path = target
        .path
        .as_ref()
        .ok_or_else(|| anyhow!("File target {} has no path", target.id))?;

    async_fs::File::open(path)
        .await
        .with_context(|| format!("File target {} is not readable", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskType;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_create_and_write_task_json() {
        let root = tempfile::tempdir().unwrap();
        let dir = TaskDir::new(root.path(), 7);
        assert!(!dir.exists());

        assert_ok!(dir.create().await);
        assert!(dir.exists());
        assert!(dir.reports().is_dir());

        let task = Task::new(7, TaskType::Regular);
        assert_ok!(dir.write_task_json(&task, Some(TaskStatus::FailedAnalysis)).await);

        let raw = std::fs::read_to_string(dir.path().join("task.json")).unwrap();
        let stored: Task = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored.status, TaskStatus::FailedAnalysis);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_latest_symlink_is_replaced() {
        let root = tempfile::tempdir().unwrap();
        let first = TaskDir::new(root.path(), 1);
        let second = TaskDir::new(root.path(), 2);
        first.create().await.unwrap();
        second.create().await.unwrap();

        assert_ok!(first.set_latest().await);
        assert_ok!(second.set_latest().await);

        let target = std::fs::read_link(root.path().join("latest")).unwrap();
        assert_eq!(target, second.path());
    }

    #[tokio::test]
    async fn test_check_target_readable() {
        let root = tempfile::tempdir().unwrap();
        let sample = root.path().join("sample.exe");
        std::fs::write(&sample, b"MZ").unwrap();

        assert_ok!(check_target_readable(&Target::file(1, &sample)).await);
        assert_err!(check_target_readable(&Target::file(2, root.path().join("gone.exe"))).await);
        assert_ok!(check_target_readable(&Target::url(3, "http://a.example")).await);
    }
}
