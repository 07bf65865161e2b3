use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use uuid::Uuid;

use crate::models::URLDiary;

/// Persistence for MassURL URL diaries
#[async_trait]
pub trait DiaryStore: Send + Sync {
    /// Store a diary and return its id
    async fn store_diary(&self, diary: &URLDiary) -> Result<Uuid>;
}

/// Writes each diary to `<dir>/<id>.json`
#[derive(Debug, Clone)]
pub struct FileDiaryStore {
    dir: PathBuf,
}

impl FileDiaryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl DiaryStore for FileDiaryStore {
    async fn store_diary(&self, diary: &URLDiary) -> Result<Uuid> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context("Failed to create diary directory")?;

        let path = self.dir.join(format!("{}.json", diary.id));
        let data = serde_json::to_vec_pretty(diary)?;
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to write diary {}", path.display()))?;

        tracing::debug!(diary_id = %diary.id, url = %diary.url, "Stored URL diary");
        Ok(diary.id)
    }
}
