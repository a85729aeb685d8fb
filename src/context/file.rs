use super::{ContextError, ContextHandler, StoredContext};
use crate::utils::sanitize_file_name;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use tokio::fs;

/// One JSON file per suspended migration under a directory
pub struct FileContextHandler {
    dir: PathBuf,
}

impl FileContextHandler {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn context_path(&self, migration_name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", sanitize_file_name(migration_name)))
    }
}

#[async_trait]
impl ContextHandler for FileContextHandler {
    async fn store_current_context(
        &self,
        migration_name: &str,
        context: &StoredContext,
    ) -> Result<(), ContextError> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.context_path(migration_name);
        let temp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(context)?;
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn restore_current_context(&self, migration_name: &str) -> Result<Option<Value>, ContextError> {
        let path = self.context_path(migration_name);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn delete_context(&self, migration_name: &str) -> Result<(), ContextError> {
        let path = self.context_path(migration_name);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
