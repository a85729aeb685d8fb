//! Persistence of the execution context of suspended migrations.

mod file;

pub use file::FileContextHandler;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// What is kept of a run between suspension and resumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredContext {
    pub context: Map<String, Value>,
    /// 1-based index of the step the run stopped at
    pub step: usize,
}

#[async_trait]
pub trait ContextHandler: Send + Sync {
    async fn store_current_context(
        &self,
        migration_name: &str,
        context: &StoredContext,
    ) -> Result<(), ContextError>;

    /// The raw stored document; validating its shape is the caller's job
    async fn restore_current_context(&self, migration_name: &str) -> Result<Option<Value>, ContextError>;

    async fn delete_context(&self, migration_name: &str) -> Result<(), ContextError>;
}
