//! Durable bookkeeping of migration records.

mod json;
mod types;

pub use json::JsonStorageHandler;
pub use types::{Migration, MigrationStatus, MigrationTable};

use crate::definition::MigrationDefinition;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Migration '{0}' can not be started: it is already executing")]
    AlreadyExecuting(String),

    #[error("Migration '{0}' can not be started: it was already executed (status: {1})")]
    AlreadyExecuted(String, MigrationStatus),

    #[error("Migration '{0}' can not be ended as it is not executing")]
    NotExecuting(String),

    #[error("Migration '{0}' can not be resumed as it is not suspended")]
    NotSuspended(String),

    #[error("Migration '{0}' not found")]
    NotFound(String),

    #[error("Migration '{0}' already exists")]
    AlreadyExists(String),
}

/// Records migration identity, status, timestamps and messages
#[async_trait]
pub trait StorageHandler: Send + Sync {
    /// Record the migration as started. Commits on its own.
    async fn start_migration(
        &self,
        definition: &MigrationDefinition,
        force: bool,
    ) -> Result<Migration, StorageError>;

    /// Persist the final status and message of a run
    async fn end_migration(&self, migration: &Migration, force: bool) -> Result<(), StorageError>;

    /// Move a suspended migration back to started
    async fn resume_migration(&self, migration: &Migration) -> Result<Migration, StorageError>;

    async fn skip_migration(&self, definition: &MigrationDefinition) -> Result<Migration, StorageError>;

    async fn add_migration(&self, definition: &MigrationDefinition) -> Result<Migration, StorageError>;

    async fn delete_migration(&self, migration: &Migration) -> Result<(), StorageError>;

    async fn load_migration(&self, name: &str) -> Result<Option<Migration>, StorageError>;

    /// `limit` of `None` or 0 means no limit
    async fn load_migrations(
        &self,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Migration>, StorageError>;

    async fn load_migrations_by_status(
        &self,
        status: MigrationStatus,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Migration>, StorageError>;

    async fn load_migrations_by_paths(
        &self,
        paths: &[String],
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Migration>, StorageError>;
}
