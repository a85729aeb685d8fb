use super::types::{Migration, MigrationStatus, MigrationTable};
use super::{StorageError, StorageHandler};
use crate::definition::MigrationDefinition;
use crate::utils::{compute_hash, now_iso};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// Storage handler keeping the migration table in a single JSON file
pub struct JsonStorageHandler {
    path: PathBuf,
    /// Guards every read-modify-write cycle on the file
    lock: Mutex<()>,
}

impl JsonStorageHandler {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Read the table from disk
    async fn read_table(&self) -> Result<MigrationTable, StorageError> {
        if !self.path.exists() {
            return Ok(MigrationTable::new());
        }

        let content = fs::read_to_string(&self.path).await?;
        let table: MigrationTable = serde_json::from_str(&content)?;
        Ok(table)
    }

    /// Write the table to disk (caller must hold the lock)
    async fn write_table_unlocked(&self, table: &mut MigrationTable) -> Result<(), StorageError> {
        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        table.updated_at = now_iso();

        // Write atomically using temp file + rename
        let temp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(table)?;
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    /// Insert or refresh the record for `definition` with the given status
    async fn create_migration(
        &self,
        definition: &MigrationDefinition,
        status: MigrationStatus,
        force: bool,
    ) -> Result<Migration, StorageError> {
        let _guard = self.lock.lock().await;
        let mut table = self.read_table().await?;

        if let Some(existing) = table.migrations.get(&definition.name) {
            if !force && existing.status == MigrationStatus::Started {
                return Err(StorageError::AlreadyExecuting(definition.name.clone()));
            }
            if !force && existing.status != MigrationStatus::ToDo {
                return Err(StorageError::AlreadyExecuted(
                    definition.name.clone(),
                    existing.status,
                ));
            }
        }

        let migration = Migration {
            name: definition.name.clone(),
            content_hash: compute_hash(&definition.raw_definition),
            path: definition.path.display().to_string(),
            execution_date: Some(Utc::now()),
            status,
            status_message: String::new(),
        };
        table
            .migrations
            .insert(migration.name.clone(), migration.clone());
        self.write_table_unlocked(&mut table).await?;

        debug!(migration = %migration.name, status = %status, "Migration recorded");
        Ok(migration)
    }
}

fn paginate(migrations: Vec<Migration>, limit: Option<usize>, offset: Option<usize>) -> Vec<Migration> {
    let iter = migrations.into_iter().skip(offset.unwrap_or(0));
    match limit {
        Some(limit) if limit > 0 => iter.take(limit).collect(),
        _ => iter.collect(),
    }
}

#[async_trait]
impl StorageHandler for JsonStorageHandler {
    async fn start_migration(
        &self,
        definition: &MigrationDefinition,
        force: bool,
    ) -> Result<Migration, StorageError> {
        self.create_migration(definition, MigrationStatus::Started, force)
            .await
    }

    async fn end_migration(&self, migration: &Migration, force: bool) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut table = self.read_table().await?;

        let existing = table
            .migrations
            .get_mut(&migration.name)
            .ok_or_else(|| StorageError::NotFound(migration.name.clone()))?;

        if !force && existing.status != MigrationStatus::Started {
            return Err(StorageError::NotExecuting(migration.name.clone()));
        }

        existing.status = migration.status;
        existing.status_message = migration.status_message.clone();
        existing.execution_date = migration.execution_date;
        self.write_table_unlocked(&mut table).await
    }

    async fn resume_migration(&self, migration: &Migration) -> Result<Migration, StorageError> {
        let _guard = self.lock.lock().await;
        let mut table = self.read_table().await?;

        let existing = table
            .migrations
            .get_mut(&migration.name)
            .ok_or_else(|| StorageError::NotFound(migration.name.clone()))?;

        if existing.status != MigrationStatus::Suspended {
            return Err(StorageError::NotSuspended(migration.name.clone()));
        }

        existing.status = MigrationStatus::Started;
        existing.execution_date = Some(Utc::now());
        let resumed = existing.clone();
        self.write_table_unlocked(&mut table).await?;
        Ok(resumed)
    }

    async fn skip_migration(&self, definition: &MigrationDefinition) -> Result<Migration, StorageError> {
        self.create_migration(definition, MigrationStatus::Skipped, false)
            .await
    }

    async fn add_migration(&self, definition: &MigrationDefinition) -> Result<Migration, StorageError> {
        let _guard = self.lock.lock().await;
        let mut table = self.read_table().await?;

        if table.migrations.contains_key(&definition.name) {
            return Err(StorageError::AlreadyExists(definition.name.clone()));
        }

        let migration = Migration {
            name: definition.name.clone(),
            content_hash: compute_hash(&definition.raw_definition),
            path: definition.path.display().to_string(),
            execution_date: None,
            status: MigrationStatus::ToDo,
            status_message: String::new(),
        };
        table
            .migrations
            .insert(migration.name.clone(), migration.clone());
        self.write_table_unlocked(&mut table).await?;
        Ok(migration)
    }

    async fn delete_migration(&self, migration: &Migration) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut table = self.read_table().await?;
        if table.migrations.remove(&migration.name).is_some() {
            self.write_table_unlocked(&mut table).await?;
        }
        Ok(())
    }

    async fn load_migration(&self, name: &str) -> Result<Option<Migration>, StorageError> {
        let table = self.read_table().await?;
        Ok(table.migrations.get(name).cloned())
    }

    async fn load_migrations(
        &self,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Migration>, StorageError> {
        let table = self.read_table().await?;
        Ok(paginate(table.migrations.into_values().collect(), limit, offset))
    }

    async fn load_migrations_by_status(
        &self,
        status: MigrationStatus,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Migration>, StorageError> {
        let table = self.read_table().await?;
        let matching = table
            .migrations
            .into_values()
            .filter(|m| m.status == status)
            .collect();
        Ok(paginate(matching, limit, offset))
    }

    async fn load_migrations_by_paths(
        &self,
        paths: &[String],
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Migration>, StorageError> {
        let table = self.read_table().await?;
        let matching = table
            .migrations
            .into_values()
            .filter(|m| paths.iter().any(|p| m.path.starts_with(p.as_str())))
            .collect();
        Ok(paginate(matching, limit, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paginate() {
        let migrations: Vec<Migration> = (0..5)
            .map(|i| Migration {
                name: format!("m{}", i),
                content_hash: String::new(),
                path: String::new(),
                execution_date: None,
                status: MigrationStatus::ToDo,
                status_message: String::new(),
            })
            .collect();

        assert_eq!(paginate(migrations.clone(), None, None).len(), 5);
        assert_eq!(paginate(migrations.clone(), Some(0), Some(1)).len(), 4);
        let page = paginate(migrations, Some(2), Some(3));
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].name, "m3");
    }

    #[test]
    fn test_migration_table_new() {
        let table = MigrationTable::new();
        assert_eq!(table.schema_version, 1);
        assert!(table.migrations.is_empty());
        assert!(!table.updated_at.is_empty());
    }
}
