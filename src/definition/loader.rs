use super::types::MigrationDefinition;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Walk error: {0}")]
    WalkError(#[from] walkdir::Error),

    #[error("Migration path not found: {0}")]
    PathNotFound(String),
}

/// Discovers and reads migration sources
#[async_trait]
pub trait Loader: Send + Sync {
    /// Map of migration name -> source location
    async fn list_available_definitions(
        &self,
        paths: &[PathBuf],
    ) -> Result<BTreeMap<String, PathBuf>, LoaderError>;

    /// Read the given sources as unparsed definitions, in the given order
    async fn load_definitions(
        &self,
        paths: &[PathBuf],
    ) -> Result<Vec<MigrationDefinition>, LoaderError>;
}

/// Loads definitions from files, or from regular files directly inside directories
pub struct FilesystemLoader {
    default_dirs: Vec<PathBuf>,
}

impl FilesystemLoader {
    pub fn new(default_dirs: Vec<PathBuf>) -> Self {
        Self { default_dirs }
    }

    fn collect(&self, path: &Path, found: &mut BTreeMap<String, PathBuf>) -> Result<(), LoaderError> {
        if path.is_file() {
            if let Some(name) = file_name(path) {
                found.insert(name, path.to_path_buf());
            }
            return Ok(());
        }

        for entry in WalkDir::new(path).min_depth(1).max_depth(1) {
            let entry = entry?;
            if entry.file_type().is_file() {
                if let Some(name) = file_name(entry.path()) {
                    found.insert(name, entry.path().to_path_buf());
                }
            }
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().to_string())
}

#[async_trait]
impl Loader for FilesystemLoader {
    async fn list_available_definitions(
        &self,
        paths: &[PathBuf],
    ) -> Result<BTreeMap<String, PathBuf>, LoaderError> {
        let mut found = BTreeMap::new();

        if paths.is_empty() {
            // Default directories are optional
            for dir in self.default_dirs.iter().filter(|d| d.exists()) {
                self.collect(dir, &mut found)?;
            }
            return Ok(found);
        }

        for path in paths {
            if !path.exists() {
                return Err(LoaderError::PathNotFound(path.display().to_string()));
            }
            self.collect(path, &mut found)?;
        }
        Ok(found)
    }

    async fn load_definitions(
        &self,
        paths: &[PathBuf],
    ) -> Result<Vec<MigrationDefinition>, LoaderError> {
        let mut definitions = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = fs::read(path).await?;
            let name = file_name(path).unwrap_or_else(|| path.display().to_string());
            let definition = match String::from_utf8(bytes) {
                Ok(raw) => MigrationDefinition::unparsed(name, path.clone(), raw),
                Err(e) => {
                    let raw = String::from_utf8_lossy(e.as_bytes()).into_owned();
                    MigrationDefinition::unparsed(name, path.clone(), raw)
                        .invalid(format!("Definition source is not valid UTF-8: {}", e.utf8_error()))
                }
            };
            definitions.push(definition);
        }
        Ok(definitions)
    }
}
