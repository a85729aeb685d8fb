use crate::utils::{resolve_path, STATE_FOLDER};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

fn default_migration_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("migrations")]
}

fn default_storage_file() -> PathBuf {
    Path::new(STATE_FOLDER).join("migrations.json")
}

fn default_context_dir() -> PathBuf {
    Path::new(STATE_FOLDER).join("context")
}

fn default_data_file() -> PathBuf {
    Path::new(STATE_FOLDER).join("data.json")
}

fn default_admin_login() -> String {
    "admin".to_string()
}

fn default_use_transaction() -> bool {
    true
}

fn default_record_types() -> Vec<String> {
    vec!["record".to_string()]
}

fn default_known_users() -> Vec<String> {
    vec!["admin".to_string()]
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Where migration definitions are looked up when no path is given
    #[serde(default = "default_migration_dirs")]
    pub migration_dirs: Vec<PathBuf>,
    /// JSON file holding the migration records
    #[serde(default = "default_storage_file")]
    pub storage_file: PathBuf,
    /// Directory of suspended migration contexts
    #[serde(default = "default_context_dir")]
    pub context_dir: PathBuf,
    /// Document the record executor works on
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,
    #[serde(default = "default_admin_login")]
    pub admin_login: String,
    #[serde(default = "default_use_transaction")]
    pub use_transaction: bool,
    /// Step types handled by the record executor
    #[serde(default = "default_record_types")]
    pub record_types: Vec<String>,
    /// Logins the backend accepts to switch identity to
    #[serde(default = "default_known_users")]
    pub known_users: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            migration_dirs: default_migration_dirs(),
            storage_file: default_storage_file(),
            context_dir: default_context_dir(),
            data_file: default_data_file(),
            admin_login: default_admin_login(),
            use_transaction: default_use_transaction(),
            record_types: default_record_types(),
            known_users: default_known_users(),
        }
    }
}

impl EngineConfig {
    /// Copy with every relative path resolved against `base`
    pub fn resolved(&self, base: &Path) -> Self {
        Self {
            migration_dirs: self
                .migration_dirs
                .iter()
                .map(|dir| resolve_path(base, dir))
                .collect(),
            storage_file: resolve_path(base, &self.storage_file),
            context_dir: resolve_path(base, &self.context_dir),
            data_file: resolve_path(base, &self.data_file),
            ..self.clone()
        }
    }
}

/// Read the configuration file, with paths resolved against its directory
pub async fn read_config(config_path: &Path) -> Result<Option<EngineConfig>, ConfigError> {
    if !config_path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(config_path).await?;
    let config: EngineConfig = serde_json::from_str(&content)?;
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    Ok(Some(config.resolved(base)))
}

/// Write the configuration file
pub async fn write_config(config_path: &Path, config: &EngineConfig) -> Result<(), ConfigError> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(config)?;
    fs::write(config_path, content).await?;
    Ok(())
}
