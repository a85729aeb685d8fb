use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Execution status of a migration record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStatus {
    ToDo,
    Started,
    Done,
    Failed,
    Skipped,
    Suspended,
    PartiallyDone,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::ToDo => "to-do",
            MigrationStatus::Started => "started",
            MigrationStatus::Done => "done",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Skipped => "skipped",
            MigrationStatus::Suspended => "suspended",
            MigrationStatus::PartiallyDone => "partially-done",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "to-do" | "todo" => Ok(MigrationStatus::ToDo),
            "started" => Ok(MigrationStatus::Started),
            "done" => Ok(MigrationStatus::Done),
            "failed" => Ok(MigrationStatus::Failed),
            "skipped" => Ok(MigrationStatus::Skipped),
            "suspended" => Ok(MigrationStatus::Suspended),
            "partially-done" | "partially_done" => Ok(MigrationStatus::PartiallyDone),
            other => Err(format!("Unknown migration status '{}'", other)),
        }
    }
}

/// Durable record of an attempted application of a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Migration {
    pub name: String,
    /// Hash of the source the record was last started from
    pub content_hash: String,
    pub path: String,
    pub execution_date: Option<DateTime<Utc>>,
    pub status: MigrationStatus,
    #[serde(default)]
    pub status_message: String,
}

impl Migration {
    /// Copy of this record carrying a new status and message
    pub fn with_status(&self, status: MigrationStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            status_message: message.into(),
            ..self.clone()
        }
    }
}

/// The migration table stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationTable {
    /// Schema version for future migrations of the file itself
    pub schema_version: u32,

    /// When the table was last modified
    pub updated_at: String,

    /// Map of migration name -> record
    pub migrations: BTreeMap<String, Migration>,
}

impl MigrationTable {
    pub fn new() -> Self {
        Self {
            schema_version: 1,
            updated_at: crate::utils::now_iso(),
            migrations: BTreeMap::new(),
        }
    }
}

impl Default for MigrationTable {
    fn default() -> Self {
        Self::new()
    }
}
