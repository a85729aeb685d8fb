use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Source format of a generated migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationFormat {
    Yaml,
    Json,
}

impl MigrationFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            MigrationFormat::Yaml => "yml",
            MigrationFormat::Json => "json",
        }
    }

    /// Name of the built-in template, and of the override file `<name>.hbs`
    pub fn template_name(&self) -> &'static str {
        match self {
            MigrationFormat::Yaml => "migration.yml",
            MigrationFormat::Json => "migration.json",
        }
    }
}

impl fmt::Display for MigrationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MigrationFormat::Yaml => "yaml",
            MigrationFormat::Json => "json",
        })
    }
}

impl FromStr for MigrationFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(MigrationFormat::Yaml),
            "json" => Ok(MigrationFormat::Json),
            other => Err(format!("Unsupported migration format '{}'", other)),
        }
    }
}

/// Context for migration templates
/// Placeholders: {{name}}, {{created_at}}, {{steps}} (pre-serialized, may be empty)
#[derive(Debug, Clone, Serialize)]
pub struct MigrationTemplateContext {
    pub name: String,
    pub created_at: String,
    pub steps: String,
}
