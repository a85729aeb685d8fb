use handlebars::Handlebars;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

use super::types::{MigrationFormat, MigrationTemplateContext};
use crate::utils::{now_iso, sanitize_file_name};

const YAML_TEMPLATE: &str = "\
# Migration '{{name}}', generated on {{created_at}}
{{#if steps}}
{{{steps}}}
{{else}}
-
    type: reference
    mode: set
    identifier: example
    value: 1
{{/if}}";

const JSON_TEMPLATE: &str = "\
{{#if steps}}
{{{steps}}}
{{else}}
[
    {
        \"type\": \"reference\",
        \"mode\": \"set\",
        \"identifier\": \"example\",
        \"value\": 1
    }
]
{{/if}}";

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Template error: {0}")]
    TemplateError(#[from] handlebars::TemplateError),

    #[error("Render error: {0}")]
    RenderError(#[from] handlebars::RenderError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Migration file '{0}' already exists")]
    AlreadyExists(String),
}

/// Renders migration skeletons, optionally filled with generated steps
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

impl TemplateEngine {
    pub fn new() -> Result<Self, TemplateError> {
        let mut handlebars = Handlebars::new();
        handlebars.register_template_string(MigrationFormat::Yaml.template_name(), YAML_TEMPLATE)?;
        handlebars.register_template_string(MigrationFormat::Json.template_name(), JSON_TEMPLATE)?;
        Ok(Self { handlebars })
    }

    /// Replace a built-in template with `<template name>.hbs` from `dir`, if present
    pub async fn load_overrides(&mut self, dir: &Path) -> Result<(), TemplateError> {
        for format in [MigrationFormat::Yaml, MigrationFormat::Json] {
            let path = dir.join(format!("{}.hbs", format.template_name()));
            if path.exists() {
                let content = fs::read_to_string(&path).await?;
                self.handlebars
                    .register_template_string(format.template_name(), content)?;
            }
        }
        Ok(())
    }

    /// Serialize steps the way the format expects them
    pub fn serialize_steps(format: MigrationFormat, steps: &[Value]) -> Result<String, TemplateError> {
        if steps.is_empty() {
            return Ok(String::new());
        }
        let body = match format {
            MigrationFormat::Yaml => serde_yaml::to_string(steps)?,
            MigrationFormat::Json => serde_json::to_string_pretty(steps)?,
        };
        Ok(body.trim_end().to_string())
    }

    pub fn render_migration(
        &self,
        format: MigrationFormat,
        name: &str,
        steps: &[Value],
    ) -> Result<String, TemplateError> {
        let context = MigrationTemplateContext {
            name: name.to_string(),
            created_at: now_iso(),
            steps: Self::serialize_steps(format, steps)?,
        };

        let rendered = self.handlebars.render(format.template_name(), &context)?;
        Ok(format!("{}\n", rendered.trim()))
    }

    /// `<timestamp>_<name>.<ext>`
    pub fn migration_file_name(name: &str, format: MigrationFormat) -> String {
        format!(
            "{}_{}.{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S"),
            sanitize_file_name(name),
            format.extension()
        )
    }

    /// Render and write a new migration file into `dir`, returning its path
    pub async fn write_migration(
        &self,
        dir: &Path,
        format: MigrationFormat,
        name: &str,
        steps: &[Value],
    ) -> Result<PathBuf, TemplateError> {
        let content = self.render_migration(format, name, steps)?;
        let path = dir.join(Self::migration_file_name(name, format));
        if path.exists() {
            return Err(TemplateError::AlreadyExists(path.display().to_string()));
        }

        fs::create_dir_all(dir).await?;
        fs::write(&path, content).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{
        DefinitionParser, DefinitionStatus, JsonDefinitionParser, MigrationDefinition,
        YamlDefinitionParser,
    };
    use serde_json::json;

    fn parse(parser: &dyn DefinitionParser, name: &str, raw: String) -> MigrationDefinition {
        parser.parse_migration_definition(MigrationDefinition::unparsed(name, PathBuf::from(name), raw))
    }

    #[test]
    fn test_skeletons_parse() {
        let engine = TemplateEngine::new().unwrap();

        let yaml = engine.render_migration(MigrationFormat::Yaml, "users", &[]).unwrap();
        assert!(yaml.starts_with("# Migration 'users'"));
        let parsed = parse(&YamlDefinitionParser, "a.yml", yaml);
        assert_eq!(parsed.status, DefinitionStatus::Valid);

        let json = engine.render_migration(MigrationFormat::Json, "users", &[]).unwrap();
        let parsed = parse(&JsonDefinitionParser, "a.json", json);
        assert_eq!(parsed.status, DefinitionStatus::Valid);
        assert_eq!(parsed.steps[0].step_type, "reference");
    }

    #[test]
    fn test_generated_steps_are_embedded() {
        let engine = TemplateEngine::new().unwrap();
        let steps = vec![json!({ "type": "record", "mode": "create", "identifier": "a&b" })];

        for (format, parser) in [
            (MigrationFormat::Yaml, &YamlDefinitionParser as &dyn DefinitionParser),
            (MigrationFormat::Json, &JsonDefinitionParser as &dyn DefinitionParser),
        ] {
            let rendered = engine.render_migration(format, "gen", &steps).unwrap();
            let parsed = parse(parser, &format!("gen.{}", format.extension()), rendered);
            assert_eq!(parsed.status, DefinitionStatus::Valid);
            assert_eq!(parsed.steps[0].param("identifier"), Some(&json!("a&b")));
        }
    }

    #[test]
    fn test_migration_file_name() {
        let name = TemplateEngine::migration_file_name("add users", MigrationFormat::Yaml);
        assert!(name.ends_with("_add_users.yml"));
        assert_eq!(name.len(), "20240101120000_add_users.yml".len());
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("YML".parse::<MigrationFormat>().unwrap(), MigrationFormat::Yaml);
        assert!("php".parse::<MigrationFormat>().is_err());
    }

    #[tokio::test]
    async fn test_write_migration() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TemplateEngine::new().unwrap();
        let path = engine
            .write_migration(&dir.path().join("migrations"), MigrationFormat::Json, "x", &[])
            .await
            .unwrap();
        assert!(path.exists());
    }
}
