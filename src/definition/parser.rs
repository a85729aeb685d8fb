use super::types::{MigrationDefinition, MigrationStep};
use serde_json::Value;

/// Turns a raw definition into an ordered list of typed steps.
///
/// Parsers never fail: a source they can not make sense of comes back as an
/// `Invalid` definition carrying the reason.
pub trait DefinitionParser: Send + Sync {
    /// Whether this parser handles the migration with the given (file) name
    fn supports(&self, migration_name: &str) -> bool;

    fn parse_migration_definition(&self, definition: MigrationDefinition) -> MigrationDefinition;
}

/// Parser for `.yml` / `.yaml` definitions
#[derive(Debug, Default)]
pub struct YamlDefinitionParser;

impl DefinitionParser for YamlDefinitionParser {
    fn supports(&self, migration_name: &str) -> bool {
        has_extension(migration_name, &["yml", "yaml"])
    }

    fn parse_migration_definition(&self, definition: MigrationDefinition) -> MigrationDefinition {
        match serde_yaml::from_str::<Value>(&definition.raw_definition) {
            Ok(data) => build_definition(definition, data),
            Err(e) => definition.invalid(format!("Invalid YAML: {}", e)),
        }
    }
}

/// Parser for `.json` definitions
#[derive(Debug, Default)]
pub struct JsonDefinitionParser;

impl DefinitionParser for JsonDefinitionParser {
    fn supports(&self, migration_name: &str) -> bool {
        has_extension(migration_name, &["json"])
    }

    fn parse_migration_definition(&self, definition: MigrationDefinition) -> MigrationDefinition {
        match serde_json::from_str::<Value>(&definition.raw_definition) {
            Ok(data) => build_definition(definition, data),
            Err(e) => definition.invalid(format!("Invalid JSON: {}", e)),
        }
    }
}

fn has_extension(name: &str, extensions: &[&str]) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Shared shape validation: a list of mappings, each carrying a string `type`
fn build_definition(definition: MigrationDefinition, data: Value) -> MigrationDefinition {
    let items = match data {
        Value::Array(items) => items,
        _ => return definition.invalid("Migration definition is not a list of steps"),
    };

    let mut steps = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        let mut dsl = match item {
            Value::Object(map) => map,
            _ => {
                return definition.invalid(format!("Step {} of the migration is not a mapping", i + 1))
            }
        };
        let step_type = match dsl.remove("type") {
            Some(Value::String(t)) if !t.is_empty() => t,
            _ => {
                return definition
                    .invalid(format!("Step {} of the migration has no valid 'type'", i + 1))
            }
        };
        steps.push(MigrationStep::new(step_type, Value::Object(dsl)));
    }

    definition.valid(steps)
}
