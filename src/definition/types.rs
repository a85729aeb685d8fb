use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

/// Parse state of a migration definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefinitionStatus {
    ToParse,
    Valid,
    Invalid,
}

impl fmt::Display for DefinitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DefinitionStatus::ToParse => "to-parse",
            DefinitionStatus::Valid => "valid",
            DefinitionStatus::Invalid => "invalid",
        };
        f.write_str(label)
    }
}

/// One declarative action within a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStep {
    /// Selects the executor
    #[serde(rename = "type")]
    pub step_type: String,

    /// Parsed per-step parameters
    pub dsl: Value,

    /// Execution-time variables merged in right before dispatch
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl MigrationStep {
    pub fn new(step_type: impl Into<String>, dsl: Value) -> Self {
        Self {
            step_type: step_type.into(),
            dsl,
            context: Map::new(),
        }
    }

    /// Build a new step carrying `context` merged over the existing one
    pub fn with_context(&self, context: &Map<String, Value>) -> Self {
        let mut merged = self.context.clone();
        for (key, value) in context {
            merged.insert(key.clone(), value.clone());
        }
        Self {
            step_type: self.step_type.clone(),
            dsl: self.dsl.clone(),
            context: merged,
        }
    }

    /// Look up a top-level parameter
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.dsl.get(key)
    }

    /// 1-based index of this step in its migration, once injected
    pub fn index(&self) -> Option<u64> {
        self.context.get("step").and_then(Value::as_u64)
    }
}

/// Parsed, ordered list of steps sourced from one input artifact
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationDefinition {
    /// Unique name, derived from the source file name
    pub name: String,
    pub path: PathBuf,
    pub raw_definition: String,
    pub status: DefinitionStatus,
    pub steps: Vec<MigrationStep>,
    /// Set iff the status is `Invalid`
    pub parsing_error: Option<String>,
}

impl MigrationDefinition {
    /// A definition that still has to go through a parser
    pub fn unparsed(name: impl Into<String>, path: PathBuf, raw_definition: String) -> Self {
        Self {
            name: name.into(),
            path,
            raw_definition,
            status: DefinitionStatus::ToParse,
            steps: Vec::new(),
            parsing_error: None,
        }
    }

    pub fn valid(self, steps: Vec<MigrationStep>) -> Self {
        Self {
            status: DefinitionStatus::Valid,
            steps,
            parsing_error: None,
            ..self
        }
    }

    pub fn invalid(self, error: impl Into<String>) -> Self {
        Self {
            status: DefinitionStatus::Invalid,
            steps: Vec::new(),
            parsing_error: Some(error.into()),
            ..self
        }
    }

    pub fn is_parsed(&self) -> bool {
        self.status != DefinitionStatus::ToParse
    }
}
