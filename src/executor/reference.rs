use super::support::{action, required_string, resolved_param, should_skip};
use super::{Executor, MigrationGenerator, StepError, StepOutcome, StepScope};
use crate::definition::MigrationStep;
use crate::reference::{display_value, ReferenceResolver};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;

const ACTIONS: &[&str] = &["set", "load", "dump"];

/// Manipulates the reference store directly: `set`, `load` from file, `dump`
pub struct ReferenceExecutor {
    /// Directory relative `load` paths are resolved against
    base_dir: PathBuf,
}

impl ReferenceExecutor {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn set(&self, step: &MigrationStep, scope: &mut StepScope<'_>) -> Result<Value, StepError> {
        let identifier = required_string(step, scope.references, "identifier")?;
        let value = resolved_param(step, scope.references, "value")?.ok_or_else(|| {
            StepError::InvalidStepDefinition("missing 'value' for setting a reference".to_string())
        })?;
        let overwrite = step
            .param("overwrite")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        scope
            .references
            .add_reference(&identifier, value.clone(), overwrite)?;
        Ok(value)
    }

    async fn load(&self, step: &MigrationStep, scope: &mut StepScope<'_>) -> Result<Value, StepError> {
        let file = required_string(step, scope.references, "file")?;
        let path = crate::utils::resolve_path(&self.base_dir, Path::new(&file));
        let content = fs::read_to_string(&path).await?;

        let data: Value = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("yml") | Some("yaml") => serde_yaml::from_str(&content)?,
            _ => {
                return Err(StepError::InvalidStepDefinition(format!(
                    "unsupported reference file format '{}'",
                    path.display()
                )))
            }
        };

        let Value::Object(entries) = data else {
            return Err(StepError::InvalidStepDefinition(format!(
                "reference file '{}' must contain a mapping",
                path.display()
            )));
        };

        let overwrite = step
            .param("overwrite")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        for (name, value) in &entries {
            scope.references.add_reference(name, value.clone(), overwrite)?;
        }
        Ok(Value::Object(entries))
    }

    fn dump(&self, step: &MigrationStep, scope: &mut StepScope<'_>) -> Result<Value, StepError> {
        // Names the reference itself, so it is not resolved
        let identifier = step
            .param("identifier")
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::InvalidStepDefinition("missing 'identifier'".to_string()))?;
        let name = identifier
            .strip_prefix(crate::reference::REFERENCE_PREFIX)
            .unwrap_or(identifier);
        let value = scope.references.get_reference(name)?.clone();

        let label = step
            .param("label")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}: ", name));
        scope.write_line(&format!("{}{}", label, display_value(&value)));
        Ok(value)
    }
}

#[async_trait]
impl Executor for ReferenceExecutor {
    fn supported_types(&self) -> Vec<String> {
        vec!["reference".to_string()]
    }

    async fn execute(
        &self,
        step: &MigrationStep,
        scope: &mut StepScope<'_>,
    ) -> Result<StepOutcome, StepError> {
        let mode = action(step, ACTIONS)?;
        if should_skip(step, scope.references)? {
            return Ok(StepOutcome::Skipped);
        }

        let value = match mode {
            "set" => self.set(step, scope)?,
            "load" => self.load(step, scope).await?,
            _ => self.dump(step, scope)?,
        };
        Ok(StepOutcome::Completed(value))
    }

    fn as_generator(&self) -> Option<&dyn MigrationGenerator> {
        Some(self)
    }
}

#[async_trait]
impl MigrationGenerator for ReferenceExecutor {
    async fn generate_migration(
        &self,
        conditions: &Value,
        mode: &str,
        references: &ReferenceResolver,
    ) -> Result<Vec<Value>, StepError> {
        if mode != "create" {
            return Err(StepError::InvalidStepDefinition(format!(
                "can not generate reference steps in mode '{}'",
                mode
            )));
        }

        let names: Vec<String> = match conditions {
            Value::Object(map) if map.get("all").and_then(Value::as_bool) == Some(true) => {
                references.list_references().keys().cloned().collect()
            }
            Value::Object(map) => match map.get("identifier") {
                Some(Value::String(name)) => vec![name.clone()],
                Some(Value::Array(names)) => names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => {
                    return Err(StepError::InvalidStepDefinition(
                        "references can only be matched by 'identifier' or 'all'".to_string(),
                    ))
                }
            },
            _ => {
                return Err(StepError::InvalidStepDefinition(
                    "match conditions must be a mapping".to_string(),
                ))
            }
        };

        names
            .into_iter()
            .map(|name| -> Result<Value, StepError> {
                let value = references.get_reference(&name)?.clone();
                let mut step = Map::new();
                step.insert("type".to_string(), json!("reference"));
                step.insert("mode".to_string(), json!("set"));
                step.insert("identifier".to_string(), json!(name));
                step.insert("value".to_string(), value);
                Ok(Value::Object(step))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Lines(Mutex<Vec<String>>);

    impl super::super::OutputSink for Lines {
        fn write_line(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    #[tokio::test]
    async fn test_set_then_dump() {
        let executor = ReferenceExecutor::new(PathBuf::from("."));
        let mut refs = ReferenceResolver::new();
        let lines = Lines::default();

        let set = MigrationStep::new("reference", json!({ "mode": "set", "identifier": "foo", "value": 42 }));
        let dump = MigrationStep::new("reference", json!({ "mode": "dump", "identifier": "reference:foo" }));

        let mut scope = StepScope::new(&mut refs).with_output(Some(&lines));
        assert_eq!(
            executor.execute(&set, &mut scope).await.unwrap(),
            StepOutcome::Completed(json!(42))
        );
        executor.execute(&dump, &mut scope).await.unwrap();

        assert_eq!(lines.0.lock().unwrap().as_slice(), ["foo: 42"]);
    }

    #[tokio::test]
    async fn test_set_without_overwrite_fails_on_existing() {
        let executor = ReferenceExecutor::new(PathBuf::from("."));
        let mut refs = ReferenceResolver::new();
        refs.add_reference("foo", json!(1), false).unwrap();

        let step = MigrationStep::new("reference", json!({ "mode": "set", "identifier": "foo", "value": 2 }));
        let result = executor.execute(&step, &mut StepScope::new(&mut refs)).await;
        assert!(matches!(result, Err(StepError::Reference(_))));
    }

    #[tokio::test]
    async fn test_load_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("refs.yml"), "a: 1\nb: two\n").unwrap();

        let executor = ReferenceExecutor::new(dir.path().to_path_buf());
        let mut refs = ReferenceResolver::new();
        let step = MigrationStep::new("reference", json!({ "mode": "load", "file": "refs.yml" }));
        executor.execute(&step, &mut StepScope::new(&mut refs)).await.unwrap();

        assert_eq!(refs.get_reference("b").unwrap(), &json!("two"));
    }

    #[tokio::test]
    async fn test_if_condition_skips() {
        let executor = ReferenceExecutor::new(PathBuf::from("."));
        let mut refs = ReferenceResolver::new();
        refs.add_reference("env", json!("dev"), false).unwrap();

        let step = MigrationStep::new(
            "reference",
            json!({ "mode": "set", "identifier": "x", "value": 1, "if": { "reference:env": { "eq": "prod" } } }),
        );
        let outcome = executor.execute(&step, &mut StepScope::new(&mut refs)).await.unwrap();
        assert_eq!(outcome, StepOutcome::Skipped);
        assert!(!refs.has_reference("x"));
    }

    #[tokio::test]
    async fn test_generate_set_steps() {
        let executor = ReferenceExecutor::new(PathBuf::from("."));
        let mut refs = ReferenceResolver::new();
        refs.add_reference("a", json!(1), false).unwrap();
        refs.add_reference("b", json!("x"), false).unwrap();

        let steps = executor
            .generate_migration(&json!({ "all": true }), "create", &refs)
            .await
            .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1]["identifier"], json!("b"));
        assert_eq!(steps[1]["mode"], json!("set"));

        assert!(executor
            .generate_migration(&json!({ "all": true }), "delete", &refs)
            .await
            .is_err());
    }
}
