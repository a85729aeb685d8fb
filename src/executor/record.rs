use super::support::{
    action, expected_results, match_conditions, resolved_param, set_references, should_skip,
    validate_results_count, ExpectedResults, ReferenceDefinition,
};
use super::{Executor, MigrationGenerator, StepError, StepOutcome, StepScope};
use crate::backend::{Record, RecordStore};
use crate::definition::MigrationStep;
use crate::reference::ReferenceResolver;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

const ACTIONS: &[&str] = &["create", "load", "update", "delete"];
const SCALAR_REFERENCES: &[&str] = &["count", "collection"];

/// Generic create/load/update/delete of identifier + attributes records.
///
/// The collection is the step's `collection` parameter, or the step type.
pub struct RecordExecutor {
    store: Arc<dyn RecordStore>,
    types: Vec<String>,
}

impl RecordExecutor {
    pub fn new(store: Arc<dyn RecordStore>, types: Vec<String>) -> Self {
        Self { store, types }
    }

    fn collection(step: &MigrationStep, references: &ReferenceResolver) -> Result<String, StepError> {
        match resolved_param(step, references, "collection")? {
            Some(Value::String(collection)) => Ok(collection),
            Some(other) => Err(StepError::InvalidStepDefinition(format!(
                "invalid collection {}",
                other
            ))),
            None => Ok(step.step_type.clone()),
        }
    }

    fn attributes(step: &MigrationStep, references: &ReferenceResolver) -> Result<Map<String, Value>, StepError> {
        match resolved_param(step, references, "attributes")? {
            None | Some(Value::Null) => Ok(Map::new()),
            Some(Value::Object(attributes)) => Ok(attributes),
            Some(_) => Err(StepError::InvalidStepDefinition(
                "'attributes' must be a mapping".to_string(),
            )),
        }
    }

    /// Records of `collection` selected by `conditions`
    async fn match_records(
        &self,
        collection: &str,
        conditions: &Value,
        tolerate_misses: bool,
    ) -> Result<Vec<Record>, StepError> {
        let Value::Object(conditions) = conditions else {
            return Err(StepError::InvalidStepDefinition(
                "match conditions must be a mapping".to_string(),
            ));
        };
        if conditions.len() != 1 {
            return Err(StepError::InvalidStepDefinition(
                "exactly one match condition is supported".to_string(),
            ));
        }

        let (key, value) = conditions
            .iter()
            .next()
            .ok_or_else(|| StepError::InvalidStepDefinition("empty match".to_string()))?;

        match key.as_str() {
            "all" => Ok(self.store.list(collection).await?),
            "identifier" => {
                let identifiers: Vec<String> = match value {
                    Value::Array(ids) => ids.iter().map(crate::reference::display_value).collect(),
                    other => vec![crate::reference::display_value(other)],
                };

                let mut records = Vec::with_capacity(identifiers.len());
                for identifier in identifiers {
                    match self.store.get(collection, &identifier).await? {
                        Some(record) => records.push(record),
                        None if tolerate_misses => {
                            debug!(collection, identifier = %identifier, "Ignoring missing record");
                        }
                        None => {
                            return Err(StepError::NotFound(format!(
                                "Record '{}' not found in collection '{}'",
                                identifier, collection
                            )))
                        }
                    }
                }
                Ok(records)
            }
            "attributes" => {
                let Value::Object(wanted) = value else {
                    return Err(StepError::InvalidStepDefinition(
                        "'attributes' match condition must be a mapping".to_string(),
                    ));
                };
                let records = self.store.list(collection).await?;
                Ok(records
                    .into_iter()
                    .filter(|r| wanted.iter().all(|(k, v)| r.attributes.get(k) == Some(v)))
                    .collect())
            }
            other => Err(StepError::InvalidStepDefinition(format!(
                "records can not be matched by '{}'",
                other
            ))),
        }
    }

    fn reference_value(
        definition: &ReferenceDefinition,
        collection: &str,
        records: &[Record],
        single: bool,
    ) -> Result<Value, StepError> {
        let values: Vec<Value> = match definition.attribute.as_str() {
            "count" => return Ok(json!(records.len())),
            "collection" => return Ok(json!(collection)),
            "identifier" => records.iter().map(|r| json!(r.identifier)).collect(),
            attribute => match attribute.strip_prefix("attributes.") {
                Some(name) => records
                    .iter()
                    .map(|r| r.attributes.get(name).cloned().unwrap_or(Value::Null))
                    .collect(),
                None => {
                    return Err(StepError::InvalidStepDefinition(format!(
                        "Record executor does not support setting references for attribute {}",
                        attribute
                    )))
                }
            },
        };

        if single {
            return Ok(values.into_iter().next().unwrap_or(Value::Null));
        }
        Ok(Value::Array(values))
    }

    /// Check cardinality, then write the step's references
    fn finish(
        step: &MigrationStep,
        scope: &mut StepScope<'_>,
        collection: &str,
        records: &[Record],
    ) -> Result<Value, StepError> {
        let expected = expected_results(step, SCALAR_REFERENCES)?;
        validate_results_count(records.len(), expected)?;

        let single = expected == ExpectedResults::One;
        set_references(step, scope.references, |definition| {
            Self::reference_value(definition, collection, records, single)
        })?;

        Ok(Value::Array(
            records.iter().map(|r| r.to_value(collection)).collect(),
        ))
    }

    async fn create(&self, step: &MigrationStep, scope: &mut StepScope<'_>) -> Result<Value, StepError> {
        let collection = Self::collection(step, scope.references)?;
        let identifier = super::support::required_string(step, scope.references, "identifier")?;
        let attributes = Self::attributes(step, scope.references)?;

        let record = Record::new(identifier, attributes);
        self.store.insert(&collection, record.clone()).await?;
        Self::finish(step, scope, &collection, std::slice::from_ref(&record))?;
        Ok(record.to_value(&collection))
    }

    async fn load(&self, step: &MigrationStep, scope: &mut StepScope<'_>) -> Result<Value, StepError> {
        let collection = Self::collection(step, scope.references)?;
        let (conditions, tolerate) = match_conditions(step, scope.references, "identifier", "load")?;
        let records = self.match_records(&collection, &conditions, tolerate).await?;
        Self::finish(step, scope, &collection, &records)
    }

    async fn update(&self, step: &MigrationStep, scope: &mut StepScope<'_>) -> Result<Value, StepError> {
        let collection = Self::collection(step, scope.references)?;
        let (conditions, tolerate) = match_conditions(step, scope.references, "identifier", "update")?;
        let changes = Self::attributes(step, scope.references)?;

        let mut records = self.match_records(&collection, &conditions, tolerate).await?;
        let expected = expected_results(step, SCALAR_REFERENCES)?;
        validate_results_count(records.len(), expected)?;

        for record in &mut records {
            for (key, value) in &changes {
                record.attributes.insert(key.clone(), value.clone());
            }
            self.store.update(&collection, record.clone()).await?;
        }
        Self::finish(step, scope, &collection, &records)
    }

    async fn delete(&self, step: &MigrationStep, scope: &mut StepScope<'_>) -> Result<Value, StepError> {
        let collection = Self::collection(step, scope.references)?;
        let (conditions, tolerate) = match_conditions(step, scope.references, "identifier", "delete")?;

        let records = self.match_records(&collection, &conditions, tolerate).await?;
        let expected = expected_results(step, SCALAR_REFERENCES)?;
        validate_results_count(records.len(), expected)?;

        for record in &records {
            self.store.delete(&collection, &record.identifier).await?;
        }
        Self::finish(step, scope, &collection, &records)
    }
}

#[async_trait]
impl Executor for RecordExecutor {
    fn supported_types(&self) -> Vec<String> {
        self.types.clone()
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
            "create" => self.create(step, scope).await?,
            "load" => self.load(step, scope).await?,
            "update" => self.update(step, scope).await?,
            _ => self.delete(step, scope).await?,
        };
        Ok(StepOutcome::Completed(value))
    }

    fn as_generator(&self) -> Option<&dyn MigrationGenerator> {
        Some(self)
    }
}

#[async_trait]
impl MigrationGenerator for RecordExecutor {
    async fn generate_migration(
        &self,
        conditions: &Value,
        mode: &str,
        references: &ReferenceResolver,
    ) -> Result<Vec<Value>, StepError> {
        if !["create", "update", "delete"].contains(&mode) {
            return Err(StepError::InvalidStepDefinition(format!(
                "can not generate record steps in mode '{}'",
                mode
            )));
        }

        let step_type = self
            .types
            .first()
            .cloned()
            .unwrap_or_else(|| "record".to_string());

        let mut conditions = references.resolve_references_recursively(conditions)?;
        let collection = match conditions.as_object_mut().and_then(|c| c.remove("collection")) {
            Some(Value::String(collection)) => collection,
            _ => step_type.clone(),
        };

        let records = self.match_records(&collection, &conditions, false).await?;
        Ok(records
            .into_iter()
            .map(|record| {
                let mut step = Map::new();
                step.insert("type".to_string(), json!(step_type));
                step.insert("mode".to_string(), json!(mode));
                if collection != step_type {
                    step.insert("collection".to_string(), json!(collection));
                }
                match mode {
                    "create" => {
                        step.insert("identifier".to_string(), json!(record.identifier));
                        step.insert("attributes".to_string(), Value::Object(record.attributes));
                    }
                    "update" => {
                        step.insert("match".to_string(), json!({ "identifier": record.identifier }));
                        step.insert("attributes".to_string(), Value::Object(record.attributes));
                    }
                    _ => {
                        step.insert("match".to_string(), json!({ "identifier": record.identifier }));
                    }
                }
                Value::Object(step)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DocumentBackend;

    fn executor() -> (RecordExecutor, Arc<DocumentBackend>) {
        let backend = Arc::new(DocumentBackend::in_memory(vec!["admin".to_string()]));
        let store: Arc<dyn RecordStore> = backend.clone();
        (RecordExecutor::new(store, vec!["record".to_string()]), backend)
    }

    async fn run(
        executor: &RecordExecutor,
        refs: &mut ReferenceResolver,
        dsl: Value,
    ) -> Result<StepOutcome, StepError> {
        let step = MigrationStep::new("record", dsl);
        executor.execute(&step, &mut StepScope::new(refs)).await
    }

    #[tokio::test]
    async fn test_create_and_load_with_references() {
        let (executor, _) = executor();
        let mut refs = ReferenceResolver::new();

        run(&executor, &mut refs, json!({
            "mode": "create", "identifier": "jane", "attributes": { "age": 31 },
            "references": { "created": "identifier" }
        }))
        .await
        .unwrap();
        assert_eq!(refs.get_reference("created").unwrap(), &json!("jane"));

        run(&executor, &mut refs, json!({
            "mode": "load", "match": { "identifier": "reference:created" },
            "references": { "age": "attributes.age", "n": "count" }
        }))
        .await
        .unwrap();
        assert_eq!(refs.get_reference("age").unwrap(), &json!(31));
        assert_eq!(refs.get_reference("n").unwrap(), &json!(1));
    }

    #[tokio::test]
    async fn test_load_missing_record() {
        let (executor, _) = executor();
        let mut refs = ReferenceResolver::new();

        let missing = run(&executor, &mut refs, json!({ "mode": "load", "identifier": "ghost" })).await;
        assert!(matches!(missing, Err(StepError::NotFound(_))));

        let tolerated = run(&executor, &mut refs, json!({
            "mode": "load", "identifier": "ghost", "match_tolerate_misses": true,
            "references": { "n": "count" }
        }))
        .await
        .unwrap();
        assert_eq!(tolerated, StepOutcome::Completed(json!([])));
        assert_eq!(refs.get_reference("n").unwrap(), &json!(0));
    }

    #[tokio::test]
    async fn test_update_and_delete_by_attributes() {
        let (executor, backend) = executor();
        let mut refs = ReferenceResolver::new();
        for (id, team) in [("a", "red"), ("b", "red"), ("c", "blue")] {
            run(&executor, &mut refs, json!({
                "mode": "create", "identifier": id, "attributes": { "team": team }
            }))
            .await
            .unwrap();
        }

        run(&executor, &mut refs, json!({
            "mode": "update", "match": { "attributes": { "team": "red" } },
            "attributes": { "active": false }, "expect": "many"
        }))
        .await
        .unwrap();
        let a = backend.get("record", "a").await.unwrap().unwrap();
        assert_eq!(a.attributes.get("active"), Some(&json!(false)));

        let result = run(&executor, &mut refs, json!({
            "mode": "delete", "match": { "attributes": { "team": "red" } }, "expect": "one"
        }))
        .await;
        assert!(matches!(result, Err(StepError::InvalidMatchResultsNumber(_))));

        run(&executor, &mut refs, json!({ "mode": "delete", "match": { "all": true } }))
            .await
            .unwrap();
        assert!(backend.list("record").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generate_create_steps() {
        let (executor, _) = executor();
        let mut refs = ReferenceResolver::new();
        run(&executor, &mut refs, json!({
            "mode": "create", "identifier": "jane", "attributes": { "age": 31 }
        }))
        .await
        .unwrap();

        let steps = executor
            .generate_migration(&json!({ "all": true }), "create", &refs)
            .await
            .unwrap();
        assert_eq!(
            steps,
            vec![json!({ "type": "record", "mode": "create", "identifier": "jane", "attributes": { "age": 31 } })]
        );
    }
}
