use super::support::{
    expected_results, flag, set_references, should_skip, validate_results_count, ExpectedResults,
};
use super::{Executor, StepError, StepOutcome, StepScope};
use crate::backend::BackendError;
use crate::definition::MigrationStep;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

const ACTIONS: &[&str] = &["exec", "query"];
const SCALAR_REFERENCES: &[&str] = &["count", "affected_rows"];

/// Raw SQL access to the backend's database
#[async_trait]
pub trait SqlConnection: Send + Sync {
    /// Lower-case kind of database (`mysql`, `postgresql`, `sqlite`...),
    /// used to pick the statement out of the step
    fn database_kind(&self) -> String;

    /// Run a statement, returning the number of affected rows
    async fn exec(&self, sql: &str) -> Result<u64, BackendError>;

    async fn query(&self, sql: &str) -> Result<Vec<Map<String, Value>>, BackendError>;

    /// Forget the transaction nesting level the driver believes is open
    fn reset_transaction_nesting(&self);
}

/// Runs raw SQL statements (step type `sql`)
pub struct SqlExecutor {
    connection: Arc<dyn SqlConnection>,
}

impl SqlExecutor {
    pub fn new(connection: Arc<dyn SqlConnection>) -> Self {
        Self { connection }
    }

    fn statement(&self, step: &MigrationStep, scope: &StepScope<'_>) -> Result<String, StepError> {
        let kind = self.connection.database_kind();
        let sql = step.param(&kind).and_then(Value::as_str).ok_or_else(|| {
            StepError::Execution(format!(
                "Current database type '{}' is not supported by the SQL migration",
                kind
            ))
        })?;

        if flag(step, scope.references, "resolve_references")? {
            return Ok(scope.references.resolve_embedded_references(sql)?);
        }
        Ok(sql.to_string())
    }

    async fn exec(&self, step: &MigrationStep, scope: &mut StepScope<'_>) -> Result<Value, StepError> {
        let sql = self.statement(step, scope)?;
        let affected = self.connection.exec(&sql).await?;

        set_references(step, scope.references, |definition| match definition.attribute.as_str() {
            "affected_rows" => Ok(json!(affected)),
            other => Err(StepError::InvalidStepDefinition(format!(
                "Sql Executor does not support setting references for attribute {}",
                other
            ))),
        })?;
        Ok(json!(affected))
    }

    async fn query(&self, step: &MigrationStep, scope: &mut StepScope<'_>) -> Result<Value, StepError> {
        let sql = self.statement(step, scope)?;
        let expected = expected_results(step, SCALAR_REFERENCES)?;
        let single = expected == ExpectedResults::One;

        let rows = self.connection.query(&sql).await?;
        if single && rows.len() > 1 {
            return Err(StepError::InvalidMatchResultsNumber(
                "Found two (or more) results but expect only one".to_string(),
            ));
        }
        validate_results_count(rows.len(), expected)?;

        set_references(step, scope.references, |definition| {
            let attribute = definition.attribute.as_str();
            if attribute == "count" {
                return Ok(json!(rows.len()));
            }

            let column = attribute.strip_prefix("results.").ok_or_else(|| {
                StepError::InvalidStepDefinition(format!(
                    "Sql Executor does not support setting references for attribute {}",
                    attribute
                ))
            })?;
            if rows.is_empty() {
                return Ok(json!([]));
            }

            let values = rows
                .iter()
                .map(|row| {
                    row.get(column).cloned().ok_or_else(|| {
                        StepError::InvalidStepDefinition(format!(
                            "Sql Executor does not support setting references for attribute {}",
                            attribute
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            if single {
                return Ok(values.into_iter().next().unwrap_or(Value::Null));
            }
            Ok(Value::Array(values))
        })?;

        Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
    }
}

#[async_trait]
impl Executor for SqlExecutor {
    fn supported_types(&self) -> Vec<String> {
        vec!["sql".to_string()]
    }

    async fn execute(
        &self,
        step: &MigrationStep,
        scope: &mut StepScope<'_>,
    ) -> Result<StepOutcome, StepError> {
        // Steps written before `mode` existed are plain statements
        let mode = match step.param("mode") {
            None => "exec",
            Some(_) => super::support::action(step, ACTIONS)?,
        };
        if should_skip(step, scope.references)? {
            return Ok(StepOutcome::Skipped);
        }

        let value = match mode {
            "exec" => self.exec(step, scope).await?,
            _ => self.query(step, scope).await?,
        };
        Ok(StepOutcome::Completed(value))
    }

    fn runs_raw_sql(&self) -> bool {
        true
    }

    fn reset_transaction(&self) {
        self.connection.reset_transaction_nesting();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceResolver;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeConnection {
        statements: Mutex<Vec<String>>,
        rows: Vec<Map<String, Value>>,
        reset: AtomicBool,
    }

    #[async_trait]
    impl SqlConnection for FakeConnection {
        fn database_kind(&self) -> String {
            "sqlite".to_string()
        }

        async fn exec(&self, sql: &str) -> Result<u64, BackendError> {
            self.statements.lock().unwrap().push(sql.to_string());
            Ok(3)
        }

        async fn query(&self, sql: &str) -> Result<Vec<Map<String, Value>>, BackendError> {
            self.statements.lock().unwrap().push(sql.to_string());
            Ok(self.rows.clone())
        }

        fn reset_transaction_nesting(&self) {
            self.reset.store(true, Ordering::SeqCst);
        }
    }

    fn row(id: i64, name: &str) -> Map<String, Value> {
        match json!({ "id": id, "name": name }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    async fn run(
        connection: Arc<FakeConnection>,
        refs: &mut ReferenceResolver,
        dsl: Value,
    ) -> Result<StepOutcome, StepError> {
        let executor = SqlExecutor::new(connection);
        let step = MigrationStep::new("sql", dsl);
        executor.execute(&step, &mut StepScope::new(refs)).await
    }

    #[tokio::test]
    async fn test_exec_with_embedded_references() {
        let connection = Arc::new(FakeConnection::default());
        let mut refs = ReferenceResolver::new();
        refs.add_reference("table", json!("users"), false).unwrap();

        run(connection.clone(), &mut refs, json!({
            "sqlite": "DELETE FROM [reference:table]",
            "resolve_references": true,
            "references": { "deleted": "affected_rows" }
        }))
        .await
        .unwrap();

        assert_eq!(connection.statements.lock().unwrap()[0], "DELETE FROM users");
        assert_eq!(refs.get_reference("deleted").unwrap(), &json!(3));
    }

    #[tokio::test]
    async fn test_unsupported_database_kind() {
        let connection = Arc::new(FakeConnection::default());
        let mut refs = ReferenceResolver::new();
        let result = run(connection, &mut refs, json!({ "mysql": "SELECT 1" })).await;
        assert!(matches!(result, Err(StepError::Execution(_))));
    }

    #[tokio::test]
    async fn test_query_references() {
        let connection = Arc::new(FakeConnection {
            rows: vec![row(1, "a"), row(2, "b")],
            ..Default::default()
        });
        let mut refs = ReferenceResolver::new();

        run(connection.clone(), &mut refs, json!({
            "mode": "query", "sqlite": "SELECT id, name FROM t", "expect": "many",
            "references": { "n": "count", "names": "results.name" }
        }))
        .await
        .unwrap();
        assert_eq!(refs.get_reference("n").unwrap(), &json!(2));
        assert_eq!(refs.get_reference("names").unwrap(), &json!(["a", "b"]));

        let single = run(connection, &mut refs, json!({
            "mode": "query", "sqlite": "SELECT id FROM t",
            "references": { "id": "results.id" }
        }))
        .await;
        assert!(matches!(single, Err(StepError::InvalidMatchResultsNumber(_))));
    }

    #[test]
    fn test_declares_raw_sql_and_resets_nesting() {
        let connection = Arc::new(FakeConnection::default());
        let executor = SqlExecutor::new(connection.clone());
        assert!(executor.runs_raw_sql());
        executor.reset_transaction();
        assert!(connection.reset.load(Ordering::SeqCst));
    }
}
