#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use stepwise_migrations::{
    Backend, BackendCapabilities, BackendError, BeforeStepExecution, Executor, FileContextHandler,
    FilesystemLoader, JsonDefinitionParser, JsonStorageHandler, Migration, MigrationDefinition,
    MigrationListener, MigrationService, MigrationStatus, MigrationStep, StepError, StepOutcome,
    StepScope, YamlDefinitionParser,
};
use tempfile::TempDir;

pub fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Should create temp dir")
}

/// Backend that only records the calls it receives
pub struct RecordingBackend {
    calls: Mutex<Vec<String>>,
    capabilities: BackendCapabilities,
    commit_error: Mutex<Option<BackendError>>,
    rollback_error: Mutex<Option<BackendError>>,
    user: Mutex<Option<String>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            capabilities: BackendCapabilities::default(),
            commit_error: Mutex::new(None),
            rollback_error: Mutex::new(None),
            user: Mutex::new(Some("anonymous".to_string())),
        }
    }

    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn failing_commit(self, error: BackendError) -> Self {
        *self.commit_error.lock().unwrap() = Some(error);
        self
    }

    pub fn failing_rollback(self, error: BackendError) -> Self {
        *self.rollback_error.lock().unwrap() = Some(error);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn begin_transaction(&self) -> Result<(), BackendError> {
        self.record("begin");
        Ok(())
    }

    async fn commit(&self) -> Result<(), BackendError> {
        self.record("commit");
        match self.commit_error.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn rollback(&self) -> Result<(), BackendError> {
        self.record("rollback");
        match self.rollback_error.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn current_user(&self) -> Result<Option<String>, BackendError> {
        self.record("current_user");
        Ok(self.user.lock().unwrap().clone())
    }

    async fn authenticate_as(&self, login: &str) -> Result<(), BackendError> {
        self.record(format!("authenticate:{}", login));
        *self.user.lock().unwrap() = Some(login.to_string());
        Ok(())
    }
}

/// Executor for step type `test`, driven by the step's `do` parameter:
/// `complete` (default), `skip`, `abort`, `suspend` (unless reference
/// `resume_ok` exists), `fail`, `invalid`, `set` (writes `references`)
pub struct ScriptedExecutor {
    raw_sql: bool,
    calls: Mutex<Vec<(u64, Value)>>,
    resets: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            raw_sql: false,
            calls: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
        }
    }

    pub fn raw_sql() -> Self {
        Self {
            raw_sql: true,
            ..Self::new()
        }
    }

    /// Step indexes dispatched so far
    pub fn dispatched(&self) -> Vec<u64> {
        self.calls.lock().unwrap().iter().map(|(i, _)| *i).collect()
    }

    /// Parameters (references resolved) of every dispatched step
    pub fn parameters(&self) -> Vec<Value> {
        self.calls.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn supported_types(&self) -> Vec<String> {
        vec!["test".to_string()]
    }

    async fn execute(
        &self,
        step: &MigrationStep,
        scope: &mut StepScope<'_>,
    ) -> Result<StepOutcome, StepError> {
        let dsl = scope.references.resolve_references_recursively(&step.dsl)?;
        self.calls
            .lock()
            .unwrap()
            .push((step.index().unwrap_or(0), dsl.clone()));

        let message = dsl
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match dsl.get("do").and_then(Value::as_str).unwrap_or("complete") {
            "skip" => Ok(StepOutcome::Skipped),
            "abort" => Ok(StepOutcome::Aborted {
                status: dsl
                    .get("status")
                    .and_then(Value::as_str)
                    .map(|s| s.parse::<MigrationStatus>().unwrap())
                    .unwrap_or(MigrationStatus::Done),
                message,
            }),
            "suspend" if !scope.references.has_reference("resume_ok") => {
                Ok(StepOutcome::Suspended { message })
            }
            "fail" => Err(StepError::Backend(BackendError::Driver(message))),
            "invalid" => Err(StepError::Backend(BackendError::Validation {
                message,
                issues: vec![stepwise_migrations::ValidationIssue::new("Field 'name' is too long")
                    .with_value("max", "10")],
            })),
            "set" => {
                if let Some(references) = dsl.get("references").and_then(Value::as_object) {
                    for (name, value) in references {
                        scope.references.add_reference(name, value.clone(), false)?;
                    }
                }
                Ok(StepOutcome::Completed(dsl))
            }
            _ => Ok(StepOutcome::Completed(dsl)),
        }
    }

    fn runs_raw_sql(&self) -> bool {
        self.raw_sql
    }

    fn reset_transaction(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl MigrationListener for RecordingListener {
    fn before_step_execution(&self, event: &mut BeforeStepExecution) -> Result<(), StepError> {
        self.record(format!("before:{}", event.step().index().unwrap_or(0)));
        Ok(())
    }

    fn step_executed(&self, step: &MigrationStep, _result: &Value) {
        self.record(format!("executed:{}", step.index().unwrap_or(0)));
    }

    fn migration_aborted(&self, step: &MigrationStep, status: MigrationStatus, _message: &str) {
        self.record(format!("aborted:{}:{}", step.index().unwrap_or(0), status));
    }

    fn migration_suspended(&self, step: &MigrationStep, _message: &str) {
        self.record(format!("suspended:{}", step.index().unwrap_or(0)));
    }
}

/// A service over a temp dir, a recording backend and the scripted executor
pub struct Harness {
    pub dir: TempDir,
    pub backend: Arc<RecordingBackend>,
    pub executor: Arc<ScriptedExecutor>,
    pub listener: Arc<RecordingListener>,
    pub service: MigrationService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_parts(RecordingBackend::new(), ScriptedExecutor::new())
    }

    pub fn with_parts(backend: RecordingBackend, executor: ScriptedExecutor) -> Self {
        let dir = create_test_dir();
        let backend = Arc::new(backend);
        let executor = Arc::new(executor);
        let listener = Arc::new(RecordingListener::default());

        let mut service = MigrationService::new(
            Arc::new(FilesystemLoader::new(vec![dir.path().join("migrations")])),
            Arc::new(JsonStorageHandler::new(dir.path().join("state/migrations.json"))),
            backend.clone(),
            Arc::new(FileContextHandler::new(dir.path().join("state/context"))),
        );
        service.add_definition_parser(Arc::new(YamlDefinitionParser));
        service.add_definition_parser(Arc::new(JsonDefinitionParser));
        service.add_executor(executor.clone());
        service.add_listener(listener.clone());

        Self {
            dir,
            backend,
            executor,
            listener,
            service,
        }
    }

    pub fn migrations_dir(&self) -> PathBuf {
        self.dir.path().join("migrations")
    }

    pub fn context_file(&self, name: &str) -> PathBuf {
        self.dir.path().join("state/context").join(format!("{}.json", name))
    }

    pub fn write_migration(&self, name: &str, content: &str) -> PathBuf {
        std::fs::create_dir_all(self.migrations_dir()).expect("Should create migrations dir");
        let path = self.migrations_dir().join(name);
        std::fs::write(&path, content).expect("Should write migration");
        path
    }

    /// The unparsed definition stored at `name`
    pub async fn definition(&self, name: &str) -> MigrationDefinition {
        let path = self.migrations_dir().join(name);
        self.service
            .get_migrations_definitions(&[path])
            .await
            .expect("Should list definitions")
            .into_iter()
            .next()
            .expect("Should find definition")
    }

    pub async fn record(&self, name: &str) -> Migration {
        self.service
            .get_migration(name)
            .await
            .expect("Should load migration")
            .expect("Migration should be recorded")
    }
}
