//! The migration orchestrator.
//!
//! `MigrationService` drives a definition from parsing to a durable final
//! status: it records the run as started, walks the steps inside one backend
//! transaction, reacts to the outcome of each step, and commits or rolls back.
//! A suspended run keeps its context through the context handler and can be
//! resumed at the step it stopped at.

mod context;
mod errors;

pub use context::{MigrationContext, RESERVED_CONTEXT_KEYS};
pub use errors::{full_error_message, ServiceError};

use crate::backend::{Backend, BackendError};
use crate::context::{ContextHandler, StoredContext};
use crate::definition::{DefinitionParser, DefinitionStatus, Loader, LoaderError, MigrationDefinition};
use crate::events::{BeforeStepExecution, EventDispatcher, MigrationListener};
use crate::executor::{Executor, ExecutorRegistry, OutputSink, StepOutcome, StepScope};
use crate::reference::{display_value, ReferenceResolver};
use crate::storage::{Migration, MigrationStatus, StorageHandler};
use anyhow::anyhow;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Login assumed at commit time when the context names none
pub const DEFAULT_ADMIN_LOGIN: &str = "admin";

/// Mutable position of a run, shared between the step loop and failure handling
#[derive(Default)]
struct RunState {
    /// 1-based index of the current step
    step: usize,
    committing: bool,
    raw_sql_executor: Option<Arc<dyn Executor>>,
}

pub struct MigrationService {
    loader: Arc<dyn Loader>,
    storage: Arc<dyn StorageHandler>,
    backend: Arc<dyn Backend>,
    context_handler: Arc<dyn ContextHandler>,
    parsers: Vec<Arc<dyn DefinitionParser>>,
    executors: ExecutorRegistry,
    dispatcher: EventDispatcher,
    references: ReferenceResolver,
    /// In-flight context of every migration run by this service
    migration_context: HashMap<String, StoredContext>,
    output: Option<Arc<dyn OutputSink>>,
    default_admin_login: String,
}

impl MigrationService {
    pub fn new(
        loader: Arc<dyn Loader>,
        storage: Arc<dyn StorageHandler>,
        backend: Arc<dyn Backend>,
        context_handler: Arc<dyn ContextHandler>,
    ) -> Self {
        Self {
            loader,
            storage,
            backend,
            context_handler,
            parsers: Vec::new(),
            executors: ExecutorRegistry::new(),
            dispatcher: EventDispatcher::new(),
            references: ReferenceResolver::new(),
            migration_context: HashMap::new(),
            output: None,
            default_admin_login: DEFAULT_ADMIN_LOGIN.to_string(),
        }
    }

    pub fn add_definition_parser(&mut self, parser: Arc<dyn DefinitionParser>) {
        self.parsers.push(parser);
    }

    pub fn add_executor(&mut self, executor: Arc<dyn Executor>) {
        self.executors.register(executor);
    }

    pub fn add_listener(&mut self, listener: Arc<dyn MigrationListener>) {
        self.dispatcher.add_listener(listener);
    }

    pub fn set_output(&mut self, output: Arc<dyn OutputSink>) {
        self.output = Some(output);
    }

    pub fn set_default_admin_login(&mut self, login: impl Into<String>) {
        self.default_admin_login = login.into();
    }

    pub fn references(&self) -> &ReferenceResolver {
        &self.references
    }

    pub fn references_mut(&mut self) -> &mut ReferenceResolver {
        &mut self.references
    }

    pub fn get_executor(&self, step_type: &str) -> Result<Arc<dyn Executor>, ServiceError> {
        self.executors.get(step_type).ok_or_else(|| {
            ServiceError::Usage(format!("Executor with type '{}' doesn't exist", step_type))
        })
    }

    pub fn list_executors(&self) -> Vec<String> {
        self.executors.list()
    }

    /// Unparsed definitions found at `paths` (or the loader's defaults) which
    /// some registered parser supports
    pub async fn get_migrations_definitions(
        &self,
        paths: &[PathBuf],
    ) -> Result<Vec<MigrationDefinition>, ServiceError> {
        let available = self.loader.list_available_definitions(paths).await?;
        let handled: Vec<PathBuf> = available
            .into_iter()
            .filter(|(name, _)| self.parsers.iter().any(|p| p.supports(name)))
            .map(|(_, path)| path)
            .collect();

        if handled.is_empty() && !paths.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.loader.load_definitions(&handled).await?)
    }

    pub async fn get_migrations(
        &self,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Migration>, ServiceError> {
        Ok(self.storage.load_migrations(limit, offset).await?)
    }

    pub async fn get_migrations_by_status(
        &self,
        status: MigrationStatus,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Migration>, ServiceError> {
        Ok(self
            .storage
            .load_migrations_by_status(status, limit, offset)
            .await?)
    }

    pub async fn get_migrations_by_paths(
        &self,
        paths: &[String],
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Migration>, ServiceError> {
        Ok(self
            .storage
            .load_migrations_by_paths(paths, limit, offset)
            .await?)
    }

    pub async fn get_migration(&self, name: &str) -> Result<Option<Migration>, ServiceError> {
        Ok(self.storage.load_migration(name).await?)
    }

    pub async fn add_migration(&self, definition: &MigrationDefinition) -> Result<Migration, ServiceError> {
        Ok(self.storage.add_migration(definition).await?)
    }

    pub async fn delete_migration(&self, migration: &Migration) -> Result<(), ServiceError> {
        Ok(self.storage.delete_migration(migration).await?)
    }

    pub async fn skip_migration(&self, definition: &MigrationDefinition) -> Result<Migration, ServiceError> {
        Ok(self.storage.skip_migration(definition).await?)
    }

    /// Low-level: prefer `execute_migration`
    pub async fn end_migration(&self, migration: &Migration) -> Result<(), ServiceError> {
        Ok(self.storage.end_migration(migration, false).await?)
    }

    /// Low-level: marks the record failed whatever its current status
    pub async fn fail_migration(&self, migration: &Migration, message: &str) -> Result<(), ServiceError> {
        let failed = migration.with_status(MigrationStatus::Failed, message);
        Ok(self.storage.end_migration(&failed, true).await?)
    }

    /// Parse with the first parser supporting the definition's name, then
    /// check that every step type has an executor. Definitions the loader
    /// already marked invalid are returned as they are.
    pub fn parse_migration_definition(
        &self,
        definition: MigrationDefinition,
    ) -> Result<MigrationDefinition, ServiceError> {
        if definition.status == DefinitionStatus::Invalid {
            return Ok(definition);
        }

        let parser = self
            .parsers
            .iter()
            .find(|p| p.supports(&definition.name))
            .ok_or_else(|| {
                ServiceError::Usage(format!(
                    "No parser available to parse migration definition '{}'",
                    definition.name
                ))
            })?;

        let parsed = parser.parse_migration_definition(definition);
        let unhandled = parsed
            .steps
            .iter()
            .find(|step| !self.executors.contains(&step.step_type))
            .map(|step| step.step_type.clone());

        match unhandled {
            Some(step_type) => Ok(parsed.invalid(format!(
                "Can not handle migration step of type '{}'",
                step_type
            ))),
            None => Ok(parsed),
        }
    }

    /// Context of a migration running (or last run) in this service
    pub fn current_context(&self, migration_name: &str) -> Option<&StoredContext> {
        self.migration_context.get(migration_name)
    }

    pub async fn execute_migration(
        &mut self,
        definition: MigrationDefinition,
        mut context: MigrationContext,
    ) -> Result<(), ServiceError> {
        let definition = if definition.status == DefinitionStatus::ToParse {
            self.parse_migration_definition(definition)?
        } else {
            definition
        };

        if definition.status == DefinitionStatus::Invalid {
            return Err(ServiceError::Usage(format!(
                "Can not execute migration '{}': {}",
                definition.name,
                definition.parsing_error.as_deref().unwrap_or_default()
            )));
        }

        Self::validate_context(&context)?;
        if context.output.is_none() {
            context.output = self.output.clone();
        }

        // Recorded on its own, outside the step transaction
        let migration = self
            .storage
            .start_migration(&definition, context.force_execution)
            .await?;
        info!(migration = %migration.name, steps = definition.steps.len(), "Executing migration");

        self.execute_migration_inner(&migration, &definition, context, 0)
            .await
    }

    pub async fn resume_migration(
        &mut self,
        migration: &Migration,
        context: MigrationContext,
    ) -> Result<(), ServiceError> {
        let cannot_resume =
            |reason: &str| ServiceError::Usage(format!("Can not resume migration '{}': {}", migration.name, reason));

        if migration.status != MigrationStatus::Suspended {
            return Err(cannot_resume("it is not in suspended status"));
        }

        let definitions = match self
            .get_migrations_definitions(&[PathBuf::from(&migration.path)])
            .await
        {
            Ok(definitions) => definitions,
            Err(ServiceError::Loader(LoaderError::PathNotFound(_))) => Vec::new(),
            Err(e) => return Err(e),
        };
        let definition = definitions
            .into_iter()
            .next()
            .ok_or_else(|| cannot_resume("its definition is missing"))?;

        let definition = self.parse_migration_definition(definition)?;
        if definition.status == DefinitionStatus::Invalid {
            return Err(cannot_resume(
                definition.parsing_error.as_deref().unwrap_or_default(),
            ));
        }

        let restored = self
            .context_handler
            .restore_current_context(&migration.name)
            .await?
            .ok_or_else(|| cannot_resume("the stored context is missing"))?;
        let stored = parse_stored_context(&restored)
            .ok_or_else(|| cannot_resume("the stored context is invalid"))?;

        // Everything is checked before the record or the stored context is touched
        let mut merged = stored.context.clone();
        merged.extend(context.to_map()?);
        let mut merged = MigrationContext::from_map(merged)
            .map_err(|e| cannot_resume(&format!("the stored context is invalid: {}", e)))?;
        Self::validate_context(&merged)?;
        merged.output = context.output.or_else(|| self.output.clone());

        let migration = self.storage.resume_migration(migration).await?;
        self.migration_context
            .insert(migration.name.clone(), stored.clone());

        // Not atomic with the restore above
        if let Err(e) = self.context_handler.delete_context(&migration.name).await {
            warn!(migration = %migration.name, error = %e, "Failed to delete stored context");
        }

        info!(migration = %migration.name, step = stored.step, "Resuming migration");
        self.execute_migration_inner(&migration, &definition, merged, stored.step - 1)
            .await
    }

    /// Steps produced by an executor's migration generation capability
    pub async fn generate_migration(
        &self,
        step_type: &str,
        conditions: &Value,
        mode: &str,
    ) -> Result<Vec<Value>, ServiceError> {
        let executor = self.get_executor(step_type)?;
        let generator = executor.as_generator().ok_or_else(|| {
            ServiceError::Usage(format!(
                "Executor with type '{}' does not support migration generation",
                step_type
            ))
        })?;

        Ok(generator
            .generate_migration(conditions, mode, &self.references)
            .await?)
    }

    fn validate_context(context: &MigrationContext) -> Result<(), ServiceError> {
        if context.reserved_key().is_some() {
            return Err(ServiceError::Usage(
                "Invalid call to execute migration: forbidden elements in migration context".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute_migration_inner(
        &mut self,
        migration: &Migration,
        definition: &MigrationDefinition,
        context: MigrationContext,
        step_offset: usize,
    ) -> Result<(), ServiceError> {
        Self::validate_context(&context)?;

        let mut message_suffix = String::new();
        if !context.forced_references.is_empty() {
            let mut injected = Vec::with_capacity(context.forced_references.len());
            for (name, value) in &context.forced_references {
                self.references.add_reference(name, value.clone(), true)?;
                injected.push(format!("{}: {}", name, display_value(value)));
            }
            message_suffix = format!("Injected references: {}", injected.join(", "));
        }

        let use_transaction = context.use_transaction();
        if use_transaction {
            self.backend.begin_transaction().await?;
        }

        let context_map = context.to_map()?;
        self.migration_context.insert(
            migration.name.clone(),
            StoredContext {
                context: context_map.clone(),
                step: step_offset + 1,
            },
        );

        let mut run = RunState {
            step: step_offset + 1,
            ..Default::default()
        };

        let result = self
            .run_steps(
                migration,
                definition,
                &context,
                &context_map,
                step_offset,
                &message_suffix,
                &mut run,
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.handle_failure(migration, e, &run, use_transaction, &message_suffix)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &mut self,
        migration: &Migration,
        definition: &MigrationDefinition,
        context: &MigrationContext,
        context_map: &Map<String, Value>,
        step_offset: usize,
        message_suffix: &str,
        run: &mut RunState,
    ) -> anyhow::Result<()> {
        let mut final_status = MigrationStatus::Done;
        let mut final_message = String::new();

        for step in definition.steps.iter().skip(step_offset) {
            if let Some(entry) = self.migration_context.get_mut(&migration.name) {
                entry.step = run.step;
            }

            let mut dispatch_context = context_map.clone();
            dispatch_context.insert("step".to_string(), json!(run.step));
            let step = step.with_context(&dispatch_context);

            let executor = self.executors.get(&step.step_type).ok_or_else(|| {
                anyhow!("Can not handle migration step of type '{}'", step.step_type)
            })?;

            let mut event = BeforeStepExecution::new(step, executor);
            self.dispatcher.before_step_execution(&mut event)?;
            let (step, executor, intercepted) = event.into_parts();
            if executor.runs_raw_sql() {
                run.raw_sql_executor = Some(Arc::clone(&executor));
            }

            debug!(migration = %migration.name, step = run.step, step_type = %step.step_type, "Executing step");
            let outcome = match intercepted {
                Some(outcome) => outcome,
                None => {
                    let mut scope = StepScope::new(&mut self.references)
                        .with_output(context.output.as_deref());
                    executor.execute(&step, &mut scope).await?
                }
            };

            match outcome {
                StepOutcome::Completed(result) => {
                    self.dispatcher.step_executed(&step, &result);
                }
                StepOutcome::Skipped => {
                    debug!(migration = %migration.name, step = run.step, "Step skipped");
                }
                StepOutcome::Aborted { status, message } => {
                    self.dispatcher.migration_aborted(&step, status, &message);
                    info!(migration = %migration.name, step = run.step, status = %status, "Migration aborted");
                    final_status = status;
                    final_message = format!("Abort in execution of step {}: {}", run.step, message);
                    break;
                }
                StepOutcome::Suspended { message } => {
                    self.dispatcher.migration_suspended(&step, &message);
                    let current = self
                        .migration_context
                        .get(&migration.name)
                        .cloned()
                        .ok_or_else(|| anyhow!("No context to store for migration '{}'", migration.name))?;
                    self.context_handler
                        .store_current_context(&migration.name, &current)
                        .await?;
                    info!(migration = %migration.name, step = run.step, "Migration suspended");
                    final_status = MigrationStatus::Suspended;
                    final_message = format!("Suspended in execution of step {}: {}", run.step, message);
                    break;
                }
            }

            run.step += 1;
        }

        let final_message = join_message(final_message, message_suffix);

        // An error while committing reports the last step attempted
        run.step = run.step.saturating_sub(1);

        self.storage
            .end_migration(&migration.with_status(final_status, final_message), false)
            .await?;

        if context.use_transaction() {
            self.commit(migration, context, run).await?;
        }

        info!(migration = %migration.name, status = %final_status, "Migration ended");
        Ok(())
    }

    /// Commit as the admin identity, restoring the previous one afterwards
    async fn commit(
        &self,
        migration: &Migration,
        context: &MigrationContext,
        run: &mut RunState,
    ) -> anyhow::Result<()> {
        let previous_user = self.backend.current_user().await?;
        let login = context
            .admin_login
            .as_deref()
            .unwrap_or(&self.default_admin_login);
        self.backend.authenticate_as(login).await?;

        run.committing = true;
        let result = match self.backend.commit().await {
            Ok(()) => Ok(()),
            Err(BackendError::NoActiveTransaction)
                if self.backend.capabilities().implicit_ddl_commit
                    && run.raw_sql_executor.is_some() =>
            {
                warn!(
                    migration = %migration.name,
                    "No active transaction at commit time, raw SQL already committed it"
                );
                if let Some(executor) = &run.raw_sql_executor {
                    executor.reset_transaction();
                }
                Ok(())
            }
            Err(e) => Err(e),
        };
        if result.is_ok() {
            run.committing = false;
        }

        if let Some(previous) = previous_user {
            if let Err(e) = self.backend.authenticate_as(&previous).await {
                warn!(migration = %migration.name, user = %previous, error = %e, "Failed to restore previous user");
            }
        }

        Ok(result?)
    }

    async fn handle_failure(
        &self,
        migration: &Migration,
        failure: anyhow::Error,
        run: &RunState,
        use_transaction: bool,
        message_suffix: &str,
    ) -> Result<(), ServiceError> {
        let mut message = full_error_message(&failure);
        let mut status = MigrationStatus::Failed;
        let mut after_commit = None;

        if use_transaction {
            if let Err(rollback_error) = self.backend.rollback().await {
                if run.committing && matches!(rollback_error, BackendError::NoActiveTransaction) {
                    // Nothing to roll back: the commit went through
                    status = MigrationStatus::Done;
                    message = format!("An exception was thrown after committing: {}", message);
                    after_commit = Some(message.clone());
                } else {
                    message = format!(
                        "{}. In addition, an exception was thrown while rolling back: {}",
                        message,
                        full_error_message(&anyhow::Error::from(rollback_error))
                    );
                }
            }
        }

        let message = join_message(message, message_suffix);
        error!(migration = %migration.name, step = run.step, status = %status, "{}", message);

        // Forced: a record may already say done if the commit itself failed
        self.storage
            .end_migration(&migration.with_status(status, message.clone()), true)
            .await?;

        Err(match after_commit {
            Some(message) => ServiceError::AfterMigrationExecution {
                step: run.step,
                message,
            },
            None => ServiceError::StepExecution {
                step: run.step,
                message,
            },
        })
    }
}

/// `{context: {...}, step: n}` with n >= 1
fn parse_stored_context(value: &Value) -> Option<StoredContext> {
    let context = value.get("context")?.as_object()?.clone();
    let step = value.get("step")?.as_u64().filter(|step| *step >= 1)?;
    Some(StoredContext {
        context,
        step: usize::try_from(step).ok()?,
    })
}

fn join_message(message: String, suffix: &str) -> String {
    if !message.is_empty() && !suffix.is_empty() {
        format!("{}. {}", message, suffix)
    } else {
        message + suffix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_message() {
        assert_eq!(join_message(String::new(), ""), "");
        assert_eq!(join_message("done".to_string(), ""), "done");
        assert_eq!(join_message(String::new(), "Injected references: a: 1"), "Injected references: a: 1");
        assert_eq!(
            join_message("Abort in execution of step 2: x".to_string(), "Injected references: a: 1"),
            "Abort in execution of step 2: x. Injected references: a: 1"
        );
    }

    #[test]
    fn test_parse_stored_context() {
        let stored = parse_stored_context(&json!({ "context": { "a": 1 }, "step": 2 })).unwrap();
        assert_eq!(stored.step, 2);
        assert_eq!(stored.context.get("a"), Some(&json!(1)));

        assert!(parse_stored_context(&json!({ "step": 2 })).is_none());
        assert!(parse_stored_context(&json!({ "context": {}, "step": 0 })).is_none());
        assert!(parse_stored_context(&json!({ "context": [], "step": 1 })).is_none());
    }
}
