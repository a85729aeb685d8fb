//! Step executors.
//!
//! An executor performs the real-world effect of one family of step types.
//! Executors are registered on the [`ExecutorRegistry`] under every type name
//! they declare; the orchestrator looks them up by the step's type.
//!
//! Control flow is part of the return value: a step can complete, ask to be
//! treated as a no-op, abort the whole migration with a chosen final status,
//! or suspend it so that it can be resumed later from the same step.

mod flow;
mod record;
mod reference;
mod sql;
pub mod support;

pub use flow::FlowExecutor;
pub use record::RecordExecutor;
pub use reference::ReferenceExecutor;
pub use sql::{SqlConnection, SqlExecutor};

use crate::backend::BackendError;
use crate::definition::MigrationStep;
use crate::reference::{ReferenceError, ReferenceResolver};
use crate::storage::MigrationStatus;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StepError {
    #[error("Invalid step definition: {0}")]
    InvalidStepDefinition(String),

    /// A match produced a number of entities the step did not expect
    #[error("{0}")]
    InvalidMatchResultsNumber(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("{0}")]
    Execution(String),
}

/// What happened when a step was dispatched
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step ran; carries the entity or collection it acted upon
    Completed(Value),
    /// The step decided it had nothing to do
    Skipped,
    /// Stop the migration, ending it with the given status
    Aborted {
        status: MigrationStatus,
        message: String,
    },
    /// Stop the migration and keep enough state to resume it from this step
    Suspended { message: String },
}

/// Sink for progress text produced while steps run
pub trait OutputSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// What a step gets to work with besides its own definition
pub struct StepScope<'a> {
    pub references: &'a mut ReferenceResolver,
    pub output: Option<&'a dyn OutputSink>,
}

impl<'a> StepScope<'a> {
    pub fn new(references: &'a mut ReferenceResolver) -> Self {
        Self {
            references,
            output: None,
        }
    }

    pub fn with_output(mut self, output: Option<&'a dyn OutputSink>) -> Self {
        self.output = output;
        self
    }

    pub fn write_line(&self, line: &str) {
        match self.output {
            Some(output) => output.write_line(line),
            None => tracing::info!("{}", line),
        }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Step type names handled by this executor
    fn supported_types(&self) -> Vec<String>;

    async fn execute(
        &self,
        step: &MigrationStep,
        scope: &mut StepScope<'_>,
    ) -> Result<StepOutcome, StepError>;

    /// Whether this executor runs raw SQL on the backend connection
    fn runs_raw_sql(&self) -> bool {
        false
    }

    /// Forget any transaction nesting the executor's connection believes is open
    fn reset_transaction(&self) {}

    fn as_generator(&self) -> Option<&dyn MigrationGenerator> {
        None
    }
}

/// Executors able to run in reverse: produce the steps recreating live entities
#[async_trait]
pub trait MigrationGenerator: Send + Sync {
    async fn generate_migration(
        &self,
        conditions: &Value,
        mode: &str,
        references: &ReferenceResolver,
    ) -> Result<Vec<Value>, StepError>;
}

/// Executors keyed by step type
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: BTreeMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under every type it supports.
    /// A later registration for the same type replaces the earlier one.
    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        for step_type in executor.supported_types() {
            self.executors.insert(step_type, Arc::clone(&executor));
        }
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(step_type).cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.executors.contains_key(step_type)
    }

    pub fn list(&self) -> Vec<String> {
        self.executors.keys().cloned().collect()
    }
}
