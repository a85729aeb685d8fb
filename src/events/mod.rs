//! In-process notifications fired around step execution.
//!
//! Listeners run synchronously, in registration order. The before-execution
//! hook may swap the executor, rewrite the step, or take over the step's
//! outcome (for instance to suspend or abort the migration).

use crate::definition::MigrationStep;
use crate::executor::{Executor, StepError, StepOutcome};
use crate::storage::MigrationStatus;
use serde_json::Value;
use std::sync::Arc;

/// Step about to be dispatched, open to modification by listeners
pub struct BeforeStepExecution {
    step: MigrationStep,
    executor: Arc<dyn Executor>,
    outcome: Option<StepOutcome>,
}

impl BeforeStepExecution {
    pub fn new(step: MigrationStep, executor: Arc<dyn Executor>) -> Self {
        Self {
            step,
            executor,
            outcome: None,
        }
    }

    pub fn step(&self) -> &MigrationStep {
        &self.step
    }

    pub fn set_step(&mut self, step: MigrationStep) {
        self.step = step;
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn set_executor(&mut self, executor: Arc<dyn Executor>) {
        self.executor = executor;
    }

    /// Replace the dispatch: the executor is not called and this outcome is used instead
    pub fn set_outcome(&mut self, outcome: StepOutcome) {
        self.outcome = Some(outcome);
    }

    pub fn into_parts(self) -> (MigrationStep, Arc<dyn Executor>, Option<StepOutcome>) {
        (self.step, self.executor, self.outcome)
    }
}

pub trait MigrationListener: Send + Sync {
    fn before_step_execution(&self, _event: &mut BeforeStepExecution) -> Result<(), StepError> {
        Ok(())
    }

    fn step_executed(&self, _step: &MigrationStep, _result: &Value) {}

    fn migration_aborted(&self, _step: &MigrationStep, _status: MigrationStatus, _message: &str) {}

    fn migration_suspended(&self, _step: &MigrationStep, _message: &str) {}
}

#[derive(Default, Clone)]
pub struct EventDispatcher {
    listeners: Vec<Arc<dyn MigrationListener>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn MigrationListener>) {
        self.listeners.push(listener);
    }

    pub fn before_step_execution(&self, event: &mut BeforeStepExecution) -> Result<(), StepError> {
        for listener in &self.listeners {
            listener.before_step_execution(event)?;
        }
        Ok(())
    }

    pub fn step_executed(&self, step: &MigrationStep, result: &Value) {
        for listener in &self.listeners {
            listener.step_executed(step, result);
        }
    }

    pub fn migration_aborted(&self, step: &MigrationStep, status: MigrationStatus, message: &str) {
        for listener in &self.listeners {
            listener.migration_aborted(step, status, message);
        }
    }

    pub fn migration_suspended(&self, step: &MigrationStep, message: &str) {
        for listener in &self.listeners {
            listener.migration_suspended(step, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::StepScope;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Executor for Echo {
        fn supported_types(&self) -> Vec<String> {
            vec!["echo".to_string()]
        }

        async fn execute(
            &self,
            step: &MigrationStep,
            _scope: &mut StepScope<'_>,
        ) -> Result<StepOutcome, StepError> {
            Ok(StepOutcome::Completed(step.dsl.clone()))
        }
    }

    struct Rewriter;

    impl MigrationListener for Rewriter {
        fn before_step_execution(&self, event: &mut BeforeStepExecution) -> Result<(), StepError> {
            let step = MigrationStep::new("echo", json!({ "rewritten": true }));
            event.set_step(step);
            event.set_outcome(StepOutcome::Skipped);
            Ok(())
        }
    }

    #[test]
    fn test_listeners_can_rewrite_the_step() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.add_listener(Arc::new(Rewriter));

        let mut event = BeforeStepExecution::new(
            MigrationStep::new("echo", json!({})),
            Arc::new(Echo),
        );
        dispatcher.before_step_execution(&mut event).unwrap();

        let (step, _, outcome) = event.into_parts();
        assert_eq!(step.dsl, json!({ "rewritten": true }));
        assert_eq!(outcome, Some(StepOutcome::Skipped));
    }
}
