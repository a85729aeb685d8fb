use super::support::{action, resolved_param, should_skip};
use super::{Executor, StepError, StepOutcome, StepScope};
use crate::definition::MigrationStep;
use crate::reference::matches_conditions;
use crate::storage::MigrationStatus;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const ACTIONS: &[&str] = &["cancel", "fail", "suspend", "sleep"];

/// Flow control for the running migration (step type `migration`)
#[derive(Debug, Default)]
pub struct FlowExecutor;

impl FlowExecutor {
    pub fn new() -> Self {
        Self
    }

    fn message(step: &MigrationStep, scope: &StepScope<'_>) -> Result<String, StepError> {
        match step.param("message").and_then(Value::as_str) {
            Some(message) => Ok(scope.references.resolve_embedded_references(message)?),
            None => Ok(String::new()),
        }
    }

    fn cancel(step: &MigrationStep, scope: &StepScope<'_>) -> Result<StepOutcome, StepError> {
        let status = match step.param("status").and_then(Value::as_str) {
            Some(status) => status.parse::<MigrationStatus>().map_err(StepError::InvalidStepDefinition)?,
            None => MigrationStatus::Done,
        };
        // Only final statuses: nothing would be stored to resume from
        if !matches!(
            status,
            MigrationStatus::Done
                | MigrationStatus::Failed
                | MigrationStatus::Skipped
                | MigrationStatus::PartiallyDone
        ) {
            return Err(StepError::InvalidStepDefinition(format!(
                "a migration can not be cancelled with status '{}'",
                status
            )));
        }
        Ok(StepOutcome::Aborted {
            status,
            message: Self::message(step, scope)?,
        })
    }

    fn suspend(step: &MigrationStep, scope: &StepScope<'_>) -> Result<StepOutcome, StepError> {
        let until = step.param("until").ok_or_else(|| {
            StepError::InvalidStepDefinition("missing 'until' condition for suspending a migration".to_string())
        })?;

        if matches_conditions(until, scope.references)? {
            debug!("Suspension condition met, continuing");
            return Ok(StepOutcome::Completed(Value::Bool(true)));
        }
        Ok(StepOutcome::Suspended {
            message: Self::message(step, scope)?,
        })
    }

    async fn sleep(step: &MigrationStep, scope: &StepScope<'_>) -> Result<StepOutcome, StepError> {
        let seconds = resolved_param(step, scope.references, "seconds")?
            .and_then(|v| v.as_f64())
            .filter(|s| *s >= 0.0)
            .ok_or_else(|| {
                StepError::InvalidStepDefinition("missing or invalid 'seconds' for sleeping".to_string())
            })?;

        let duration = Duration::try_from_secs_f64(seconds).map_err(|_| {
            StepError::InvalidStepDefinition(format!("'seconds' value {} is out of range", seconds))
        })?;
        tokio::time::sleep(duration).await;
        Ok(StepOutcome::Completed(Value::from(seconds)))
    }
}

#[async_trait]
impl Executor for FlowExecutor {
    fn supported_types(&self) -> Vec<String> {
        vec!["migration".to_string()]
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

        match mode {
            "cancel" => Self::cancel(step, scope),
            "fail" => Ok(StepOutcome::Aborted {
                status: MigrationStatus::Failed,
                message: Self::message(step, scope)?,
            }),
            "suspend" => Self::suspend(step, scope),
            _ => Self::sleep(step, scope).await,
        }
    }
}
