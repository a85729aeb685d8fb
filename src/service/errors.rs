use crate::backend::{BackendError, ValidationIssue};
use crate::context::ContextError;
use crate::definition::LoaderError;
use crate::executor::StepError;
use crate::reference::ReferenceError;
use crate::storage::StorageError;
use std::fmt::Write;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    /// The call itself can not be honoured
    #[error("{0}")]
    Usage(String),

    #[error("Error in execution of step {step}: {message}")]
    StepExecution { step: usize, message: String },

    /// The steps were committed, but something failed right after
    #[error("Error after execution of step {step}: {message}")]
    AfterMigrationExecution { step: usize, message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Readable text for an error: its causal chain one message per line, with
/// structured validation issues flattened as `message - {values}` lines
pub fn full_error_message(error: &anyhow::Error) -> String {
    let mut message = String::new();

    for (depth, cause) in error.chain().enumerate() {
        if depth > 0 {
            message.push('\n');
        }
        message.push_str(&cause.to_string());

        let backend = cause.downcast_ref::<BackendError>().or_else(|| {
            match cause.downcast_ref::<StepError>() {
                Some(StepError::Backend(inner)) => Some(inner),
                _ => None,
            }
        });
        if let Some(BackendError::Validation { issues, .. }) = backend {
            write_issues(&mut message, issues);
        }
    }

    message
}

fn write_issues(message: &mut String, issues: &[ValidationIssue]) {
    for issue in issues {
        let _ = write!(message, "\n{} - {:?}", issue.message, issue.values);
        write_issues(message, &issue.nested);
    }
}
