//! Backend adapter seam: transactions, identity switching and record storage.

mod document;

pub use document::DocumentBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("There is no active transaction")]
    NoActiveTransaction,

    #[error("A transaction is already active")]
    TransactionAlreadyActive,

    #[error("Unknown user login '{0}'")]
    UnknownUser(String),

    #[error("Record '{identifier}' already exists in '{collection}'")]
    DuplicateRecord {
        collection: String,
        identifier: String,
    },

    #[error("Record '{identifier}' not found in '{collection}'")]
    RecordNotFound {
        collection: String,
        identifier: String,
    },

    /// Structured validation failure reported by the backend
    #[error("{message}")]
    Validation {
        message: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("{0}")]
    Driver(String),
}

/// One entry of a backend validation report; entries can nest
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationIssue {
    pub message: String,
    pub values: BTreeMap<String, String>,
    pub nested: Vec<ValidationIssue>,
}

impl ValidationIssue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn with_nested(mut self, issue: ValidationIssue) -> Self {
        self.nested.push(issue);
        self
    }
}

/// Behaviour of the backend decided when the adapter is built
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// DDL silently commits the open transaction, after which an explicit
    /// commit or rollback reports `NoActiveTransaction`
    pub implicit_ddl_commit: bool,
}

/// The stateful system migrations are applied to
#[async_trait]
pub trait Backend: Send + Sync {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    async fn begin_transaction(&self) -> Result<(), BackendError>;

    async fn commit(&self) -> Result<(), BackendError>;

    async fn rollback(&self) -> Result<(), BackendError>;

    /// Login of the identity currently acting on the backend, if any
    async fn current_user(&self) -> Result<Option<String>, BackendError>;

    async fn authenticate_as(&self, login: &str) -> Result<(), BackendError>;
}

/// A generic entity: an identifier plus free-form attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub identifier: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl Record {
    pub fn new(identifier: impl Into<String>, attributes: Map<String, Value>) -> Self {
        Self {
            identifier: identifier.into(),
            attributes,
        }
    }

    pub fn to_value(&self, collection: &str) -> Value {
        serde_json::json!({
            "collection": collection,
            "identifier": self.identifier,
            "attributes": self.attributes,
        })
    }
}

/// Record-level access used by the record executor
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, collection: &str, identifier: &str) -> Result<Option<Record>, BackendError>;

    /// All records of a collection, ordered by identifier
    async fn list(&self, collection: &str) -> Result<Vec<Record>, BackendError>;

    async fn insert(&self, collection: &str, record: Record) -> Result<(), BackendError>;

    async fn update(&self, collection: &str, record: Record) -> Result<(), BackendError>;

    async fn delete(&self, collection: &str, identifier: &str) -> Result<(), BackendError>;
}
