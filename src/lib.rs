pub mod backend;
pub mod config;
pub mod context;
pub mod definition;
pub mod events;
pub mod executor;
pub mod reference;
pub mod service;
pub mod setup;
pub mod storage;
pub mod template;
pub mod utils;

// Re-export commonly used types
pub use backend::{Backend, BackendCapabilities, BackendError, DocumentBackend, Record, RecordStore, ValidationIssue};
pub use config::{read_config, write_config, ConfigError, EngineConfig};
pub use context::{ContextError, ContextHandler, FileContextHandler, StoredContext};
pub use definition::{
    DefinitionParser, DefinitionStatus, FilesystemLoader, JsonDefinitionParser, Loader, LoaderError,
    MigrationDefinition, MigrationStep, YamlDefinitionParser,
};
pub use events::{BeforeStepExecution, EventDispatcher, MigrationListener};
pub use executor::{
    Executor, ExecutorRegistry, FlowExecutor, MigrationGenerator, OutputSink, RecordExecutor,
    ReferenceExecutor, SqlConnection, SqlExecutor, StepError, StepOutcome, StepScope,
};
pub use reference::{ReferenceError, ReferenceResolver};
pub use service::{full_error_message, MigrationContext, MigrationService, ServiceError};
pub use setup::build_service;
pub use storage::{JsonStorageHandler, Migration, MigrationStatus, StorageError, StorageHandler};
pub use template::{MigrationFormat, TemplateEngine, TemplateError};
