use crate::backend::{BackendError, DocumentBackend, RecordStore};
use crate::config::EngineConfig;
use crate::context::FileContextHandler;
use crate::definition::{FilesystemLoader, JsonDefinitionParser, YamlDefinitionParser};
use crate::executor::{FlowExecutor, RecordExecutor, ReferenceExecutor};
use crate::service::MigrationService;
use crate::storage::JsonStorageHandler;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Wire a service with the file-based collaborators and bundled executors
/// described by `config` (paths are expected to be resolved already)
pub async fn build_service(config: &EngineConfig) -> Result<MigrationService, BackendError> {
    let backend = Arc::new(DocumentBackend::open(config.data_file.clone(), config.known_users.clone()).await?);
    let records: Arc<dyn RecordStore> = backend.clone();

    let mut service = MigrationService::new(
        Arc::new(FilesystemLoader::new(config.migration_dirs.clone())),
        Arc::new(JsonStorageHandler::new(config.storage_file.clone())),
        backend,
        Arc::new(FileContextHandler::new(config.context_dir.clone())),
    );

    service.add_definition_parser(Arc::new(YamlDefinitionParser));
    service.add_definition_parser(Arc::new(JsonDefinitionParser));

    let base_dir = config
        .migration_dirs
        .first()
        .cloned()
        .unwrap_or_else(|| PathBuf::from("."));
    service.add_executor(Arc::new(ReferenceExecutor::new(base_dir)));
    service.add_executor(Arc::new(FlowExecutor::new()));
    service.add_executor(Arc::new(RecordExecutor::new(records, config.record_types.clone())));
    service.set_default_admin_login(config.admin_login.clone());

    debug!(executors = ?service.list_executors(), "Migration service ready");
    Ok(service)
}
