use super::{Backend, BackendCapabilities, BackendError, Record, RecordStore};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

type Collections = BTreeMap<String, BTreeMap<String, Map<String, Value>>>;

#[derive(Debug, Default)]
struct DocumentState {
    committed: Collections,
    /// Working copy while a transaction is open
    working: Option<Collections>,
    current_user: Option<String>,
}

impl DocumentState {
    fn active(&mut self) -> &mut Collections {
        match self.working.as_mut() {
            Some(working) => working,
            None => &mut self.committed,
        }
    }

    fn visible(&self) -> &Collections {
        self.working.as_ref().unwrap_or(&self.committed)
    }
}

/// JSON-document backend: collections of records kept in one file.
///
/// A transaction works on a copy of the document which replaces the
/// committed one on commit. Writes made outside a transaction are flushed
/// immediately.
pub struct DocumentBackend {
    path: Option<PathBuf>,
    known_users: BTreeSet<String>,
    capabilities: BackendCapabilities,
    state: Mutex<DocumentState>,
}

impl DocumentBackend {
    /// A backend that never touches the disk
    pub fn in_memory(known_users: impl IntoIterator<Item = String>) -> Self {
        Self {
            path: None,
            known_users: known_users.into_iter().collect(),
            capabilities: BackendCapabilities::default(),
            state: Mutex::new(DocumentState::default()),
        }
    }

    /// Open (or start) the document stored at `path`
    pub async fn open(
        path: PathBuf,
        known_users: impl IntoIterator<Item = String>,
    ) -> Result<Self, BackendError> {
        let committed = if path.exists() {
            let content = fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            Collections::new()
        };

        Ok(Self {
            path: Some(path),
            known_users: known_users.into_iter().collect(),
            capabilities: BackendCapabilities::default(),
            state: Mutex::new(DocumentState {
                committed,
                ..Default::default()
            }),
        })
    }

    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub async fn in_transaction(&self) -> bool {
        self.state.lock().await.working.is_some()
    }

    async fn persist(&self, committed: &Collections) -> Result<(), BackendError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write atomically using temp file + rename
        let temp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(committed)?;
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, path).await?;
        Ok(())
    }

    async fn write<F>(&self, apply: F) -> Result<(), BackendError>
    where
        F: FnOnce(&mut Collections) -> Result<(), BackendError> + Send,
    {
        let mut state = self.state.lock().await;
        apply(state.active())?;
        if state.working.is_none() {
            let snapshot = state.committed.clone();
            drop(state);
            self.persist(&snapshot).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for DocumentBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn begin_transaction(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if state.working.is_some() {
            return Err(BackendError::TransactionAlreadyActive);
        }
        state.working = Some(state.committed.clone());
        debug!("Transaction started");
        Ok(())
    }

    async fn commit(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let working = state.working.take().ok_or(BackendError::NoActiveTransaction)?;
        state.committed = working;
        let snapshot = state.committed.clone();
        drop(state);

        self.persist(&snapshot).await?;
        debug!("Transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.working.take().ok_or(BackendError::NoActiveTransaction)?;
        debug!("Transaction rolled back");
        Ok(())
    }

    async fn current_user(&self) -> Result<Option<String>, BackendError> {
        Ok(self.state.lock().await.current_user.clone())
    }

    async fn authenticate_as(&self, login: &str) -> Result<(), BackendError> {
        if !self.known_users.contains(login) {
            return Err(BackendError::UnknownUser(login.to_string()));
        }
        self.state.lock().await.current_user = Some(login.to_string());
        Ok(())
    }
}

#[async_trait]
impl RecordStore for DocumentBackend {
    async fn get(&self, collection: &str, identifier: &str) -> Result<Option<Record>, BackendError> {
        let state = self.state.lock().await;
        Ok(state
            .visible()
            .get(collection)
            .and_then(|records| records.get(identifier))
            .map(|attributes| Record::new(identifier, attributes.clone())))
    }

    async fn list(&self, collection: &str) -> Result<Vec<Record>, BackendError> {
        let state = self.state.lock().await;
        Ok(state
            .visible()
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .map(|(id, attributes)| Record::new(id.clone(), attributes.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(&self, collection: &str, record: Record) -> Result<(), BackendError> {
        let collection = collection.to_string();
        self.write(move |data| {
            let records = data.entry(collection.clone()).or_default();
            if records.contains_key(&record.identifier) {
                return Err(BackendError::DuplicateRecord {
                    collection,
                    identifier: record.identifier,
                });
            }
            records.insert(record.identifier, record.attributes);
            Ok(())
        })
        .await
    }

    async fn update(&self, collection: &str, record: Record) -> Result<(), BackendError> {
        let collection = collection.to_string();
        self.write(move |data| {
            match data
                .get_mut(&collection)
                .and_then(|records| records.get_mut(&record.identifier))
            {
                Some(attributes) => {
                    *attributes = record.attributes;
                    Ok(())
                }
                None => Err(BackendError::RecordNotFound {
                    collection,
                    identifier: record.identifier,
                }),
            }
        })
        .await
    }

    async fn delete(&self, collection: &str, identifier: &str) -> Result<(), BackendError> {
        let collection = collection.to_string();
        let identifier = identifier.to_string();
        self.write(move |data| {
            match data
                .get_mut(&collection)
                .and_then(|records| records.remove(&identifier))
            {
                Some(_) => Ok(()),
                None => Err(BackendError::RecordNotFound {
                    collection,
                    identifier,
                }),
            }
        })
        .await
    }
}
