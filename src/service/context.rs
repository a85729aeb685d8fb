use crate::executor::OutputSink;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Context keys injected by the engine itself, refused from callers
pub const RESERVED_CONTEXT_KEYS: &[&str] = &["path", "contentTypeIdentifier", "fieldIdentifier"];

/// Options of one run, also handed to every step as its context
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationContext {
    /// Wrap all steps in one backend transaction (default: true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_transaction: Option<bool>,

    /// Identity assumed at commit time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_login: Option<String>,

    /// Injected into the reference store before the first step runs
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub forced_references: BTreeMap<String, Value>,

    /// Allow re-running a migration which already has a record
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force_execution: bool,

    /// Any other caller-defined value
    #[serde(flatten)]
    pub extra: Map<String, Value>,

    #[serde(skip)]
    pub output: Option<Arc<dyn OutputSink>>,
}

impl MigrationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transaction(mut self, use_transaction: bool) -> Self {
        self.use_transaction = Some(use_transaction);
        self
    }

    pub fn with_admin_login(mut self, login: impl Into<String>) -> Self {
        self.admin_login = Some(login.into());
        self
    }

    pub fn with_forced_reference(mut self, name: impl Into<String>, value: Value) -> Self {
        self.forced_references.insert(name.into(), value);
        self
    }

    pub fn with_force_execution(mut self, force: bool) -> Self {
        self.force_execution = force;
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn with_output(mut self, output: Arc<dyn OutputSink>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn use_transaction(&self) -> bool {
        self.use_transaction.unwrap_or(true)
    }

    /// First reserved key present among the caller-defined values
    pub fn reserved_key(&self) -> Option<&'static str> {
        RESERVED_CONTEXT_KEYS
            .iter()
            .copied()
            .find(|key| self.extra.contains_key(*key))
    }

    /// Serializable form, without the output sink
    pub fn to_map(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(map))
    }
}

impl fmt::Debug for MigrationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationContext")
            .field("use_transaction", &self.use_transaction)
            .field("admin_login", &self.admin_login)
            .field("forced_references", &self.forced_references)
            .field("force_execution", &self.force_execution)
            .field("extra", &self.extra)
            .field("output", &self.output.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_map_only_carries_what_was_set() {
        let context = MigrationContext::new()
            .with_transaction(false)
            .with_value("tenant", json!("acme"));

        let map = context.to_map().unwrap();
        assert_eq!(
            Value::Object(map),
            json!({ "useTransaction": false, "tenant": "acme" })
        );
    }

    #[test]
    fn test_round_trip_through_map() {
        let context = MigrationContext::new()
            .with_admin_login("root")
            .with_forced_reference("a", json!(1))
            .with_force_execution(true);

        let restored = MigrationContext::from_map(context.to_map().unwrap()).unwrap();
        assert_eq!(restored.admin_login.as_deref(), Some("root"));
        assert_eq!(restored.forced_references.get("a"), Some(&json!(1)));
        assert!(restored.force_execution);
        assert!(restored.extra.is_empty());
    }

    #[test]
    fn test_reserved_key() {
        assert_eq!(MigrationContext::new().reserved_key(), None);
        let context = MigrationContext::new().with_value("path", json!("/tmp"));
        assert_eq!(context.reserved_key(), Some("path"));
    }
}
