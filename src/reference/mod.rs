//! Named references shared between the steps of a run.
//!
//! A step writes references once it completes; later steps consume them by
//! using the string `reference:<name>` anywhere in their parameters, or the
//! token `[reference:<name>]` embedded inside a longer string.
//!
//! The store lives for as long as its owner does. Nothing clears it between
//! migrations, so names may collide across migrations run by the same
//! service unless `overwrite` is requested.

mod conditions;

pub use conditions::matches_conditions;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Prefix marking a string value as a reference
pub const REFERENCE_PREFIX: &str = "reference:";

static EMBEDDED_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[reference:([^\]\s]+)\]").expect("embedded reference pattern is valid")
});

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("Reference '{0}' has already been defined")]
    AlreadyDefined(String),

    #[error("No reference set with identifier '{0}'")]
    NotFound(String),

    #[error("Invalid reference condition: {0}")]
    InvalidCondition(String),
}

/// Process-wide key/value registry of references
#[derive(Debug, Clone, Default)]
pub struct ReferenceResolver {
    references: BTreeMap<String, Value>,
}

impl ReferenceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a reference. Re-declaring an existing name needs `overwrite`.
    pub fn add_reference(
        &mut self,
        name: &str,
        value: Value,
        overwrite: bool,
    ) -> Result<(), ReferenceError> {
        if !overwrite && self.references.contains_key(name) {
            return Err(ReferenceError::AlreadyDefined(name.to_string()));
        }
        self.references.insert(name.to_string(), value);
        Ok(())
    }

    pub fn has_reference(&self, name: &str) -> bool {
        self.references.contains_key(name)
    }

    pub fn get_reference(&self, name: &str) -> Result<&Value, ReferenceError> {
        self.references
            .get(name)
            .ok_or_else(|| ReferenceError::NotFound(name.to_string()))
    }

    pub fn list_references(&self) -> &BTreeMap<String, Value> {
        &self.references
    }

    /// Whether `value` is a `reference:<name>` string
    pub fn is_reference(value: &Value) -> bool {
        matches!(value, Value::String(s) if s.starts_with(REFERENCE_PREFIX))
    }

    /// Resolve a single value: references are replaced, anything else is returned as is
    pub fn resolve_reference(&self, value: &Value) -> Result<Value, ReferenceError> {
        match value {
            Value::String(s) => match s.strip_prefix(REFERENCE_PREFIX) {
                Some(name) => self.get_reference(name).cloned(),
                None => Ok(value.clone()),
            },
            _ => Ok(value.clone()),
        }
    }

    /// Resolve references found anywhere inside a parameter tree, keys included
    pub fn resolve_references_recursively(&self, value: &Value) -> Result<Value, ReferenceError> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_references_recursively(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    let key = match key.strip_prefix(REFERENCE_PREFIX) {
                        Some(name) => display_value(self.get_reference(name)?),
                        None => key.clone(),
                    };
                    resolved.insert(key, self.resolve_references_recursively(item)?);
                }
                Ok(Value::Object(resolved))
            }
            _ => self.resolve_reference(value),
        }
    }

    /// Substitute every `[reference:<name>]` token inside `text`
    pub fn resolve_embedded_references(&self, text: &str) -> Result<String, ReferenceError> {
        let mut output = String::with_capacity(text.len());
        let mut last = 0;
        for captures in EMBEDDED_REFERENCE.captures_iter(text) {
            let Some(token) = captures.get(0) else {
                continue;
            };
            let value = self.get_reference(&captures[1])?;
            output.push_str(&text[last..token.start()]);
            output.push_str(&display_value(value));
            last = token.end();
        }
        output.push_str(&text[last..]);
        Ok(output)
    }
}

/// Render a reference value for interpolation into text
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        other => other.to_string(),
    }
}
