//! Helpers shared by executors: action selection, conditional skipping,
//! matching, cardinality checks and reference setting.

use super::StepError;
use crate::definition::MigrationStep;
use crate::reference::{matches_conditions, ReferenceResolver};
use serde_json::Value;

/// The step's `mode`, checked against the executor's action vocabulary
pub fn action<'a>(step: &'a MigrationStep, supported: &[&str]) -> Result<&'a str, StepError> {
    let mode = step
        .param("mode")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            StepError::InvalidStepDefinition("missing 'mode' for migration step".to_string())
        })?;

    if !supported.contains(&mode) {
        return Err(StepError::InvalidStepDefinition(format!(
            "value '{}' is not allowed for 'mode'",
            mode
        )));
    }
    Ok(mode)
}

/// True when the step carries an `if` condition which does not hold
pub fn should_skip(step: &MigrationStep, references: &ReferenceResolver) -> Result<bool, StepError> {
    match step.param("if") {
        Some(conditions) => Ok(!matches_conditions(conditions, references)?),
        None => Ok(false),
    }
}

/// Parameter with references resolved recursively
pub fn resolved_param(
    step: &MigrationStep,
    references: &ReferenceResolver,
    key: &str,
) -> Result<Option<Value>, StepError> {
    step.param(key)
        .map(|value| references.resolve_references_recursively(value))
        .transpose()
        .map_err(StepError::from)
}

/// Required string parameter, references resolved
pub fn required_string(
    step: &MigrationStep,
    references: &ReferenceResolver,
    key: &str,
) -> Result<String, StepError> {
    match resolved_param(step, references, key)? {
        Some(Value::String(s)) => Ok(s),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(StepError::InvalidStepDefinition(format!(
            "'{}' must be a string",
            key
        ))),
        None => Err(StepError::InvalidStepDefinition(format!(
            "missing '{}'",
            key
        ))),
    }
}

/// Boolean parameter (references resolved), false when absent
pub fn flag(step: &MigrationStep, references: &ReferenceResolver, key: &str) -> Result<bool, StepError> {
    match resolved_param(step, references, key)? {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(b),
        Some(other) => Err(StepError::InvalidStepDefinition(format!(
            "'{}' must be a boolean, got {}",
            key, other
        ))),
    }
}

/// How many results a matching step expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedResults {
    One,
    Any,
    Many,
}

/// Read `expect`; without it, asking for any non-scalar reference implies `one`
pub fn expected_results(step: &MigrationStep, scalar_attributes: &[&str]) -> Result<ExpectedResults, StepError> {
    if let Some(expect) = step.param("expect") {
        return match expect.as_str() {
            Some("one") => Ok(ExpectedResults::One),
            Some("any") => Ok(ExpectedResults::Any),
            Some("many") => Ok(ExpectedResults::Many),
            _ => Err(StepError::InvalidStepDefinition(format!(
                "invalid value for 'expect': {}",
                expect
            ))),
        };
    }

    let references = reference_definitions(step)?;
    if references
        .iter()
        .any(|r| !scalar_attributes.contains(&r.attribute.as_str()))
    {
        return Ok(ExpectedResults::One);
    }
    Ok(ExpectedResults::Any)
}

pub fn validate_results_count(count: usize, expected: ExpectedResults) -> Result<(), StepError> {
    match expected {
        ExpectedResults::One if count == 0 => Err(StepError::InvalidMatchResultsNumber(
            "Found no results but expect one".to_string(),
        )),
        ExpectedResults::One if count > 1 => Err(StepError::InvalidMatchResultsNumber(format!(
            "Found {} results but expect one",
            count
        ))),
        ExpectedResults::Many if count == 0 => Err(StepError::InvalidMatchResultsNumber(
            "Found no results but expect some".to_string(),
        )),
        _ => Ok(()),
    }
}

/// One entry of a step's `references` parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDefinition {
    pub identifier: String,
    pub attribute: String,
    pub overwrite: bool,
}

/// Accepts a list of `{identifier, attribute, overwrite?}` or a map `name: attribute`
pub fn reference_definitions(step: &MigrationStep) -> Result<Vec<ReferenceDefinition>, StepError> {
    let invalid = |what: &str| StepError::InvalidStepDefinition(format!("invalid reference definition: {}", what));

    match step.param("references") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                let identifier = item
                    .get("identifier")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid("missing 'identifier'"))?;
                let attribute = item
                    .get("attribute")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid("missing 'attribute'"))?;
                Ok(ReferenceDefinition {
                    identifier: identifier.to_string(),
                    attribute: attribute.to_string(),
                    overwrite: item.get("overwrite").and_then(Value::as_bool).unwrap_or(false),
                })
            })
            .collect(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(identifier, definition)| match definition {
                Value::String(attribute) => Ok(ReferenceDefinition {
                    identifier: identifier.clone(),
                    attribute: attribute.clone(),
                    overwrite: false,
                }),
                Value::Object(_) => Ok(ReferenceDefinition {
                    identifier: identifier.clone(),
                    attribute: definition
                        .get("attribute")
                        .and_then(Value::as_str)
                        .ok_or_else(|| invalid("missing 'attribute'"))?
                        .to_string(),
                    overwrite: definition
                        .get("overwrite")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                }),
                _ => Err(invalid(identifier)),
            })
            .collect(),
        Some(_) => Err(invalid("'references' must be a list or a mapping")),
    }
}

/// Write every requested reference, asking `value_for` to compute each value
pub fn set_references<F>(
    step: &MigrationStep,
    references: &mut ReferenceResolver,
    mut value_for: F,
) -> Result<usize, StepError>
where
    F: FnMut(&ReferenceDefinition) -> Result<Value, StepError>,
{
    let definitions = reference_definitions(step)?;
    for definition in &definitions {
        let value = value_for(definition)?;
        references.add_reference(&definition.identifier, value, definition.overwrite)?;
    }
    Ok(definitions.len())
}

/// Resolved match conditions plus the `match_tolerate_misses` flag.
///
/// Falls back to `{fallback_key: <value>}` when the step has no `match`.
pub fn match_conditions(
    step: &MigrationStep,
    references: &ReferenceResolver,
    fallback_key: &str,
    action: &str,
) -> Result<(Value, bool), StepError> {
    let conditions = match (step.param("match"), step.param(fallback_key)) {
        (Some(conditions), _) => conditions.clone(),
        (None, Some(value)) => serde_json::json!({ fallback_key: value }),
        (None, None) => {
            return Err(StepError::InvalidStepDefinition(format!(
                "a '{}' or a match condition is required to {} it",
                fallback_key, action
            )))
        }
    };

    let conditions = references.resolve_references_recursively(&conditions)?;
    let tolerate_misses = match step.param("match_tolerate_misses") {
        Some(value) => references.resolve_reference(value)?.as_bool().unwrap_or(false),
        None => false,
    };
    Ok((conditions, tolerate_misses))
}
