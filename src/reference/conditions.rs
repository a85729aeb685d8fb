use super::{ReferenceError, ReferenceResolver};
use serde_json::Value;
use std::cmp::Ordering;

/// Evaluate a condition tree against the current references.
///
/// ```yaml
/// if:
///     "reference:count": { gt: 0 }
///     or:
///         - "reference:env": { eq: prod }
///         - "reference:env": { in: [staging, prod] }
/// ```
///
/// Every entry of a condition object must hold.
pub fn matches_conditions(
    conditions: &Value,
    resolver: &ReferenceResolver,
) -> Result<bool, ReferenceError> {
    let map = conditions.as_object().ok_or_else(|| {
        ReferenceError::InvalidCondition("conditions must be a mapping".to_string())
    })?;

    for (key, condition) in map {
        let holds = match key.as_str() {
            "and" => {
                let mut all = true;
                for item in as_list(key, condition)? {
                    if !matches_conditions(item, resolver)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "or" => {
                let mut any = false;
                for item in as_list(key, condition)? {
                    if matches_conditions(item, resolver)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            _ => {
                let operand = resolver.resolve_reference(&Value::String(key.clone()))?;
                matches_operand(&operand, condition, resolver)?
            }
        };

        if !holds {
            return Ok(false);
        }
    }

    Ok(true)
}

fn as_list<'a>(key: &str, value: &'a Value) -> Result<&'a Vec<Value>, ReferenceError> {
    value.as_array().ok_or_else(|| {
        ReferenceError::InvalidCondition(format!("'{}' expects a list of conditions", key))
    })
}

fn matches_operand(
    operand: &Value,
    condition: &Value,
    resolver: &ReferenceResolver,
) -> Result<bool, ReferenceError> {
    let map = condition.as_object().ok_or_else(|| {
        ReferenceError::InvalidCondition("a condition must map an operator to a value".to_string())
    })?;

    for (op, expected) in map {
        let expected = resolver.resolve_references_recursively(expected)?;
        let holds = match op.as_str() {
            "eq" | "=" | "==" => loosely_equal(operand, &expected),
            "ne" | "!=" => !loosely_equal(operand, &expected),
            "gt" | ">" => compare(operand, &expected)? == Ordering::Greater,
            "gte" | ">=" => compare(operand, &expected)? != Ordering::Less,
            "lt" | "<" => compare(operand, &expected)? == Ordering::Less,
            "lte" | "<=" => compare(operand, &expected)? != Ordering::Greater,
            "in" => contains(&expected, operand)?,
            "not_in" => !contains(&expected, operand)?,
            other => {
                return Err(ReferenceError::InvalidCondition(format!(
                    "unknown operator '{}'",
                    other
                )))
            }
        };
        if !holds {
            return Ok(false);
        }
    }

    Ok(true)
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Result<Ordering, ReferenceError> {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => left
            .as_f64()
            .zip(right.as_f64())
            .and_then(|(l, r)| l.partial_cmp(&r))
            .ok_or_else(|| ReferenceError::InvalidCondition("numbers are not comparable".to_string())),
        (Value::String(l), Value::String(r)) => Ok(l.cmp(r)),
        _ => Err(ReferenceError::InvalidCondition(format!(
            "can not compare {} with {}",
            left, right
        ))),
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, ReferenceError> {
    let items = haystack.as_array().ok_or_else(|| {
        ReferenceError::InvalidCondition("'in' and 'not_in' expect a list".to_string())
    })?;
    Ok(items.iter().any(|item| loosely_equal(item, needle)))
}
