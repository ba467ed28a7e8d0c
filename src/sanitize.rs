//! Guards ambient server data against prototype pollution before it is
//! handed to render functions inside the sandbox.
//!
//! Rejects dangerous keys like `__proto__`, `constructor`, and `prototype`
//! anywhere in the tree, and bounds nesting depth.

use crate::error::SerializeError;
use serde_json::{Map, Value};

/// Maximum recursion depth for nested objects/arrays
pub const MAX_DEPTH: usize = 32;

/// Keys that could be used for prototype pollution
const DANGEROUS_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Check every ambient field, erroring on the first dangerous key.
///
/// # Errors
/// Returns an error if:
/// - A dangerous key (`__proto__`, `constructor`, `prototype`) is found
/// - Nesting depth exceeds [`MAX_DEPTH`]
pub fn check_fields(fields: &Map<String, Value>) -> Result<(), SerializeError> {
    check_object(fields, 0)
}

fn check_object(map: &Map<String, Value>, depth: usize) -> Result<(), SerializeError> {
    if depth > MAX_DEPTH {
        return Err(SerializeError::TooDeep { max: MAX_DEPTH });
    }
    for (key, value) in map {
        if DANGEROUS_KEYS.contains(&key.as_str()) {
            return Err(SerializeError::ForbiddenKey { key: key.clone() });
        }
        check_value(value, depth + 1)?;
    }
    Ok(())
}

fn check_value(value: &Value, depth: usize) -> Result<(), SerializeError> {
    if depth > MAX_DEPTH {
        return Err(SerializeError::TooDeep { max: MAX_DEPTH });
    }
    match value {
        Value::Object(map) => check_object(map, depth),
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| check_value(item, depth + 1)),
        // Primitives are safe
        _ => Ok(()),
    }
}
