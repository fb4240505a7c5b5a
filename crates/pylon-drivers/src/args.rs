//! Positional operation arguments.

use pylon_core::{Operation, OperationError};
use serde_json::Value;

/// Argument `index` as a string, or a backend error naming what was expected.
pub fn string<'a>(op: &'a Operation, index: usize, what: &str) -> Result<&'a str, OperationError> {
    match op.args.get(index) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(OperationError::Backend(format!(
            "{}: argument {index} must be the {what}",
            op.name
        ))),
    }
}

/// Argument `index`, or `null` when absent.
pub fn value(op: &Operation, index: usize) -> &Value {
    op.args.get(index).unwrap_or(&Value::Null)
}

/// Bytes for a scalar argument. Structured values are sent as JSON.
pub fn bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::String(s) => s.as_bytes().to_vec(),
        Value::Null => Vec::new(),
        Value::Bool(b) => if *b { b"1".to_vec() } else { b"0".to_vec() },
        Value::Number(n) => n.to_string().into_bytes(),
        Value::Array(_) | Value::Object(_) => value.to_string().into_bytes(),
    }
}

/// Lower-case operation name with `-` folded to `_`.
pub fn command(op: &Operation) -> String {
    op.name.to_ascii_lowercase().replace('-', "_")
}
