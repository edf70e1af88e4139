//! Coercion of loosely typed values into point state
//!
//! Used both for `presentValue` in extension files and for inbound writes.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    #[error("expected {expected}, got {got}")]
    Type { expected: &'static str, got: String },

    #[error("state {value} outside 1..={max}")]
    OutOfRange { value: u64, max: usize },
}

fn type_error(expected: &'static str, got: &Value) -> ValueError {
    ValueError::Type {
        expected,
        got: got.to_string(),
    }
}

/// `true`/`false`, `1`/`0`, or `"active"`/`"inactive"`
pub fn coerce_binary(value: &Value) -> Result<bool, ValueError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(type_error("binary value", value)),
        },
        Value::String(s) if s.eq_ignore_ascii_case("active") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("inactive") => Ok(false),
        _ => Err(type_error("binary value", value)),
    }
}

pub fn coerce_real(value: &Value) -> Result<f32, ValueError> {
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .map(|v| v as f32)
        .ok_or_else(|| type_error("number", value))
}

/// 1-based state index bounded by `states`
pub fn coerce_state(value: &Value, states: usize) -> Result<u32, ValueError> {
    let n = value
        .as_u64()
        .ok_or_else(|| type_error("state number", value))?;
    if n == 0 || n > states as u64 {
        return Err(ValueError::OutOfRange {
            value: n,
            max: states,
        });
    }
    u32::try_from(n).map_err(|_| ValueError::OutOfRange {
        value: n,
        max: states,
    })
}
