//! Numeric helpers for budget and spend figures.
//!
//! The backend hands these out as JSON numbers, numeric strings, or null
//! depending on the column type and the path (query, push, issuer), so
//! decoding is deliberately lenient.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Remaining credit for a budget and spend, never negative.
///
/// A non-finite difference (NaN from a garbled figure) also yields zero.
pub fn clamp_balance(budget: f64, spend: f64) -> f64 {
    let remaining = budget - spend;
    if remaining.is_finite() {
        remaining.max(0.0)
    } else {
        0.0
    }
}

/// Clamp a pre-computed balance into the non-negative range.
pub fn non_negative(value: f64) -> f64 {
    clamp_balance(value, 0.0)
}

/// Interpret a JSON value as a number.
///
/// Returns `None` for null, booleans, objects, and strings that do not parse.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Deserialize an optional amount; unusable values decode as `None`.
pub fn lenient_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value_as_f64(&value))
}

/// Deserialize an amount where missing or null means zero.
pub fn lenient_zero<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_opt(deserializer)?.unwrap_or(0.0))
}
