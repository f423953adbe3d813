//! Scalar normalization for payload values
//!
//! Timestamps become UTC instants (rendered with millisecond precision),
//! booleans follow the mapping's sink convention, numbers must be finite.

use crate::config::BooleanConvention;
use crate::model::{PropertyValue, ValidationError};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// Strings treated as `true` by scalar-numeric sinks.
const TRUE_WORDS: &[&str] = &[
    "on", "yes", "true", "active", "enabled", "open", "high", "online", "arm", "armed",
];

/// Strings treated as `false` by scalar-numeric sinks.
const FALSE_WORDS: &[&str] = &[
    "off", "no", "false", "inactive", "disabled", "closed", "low", "offline", "disarm", "disarmed",
];

/// Keys whose value is a point in time.
pub fn is_timestamp_key(key: &str, extra: &[String]) -> bool {
    let lower = key.to_ascii_lowercase();
    lower.ends_with("time") || lower.ends_with("timestamp") || extra.iter().any(|k| k == key)
}

/// Parse epoch milliseconds or an ISO-8601 string. `Null` yields `None`.
pub fn parse_timestamp(
    field: &str,
    value: &Value,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    let invalid = || ValidationError::InvalidTimestamp {
        field: field.to_string(),
        value: value.to_string(),
    };

    match value {
        Value::Null => Ok(None),
        Value::Number(n) => {
            let millis = match n.as_i64() {
                Some(i) => i,
                None => {
                    let f = n.as_f64().ok_or_else(invalid)?;
                    if !f.is_finite() {
                        return Err(ValidationError::NonFiniteNumber(field.to_string()));
                    }
                    f.round() as i64
                }
            };
            DateTime::from_timestamp_millis(millis).map(Some).ok_or_else(invalid)
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Ok(Some(ts.with_timezone(&Utc)));
            }
            // Offset-less ISO strings are taken as UTC
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| Some(naive.and_utc()))
                .map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

/// Epoch milliseconds of a timestamp value, if it is one.
pub fn epoch_millis(value: &Value) -> Option<i64> {
    parse_timestamp("", value).ok().flatten().map(|ts| ts.timestamp_millis())
}

/// Normalize a non-relation, non-timestamp payload value.
///
/// `Null` yields `None` (the property is omitted). Arrays and objects are
/// kept as their compact JSON text.
pub fn normalize_scalar(
    field: &str,
    value: &Value,
    booleans: BooleanConvention,
) -> Result<Option<PropertyValue>, ValidationError> {
    let normalized = match value {
        Value::Null => return Ok(None),
        Value::Bool(b) => match booleans {
            BooleanConvention::Native => PropertyValue::Bool(*b),
            BooleanConvention::Numeric => PropertyValue::Int(i64::from(*b)),
        },
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                PropertyValue::Int(i)
            } else {
                let f = n
                    .as_f64()
                    .ok_or_else(|| ValidationError::NonFiniteNumber(field.to_string()))?;
                if !f.is_finite() {
                    return Err(ValidationError::NonFiniteNumber(field.to_string()));
                }
                PropertyValue::Float(f)
            }
        }
        Value::String(s) => match booleans {
            BooleanConvention::Numeric => match boolean_word(s) {
                Some(b) => PropertyValue::Int(i64::from(b)),
                None => PropertyValue::String(s.clone()),
            },
            BooleanConvention::Native => PropertyValue::String(s.clone()),
        },
        Value::Array(_) | Value::Object(_) => PropertyValue::String(value.to_string()),
    };
    Ok(Some(normalized))
}

fn boolean_word(s: &str) -> Option<bool> {
    let lower = s.trim().to_ascii_lowercase();
    if TRUE_WORDS.contains(&lower.as_str()) {
        Some(true)
    } else if FALSE_WORDS.contains(&lower.as_str()) {
        Some(false)
    } else {
        None
    }
}
