//! Write sink seam and outcome classification
//!
//! The sink is the interface through which the pipeline pushes records into
//! the target store. `write()` never fails outright: every result, including
//! transport errors, is folded into a `WriteOutcome` the pipeline routes on.

pub mod graph;

use crate::model::{EntityReference, TransformedRecord};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

pub use graph::GraphSink;

/// Result of one write attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Accepted,
    /// Relation targets that do not exist in the store (may be empty if the
    /// store did not say which)
    MissingReference(Vec<EntityReference>),
    /// Worth retrying later
    Transient(String),
    /// Will never succeed as-is
    Permanent(String),
}

impl WriteOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

impl std::fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::MissingReference(refs) => {
                let refs: Vec<String> = refs.iter().map(ToString::to_string).collect();
                write!(f, "missing references [{}]", refs.join(", "))
            }
            Self::Transient(msg) => write!(f, "transient: {}", msg),
            Self::Permanent(msg) => write!(f, "permanent: {}", msg),
        }
    }
}

/// Transport-level failures inside a sink implementation.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request timed out")]
    Timeout,
    #[error("unreadable response: {0}")]
    Response(String),
}

impl From<SinkError> for WriteOutcome {
    fn from(err: SinkError) -> Self {
        WriteOutcome::Transient(err.to_string())
    }
}

/// The interface through which the pipeline writes records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Upsert one record, keyed by `(space, external_id)`.
    async fn write(&self, record: &TransformedRecord) -> WriteOutcome;
}

#[async_trait]
impl<S: RecordSink + ?Sized> RecordSink for Arc<S> {
    async fn write(&self, record: &TransformedRecord) -> WriteOutcome {
        (**self).write(record).await
    }
}

/// Map an HTTP-style status and response body onto a `WriteOutcome`.
///
/// 4xx bodies of the form `{"error": {"missing": [{"space", "externalId"}]}}`
/// report absent relation targets.
pub fn classify_response(status: u16, body: &str) -> WriteOutcome {
    match status {
        200..=299 => WriteOutcome::Accepted,
        429 | 500..=599 => WriteOutcome::Transient(format!("status {}", status)),
        400..=499 => match missing_references(body) {
            Some(refs) => WriteOutcome::MissingReference(refs),
            None => WriteOutcome::Permanent(format!("status {}: {}", status, error_message(body))),
        },
        // Neither an error nor an acceptance; try again later
        _ => WriteOutcome::Transient(format!("unexpected status {}", status)),
    }
}

fn missing_references(body: &str) -> Option<Vec<EntityReference>> {
    let value: Value = serde_json::from_str(body).ok()?;
    let missing = value.get("error")?.get("missing")?.as_array()?;
    if missing.is_empty() {
        return None;
    }
    Some(
        missing
            .iter()
            .filter_map(|m| serde_json::from_value::<EntityReference>(m.clone()).ok())
            .collect(),
    )
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error")?.get("message")?.as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_codes_are_accepted() {
        assert_eq!(classify_response(200, ""), WriteOutcome::Accepted);
        assert_eq!(classify_response(202, ""), WriteOutcome::Accepted);
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert!(matches!(classify_response(429, ""), WriteOutcome::Transient(_)));
        assert!(matches!(classify_response(503, ""), WriteOutcome::Transient(_)));
        assert!(matches!(classify_response(304, ""), WriteOutcome::Transient(_)));
    }

    #[test]
    fn missing_targets_are_reported() {
        let body = r#"{"error":{"code":400,"message":"Cannot auto-create",
            "missing":[{"space":"inst","externalId":"haf_1"}]}}"#;
        assert_eq!(
            classify_response(400, body),
            WriteOutcome::MissingReference(vec![EntityReference::new("inst", "haf_1")])
        );
    }

    #[test]
    fn other_client_errors_are_permanent() {
        let body = r#"{"error":{"code":400,"message":"bad property type"}}"#;
        assert_eq!(
            classify_response(400, body),
            WriteOutcome::Permanent("status 400: bad property type".into())
        );
        assert!(matches!(classify_response(403, "nope"), WriteOutcome::Permanent(_)));
    }

    #[test]
    fn transport_errors_are_transient() {
        let outcome: WriteOutcome = SinkError::Timeout.into();
        assert!(matches!(outcome, WriteOutcome::Transient(_)));
    }
}
