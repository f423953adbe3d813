//! Core record types flowing through the bridge
//!
//! - `RawMessage`: one inbound payload, as delivered by the ingestion side
//! - `EntityReference`: the `(space, externalId)` key of a target record
//! - `TransformedRecord`: a target record plus its direct relations
//!
//! Property values are a closed set of scalar variants so that every record
//! the transformer produces is statically known to be writable.

pub mod id;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub use id::{sanitize_identifier, PrefixTable, FALLBACK_PREFIX, MAX_IDENTIFIER_LEN};

/// Why a payload could not be turned into a record.
///
/// Validation failures are terminal for the message: it is dropped and
/// counted, never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("payload is not valid UTF-8 JSON: {0}")]
    MalformedPayload(String),
    #[error("payload is empty")]
    EmptyPayload,
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no identifier (expected 'externalId' or 'external_id')")]
    MissingIdentifier,
    #[error("identifier field '{0}' must be a string or number")]
    InvalidIdentifier(String),
    #[error("identifier '{0}' sanitizes to an empty string")]
    EmptyIdentifier(String),
    #[error("field '{0}' holds a non-finite number")]
    NonFiniteNumber(String),
    #[error("field '{field}' holds an unparseable timestamp: {value}")]
    InvalidTimestamp { field: String, value: String },
    #[error("relation field '{0}' has an invalid value")]
    InvalidReference(String),
}

/// One inbound message as delivered by the ingestion collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Map<String, Value>,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn new(
        topic: impl Into<String>,
        payload: Map<String, Value>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload,
            received_at,
        }
    }

    /// Decode a wire payload. Only JSON objects are accepted.
    pub fn decode(
        topic: impl Into<String>,
        bytes: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ValidationError::MalformedPayload(e.to_string()))?
            .trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ValidationError::MalformedPayload(e.to_string()))?;
        match value {
            Value::Object(payload) => Ok(Self::new(topic, payload, received_at)),
            _ => Err(ValidationError::NotAnObject),
        }
    }
}

/// Key of a record in the target store. Never owns the referenced record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityReference {
    pub space: String,
    pub external_id: String,
}

impl EntityReference {
    pub fn new(space: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            space: space.into(),
            external_id: external_id.into(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({ "space": self.space, "externalId": self.external_id })
    }
}

impl std::fmt::Display for EntityReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.space, self.external_id)
    }
}

/// The container or view a record is written into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetKind {
    /// Container/view external id (e.g. "haAlarmEvent")
    pub external_id: String,
    /// Space the container/view is defined in
    pub space: String,
    /// View version; containers are unversioned
    pub version: Option<String>,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}/{}/{}", self.space, self.external_id, v),
            None => write!(f, "{}/{}", self.space, self.external_id),
        }
    }
}

/// Scalar property values a record can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl PropertyValue {
    /// Wire rendering. Timestamps are ISO-8601 with millisecond precision.
    pub fn to_json(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Int(i) => json!(i),
            Self::Float(f) => json!(f),
            Self::Bool(b) => Value::Bool(*b),
            Self::Timestamp(ts) => Value::String(format_timestamp(ts)),
        }
    }
}

/// Format a timestamp the way the target store expects it.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A direct relation: one reference or an ordered list of them.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationValue {
    Single(EntityReference),
    List(Vec<EntityReference>),
}

impl RelationValue {
    pub fn references(&self) -> Vec<&EntityReference> {
        match self {
            Self::Single(r) => vec![r],
            Self::List(refs) => refs.iter().collect(),
        }
    }

    /// The relation with `drop` removed, or `None` if nothing remains.
    pub fn without(&self, drop: &BTreeSet<EntityReference>) -> Option<RelationValue> {
        match self {
            Self::Single(r) if drop.contains(r) => None,
            Self::Single(r) => Some(Self::Single(r.clone())),
            Self::List(refs) => {
                let kept: Vec<_> = refs.iter().filter(|r| !drop.contains(r)).cloned().collect();
                if kept.is_empty() {
                    None
                } else {
                    Some(Self::List(kept))
                }
            }
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Single(r) => r.to_json(),
            Self::List(refs) => Value::Array(refs.iter().map(EntityReference::to_json).collect()),
        }
    }
}

/// A record ready to be written to the target store.
///
/// Produced by the transformer from exactly one `RawMessage`. At any moment
/// it is owned by exactly one of: an in-flight write, the dependency buffer,
/// the retry queue.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRecord {
    pub external_id: String,
    pub target_kind: TargetKind,
    pub space: String,
    pub properties: BTreeMap<String, PropertyValue>,
    pub relations: BTreeMap<String, RelationValue>,
    pub source_topic: String,
    /// Arrival order of the originating message, assigned by the pipeline.
    /// A lower revision never overwrites a higher one for the same key.
    pub revision: u64,
}

impl TransformedRecord {
    /// The reference other records use to point at this one.
    pub fn key(&self) -> EntityReference {
        EntityReference::new(self.space.clone(), self.external_id.clone())
    }

    /// Every distinct reference this record's relations point at.
    pub fn references(&self) -> BTreeSet<EntityReference> {
        self.relations
            .values()
            .flat_map(|rel| rel.references().into_iter().cloned())
            .collect()
    }

    /// A copy with the given references removed from every relation.
    /// Relations left empty are dropped entirely.
    pub fn without_references(&self, drop: &BTreeSet<EntityReference>) -> Self {
        let relations = self
            .relations
            .iter()
            .filter_map(|(name, rel)| rel.without(drop).map(|r| (name.clone(), r)))
            .collect();
        Self {
            relations,
            ..self.clone()
        }
    }

    /// Take every property and relation of `older` that this record does not
    /// set itself. Used when a newer copy of the same key replaces a pending
    /// one, so the store still receives the older payload's fields.
    pub fn fill_from(&mut self, older: &TransformedRecord) {
        for (name, value) in &older.properties {
            self.properties.entry(name.clone()).or_insert_with(|| value.clone());
        }
        for (name, rel) in &older.relations {
            self.relations.entry(name.clone()).or_insert_with(|| rel.clone());
        }
    }

    /// Merge two copies of the same key: the higher revision wins field by
    /// field and the result carries it.
    pub fn merged(self, other: TransformedRecord) -> TransformedRecord {
        let (mut newer, older) = if other.revision > self.revision {
            (other, self)
        } else {
            (self, other)
        };
        newer.fill_from(&older);
        newer
    }

    /// Render as a node upsert item: properties and relations share one
    /// property map under a single source.
    pub fn to_node_apply(&self) -> Value {
        let mut props = Map::new();
        for (name, value) in &self.properties {
            props.insert(name.clone(), value.to_json());
        }
        for (name, rel) in &self.relations {
            props.insert(name.clone(), rel.to_json());
        }

        let mut source = Map::new();
        let source_type = if self.target_kind.version.is_some() {
            "view"
        } else {
            "container"
        };
        source.insert("type".to_string(), Value::String(source_type.to_string()));
        source.insert("space".to_string(), Value::String(self.target_kind.space.clone()));
        source.insert(
            "externalId".to_string(),
            Value::String(self.target_kind.external_id.clone()),
        );
        if let Some(version) = &self.target_kind.version {
            source.insert("version".to_string(), Value::String(version.clone()));
        }

        json!({
            "instanceType": "node",
            "space": self.space,
            "externalId": self.external_id,
            "sources": [{ "source": Value::Object(source), "properties": Value::Object(props) }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(relations: Vec<(&str, RelationValue)>) -> TransformedRecord {
        TransformedRecord {
            external_id: "hal_1".into(),
            target_kind: TargetKind {
                external_id: "haAlarmEvent".into(),
                space: "schema".into(),
                version: Some("v1".into()),
            },
            space: "inst".into(),
            properties: BTreeMap::new(),
            relations: relations.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            source_topic: "events/log".into(),
            revision: 0,
        }
    }

    #[test]
    fn decode_accepts_objects_only() {
        let now = Utc::now();
        assert!(RawMessage::decode("t", br#"{"a":1}"#, now).is_ok());
        assert_eq!(RawMessage::decode("t", b"[1,2]", now), Err(ValidationError::NotAnObject));
        assert_eq!(RawMessage::decode("t", b"   ", now), Err(ValidationError::EmptyPayload));
        assert!(matches!(
            RawMessage::decode("t", b"{nope", now),
            Err(ValidationError::MalformedPayload(_))
        ));
        assert!(matches!(
            RawMessage::decode("t", br#"{"v": NaN}"#, now),
            Err(ValidationError::MalformedPayload(_))
        ));
    }

    #[test]
    fn without_references_prunes_lists_and_singles() {
        let frame = EntityReference::new("inst", "haf_1");
        let a1 = EntityReference::new("inst", "haa_1");
        let a2 = EntityReference::new("inst", "haa_2");
        let record = record_with(vec![
            ("frame", RelationValue::Single(frame.clone())),
            ("assets", RelationValue::List(vec![a1.clone(), a2.clone()])),
        ]);

        let drop: BTreeSet<_> = [frame, a1].into_iter().collect();
        let degraded = record.without_references(&drop);

        assert!(!degraded.relations.contains_key("frame"));
        assert_eq!(degraded.relations["assets"], RelationValue::List(vec![a2]));
    }

    #[test]
    fn merge_keeps_fields_only_the_older_copy_has() {
        let mut older = record_with(vec![(
            "frame",
            RelationValue::Single(EntityReference::new("inst", "haf_1")),
        )]);
        older.revision = 1;
        older.properties.insert("alarmText".into(), PropertyValue::String("high temp".into()));
        older.properties.insert("level".into(), PropertyValue::Int(2));

        let mut newer = record_with(vec![]);
        newer.revision = 2;
        newer.properties.insert("ackedBy".into(), PropertyValue::String("ops".into()));
        newer.properties.insert("level".into(), PropertyValue::Int(3));

        // Argument order does not matter, the higher revision wins
        let merged = older.merged(newer);
        assert_eq!(merged.revision, 2);
        assert_eq!(merged.properties["level"], PropertyValue::Int(3));
        assert_eq!(merged.properties["alarmText"], PropertyValue::String("high temp".into()));
        assert_eq!(merged.properties["ackedBy"], PropertyValue::String("ops".into()));
        assert!(merged.relations.contains_key("frame"));
    }

    #[test]
    fn node_apply_uses_view_source_when_versioned() {
        let mut record = record_with(vec![(
            "definition",
            RelationValue::Single(EntityReference::new("inst", "had_9")),
        )]);
        record.properties.insert(
            "startTime".into(),
            PropertyValue::Timestamp(DateTime::from_timestamp_millis(1_700_000_000_123).unwrap()),
        );

        let apply = record.to_node_apply();
        let source = &apply["sources"][0];
        assert_eq!(source["source"]["type"], "view");
        assert_eq!(source["source"]["version"], "v1");
        assert_eq!(source["properties"]["startTime"], "2023-11-14T22:13:20.123Z");
        assert_eq!(source["properties"]["definition"]["externalId"], "had_9");
    }
}
