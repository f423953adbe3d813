//! Payload → record transformation
//!
//! Pure mapping from one `RawMessage` and its topic mapping to a
//! `TransformedRecord`. No I/O and no shared state, so it is safe to call
//! from any number of workers at once.
//!
//! - `externalId` / `external_id` is the record identifier
//! - `<name>ExternalId` keys become the relation `<name>`
//! - objects carrying an `externalId` become relations under their own key
//! - everything else is a normalized scalar property

pub mod normalize;

use crate::config::TopicMapping;
use crate::model::{
    sanitize_identifier, EntityReference, PrefixTable, PropertyValue, RawMessage, RelationValue,
    TransformedRecord, ValidationError,
};
use normalize::{epoch_millis, is_timestamp_key, normalize_scalar, parse_timestamp};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Accepted spellings of the identifier field.
pub const IDENTIFIER_FIELDS: [&str; 2] = ["externalId", "external_id"];

/// Suffix marking a relation field.
pub const RELATION_SUFFIX: &str = "ExternalId";

/// Fields consulted, in order, when an identifier has to be generated.
const GENERATED_ID_TIME_FIELDS: [&str; 3] = ["startTime", "start_time", "timestamp"];

/// Turns raw payloads into target records.
#[derive(Debug, Clone, Default)]
pub struct Transformer {
    prefixes: PrefixTable,
}

impl Transformer {
    pub fn new(prefixes: PrefixTable) -> Self {
        Self { prefixes }
    }

    pub fn prefixes(&self) -> &PrefixTable {
        &self.prefixes
    }

    /// Transform one message under the mapping its topic resolved to.
    pub fn transform(
        &self,
        raw: &RawMessage,
        mapping: &TopicMapping,
    ) -> Result<TransformedRecord, ValidationError> {
        let raw_id = self.identifier(raw, mapping)?;
        let external_id =
            sanitize_identifier(&raw_id, mapping.type_prefix.as_deref(), &self.prefixes)?;
        let relation_space = mapping.relation_space();

        let mut properties = BTreeMap::new();
        let mut relations = BTreeMap::new();

        for (key, value) in &raw.payload {
            if IDENTIFIER_FIELDS.contains(&key.as_str()) {
                continue;
            }

            if let Some(name) = key.strip_suffix(RELATION_SUFFIX) {
                if name.is_empty() {
                    return Err(ValidationError::InvalidReference(key.clone()));
                }
                if let Some(rel) = self.relation(key, name, value, relation_space)? {
                    relations.insert(name.to_string(), rel);
                }
                continue;
            }

            if let Value::Object(obj) = value {
                if obj.contains_key("externalId") {
                    let reference = self.object_reference(key, key, obj, relation_space)?;
                    relations.insert(key.clone(), RelationValue::Single(reference));
                    continue;
                }
            }

            if is_timestamp_key(key, &mapping.timestamp_fields) {
                if let Some(ts) = parse_timestamp(key, value)? {
                    properties.insert(key.clone(), PropertyValue::Timestamp(ts));
                }
                continue;
            }

            if let Some(prop) = normalize_scalar(key, value, mapping.booleans)? {
                properties.insert(key.clone(), prop);
            }
        }

        Ok(TransformedRecord {
            external_id,
            target_kind: mapping.target(),
            space: mapping.space.clone(),
            properties,
            relations,
            source_topic: raw.topic.clone(),
            revision: 0,
        })
    }

    /// The raw (unsanitized) identifier, generated if the mapping allows it.
    fn identifier(
        &self,
        raw: &RawMessage,
        mapping: &TopicMapping,
    ) -> Result<String, ValidationError> {
        let found = IDENTIFIER_FIELDS
            .iter()
            .find_map(|field| raw.payload.get(*field).map(|v| (*field, v)))
            .filter(|(_, v)| !is_blank(v));

        match found {
            Some((_, Value::String(s))) => Ok(s.trim().to_string()),
            Some((_, Value::Number(n))) => Ok(n.to_string()),
            Some((field, _)) => Err(ValidationError::InvalidIdentifier(field.to_string())),
            None if mapping.generate_missing_id => {
                let millis = GENERATED_ID_TIME_FIELDS
                    .iter()
                    .find_map(|f| raw.payload.get(*f).and_then(epoch_millis))
                    .ok_or(ValidationError::MissingIdentifier)?;
                Ok(format!("{}_{}", topic_stem(&raw.topic), millis))
            }
            None => Err(ValidationError::MissingIdentifier),
        }
    }

    /// Relation from a `<name>ExternalId` field. `None` when there is
    /// nothing to reference (null, empty string, empty list).
    fn relation(
        &self,
        field: &str,
        name: &str,
        value: &Value,
        space: &str,
    ) -> Result<Option<RelationValue>, ValidationError> {
        match value {
            Value::Array(items) => {
                let mut refs = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(r) = self.reference(field, name, item, space)? {
                        refs.push(r);
                    }
                }
                Ok((!refs.is_empty()).then_some(RelationValue::List(refs)))
            }
            other => Ok(self.reference(field, name, other, space)?.map(RelationValue::Single)),
        }
    }

    fn reference(
        &self,
        field: &str,
        name: &str,
        value: &Value,
        space: &str,
    ) -> Result<Option<EntityReference>, ValidationError> {
        let raw_id = match value {
            v if is_blank(v) => return Ok(None),
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Object(obj) => return self.object_reference(field, name, obj, space).map(Some),
            _ => return Err(ValidationError::InvalidReference(field.to_string())),
        };
        let external_id = sanitize_identifier(&raw_id, self.relation_prefix(name), &self.prefixes)?;
        Ok(Some(EntityReference::new(space, external_id)))
    }

    /// `{ "externalId": .., "space"?: .. }`; the space defaults to `space`.
    fn object_reference(
        &self,
        field: &str,
        name: &str,
        obj: &Map<String, Value>,
        space: &str,
    ) -> Result<EntityReference, ValidationError> {
        let raw_id = match obj.get("externalId") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(ValidationError::InvalidReference(field.to_string())),
        };
        let space = match obj.get("space") {
            Some(Value::String(s)) if !s.is_empty() => s.as_str(),
            None | Some(Value::Null) => space,
            Some(_) => return Err(ValidationError::InvalidReference(field.to_string())),
        };
        let external_id = sanitize_identifier(&raw_id, self.relation_prefix(name), &self.prefixes)?;
        Ok(EntityReference::new(space, external_id))
    }

    /// Prefix for a relation name; plural names fall back to the singular kind.
    fn relation_prefix(&self, name: &str) -> Option<&str> {
        self.prefixes
            .prefix_for(name)
            .or_else(|| {
                name.strip_suffix('s')
                    .and_then(|singular| self.prefixes.prefix_for(singular))
            })
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Topic reduced to an identifier stem: a leading `states/` is dropped and
/// levels are joined with `_`.
fn topic_stem(topic: &str) -> String {
    topic.strip_prefix("states/").unwrap_or(topic).replace('/', "_")
}
