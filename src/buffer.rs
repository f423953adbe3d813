//! Dependency buffer
//!
//! Holds records whose relation targets are not yet known to exist. An item
//! leaves the buffer in one of three ways:
//!
//! - every missing target is written (`on_dependency_resolved`)
//! - its deadline passes (`sweep`), returning a degraded copy with the
//!   unresolved relations dropped
//! - it is evicted by capacity, also as a degraded copy
//!
//! Deadlines are fixed at submission and never extended. The buffer itself
//! is not synchronized; the pipeline guards it with a mutex.

use crate::model::{EntityReference, TransformedRecord};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedItem {
    pub record: TransformedRecord,
    pub missing_refs: BTreeSet<EntityReference>,
    pub enqueued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BufferedItem {
    /// The record with every still-missing relation target removed.
    pub fn degraded(&self) -> TransformedRecord {
        self.record.without_references(&self.missing_refs)
    }
}

#[derive(Debug)]
pub struct DependencyBuffer {
    timeout: Duration,
    max_items: Option<usize>,
    items: HashMap<EntityReference, BufferedItem>,
    /// missing reference → keys of the items waiting on it
    waiting: HashMap<EntityReference, BTreeSet<EntityReference>>,
}

impl DependencyBuffer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_items: None,
            items: HashMap::new(),
            waiting: HashMap::new(),
        }
    }

    pub fn with_max_items(mut self, max_items: Option<usize>) -> Self {
        self.max_items = max_items.filter(|n| *n > 0);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, key: &EntityReference) -> bool {
        self.items.contains_key(key)
    }

    pub fn get(&self, key: &EntityReference) -> Option<&BufferedItem> {
        self.items.get(key)
    }

    /// Buffer a record until `missing_refs` exist.
    ///
    /// A previous item for the same key is replaced. When the buffer is full
    /// the item closest to expiry is evicted and returned in degraded form
    /// so the caller can flush it.
    pub fn submit(
        &mut self,
        record: TransformedRecord,
        missing_refs: BTreeSet<EntityReference>,
        now: DateTime<Utc>,
    ) -> Option<TransformedRecord> {
        let key = record.key();
        self.remove(&key);

        let evicted = match self.max_items {
            Some(max) if self.items.len() >= max => self.evict_earliest(),
            _ => None,
        };

        for r in &missing_refs {
            self.waiting.entry(r.clone()).or_default().insert(key.clone());
        }
        self.items.insert(
            key,
            BufferedItem {
                record,
                missing_refs,
                enqueued_at: now,
                expires_at: now + self.timeout,
            },
        );

        evicted
    }

    /// `reference` now exists. Returns every record no longer waiting on
    /// anything, removing them from the buffer.
    pub fn on_dependency_resolved(
        &mut self,
        reference: &EntityReference,
    ) -> Vec<TransformedRecord> {
        let Some(keys) = self.waiting.remove(reference) else {
            return Vec::new();
        };

        let mut ready = Vec::new();
        for key in keys {
            let complete = match self.items.get_mut(&key) {
                Some(item) => {
                    item.missing_refs.remove(reference);
                    item.missing_refs.is_empty()
                }
                None => false,
            };
            if complete {
                if let Some(item) = self.remove(&key) {
                    ready.push(item.record);
                }
            }
        }
        ready
    }

    /// Remove every item whose deadline has passed and return degraded
    /// copies, earliest deadline first.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<TransformedRecord> {
        let mut expired: Vec<(DateTime<Utc>, EntityReference)> = self
            .items
            .iter()
            .filter(|(_, item)| item.expires_at <= now)
            .map(|(key, item)| (item.expires_at, key.clone()))
            .collect();
        expired.sort();

        expired
            .into_iter()
            .filter_map(|(_, key)| self.remove(&key))
            .map(|item| item.degraded())
            .collect()
    }

    /// Remove an item by record key, e.g. when a newer copy supersedes it.
    pub fn remove(&mut self, key: &EntityReference) -> Option<BufferedItem> {
        let item = self.items.remove(key)?;
        for r in &item.missing_refs {
            if let Some(keys) = self.waiting.get_mut(r) {
                keys.remove(key);
                if keys.is_empty() {
                    self.waiting.remove(r);
                }
            }
        }
        Some(item)
    }

    fn evict_earliest(&mut self) -> Option<TransformedRecord> {
        let key = self
            .items
            .iter()
            .min_by(|a, b| a.1.expires_at.cmp(&b.1.expires_at).then_with(|| a.0.cmp(b.0)))
            .map(|(key, _)| key.clone())?;
        self.remove(&key).map(|item| item.degraded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RelationValue, TargetKind};
    use std::collections::BTreeMap;

    fn r(id: &str) -> EntityReference {
        EntityReference::new("inst", id)
    }

    fn event(id: &str, frame: &str, assets: &[&str]) -> TransformedRecord {
        let mut relations = BTreeMap::new();
        relations.insert("frame".to_string(), RelationValue::Single(r(frame)));
        if !assets.is_empty() {
            relations.insert(
                "assets".to_string(),
                RelationValue::List(assets.iter().map(|a| r(a)).collect()),
            );
        }
        TransformedRecord {
            external_id: id.into(),
            target_kind: TargetKind {
                external_id: "haAlarmEvent".into(),
                space: "schema".into(),
                version: None,
            },
            space: "inst".into(),
            properties: BTreeMap::new(),
            relations,
            source_topic: "events".into(),
            revision: 0,
        }
    }

    fn refs(ids: &[&str]) -> BTreeSet<EntityReference> {
        ids.iter().map(|i| r(i)).collect()
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn resolution_releases_record_once() {
        let mut buffer = DependencyBuffer::new(Duration::seconds(300));
        let record = event("hal_1", "haf_1", &["haa_1"]);
        buffer.submit(record.clone(), refs(&["haf_1", "haa_1"]), t(0));

        assert!(buffer.on_dependency_resolved(&r("haf_1")).is_empty());
        assert_eq!(buffer.get(&r("hal_1")).unwrap().missing_refs, refs(&["haa_1"]));

        let ready = buffer.on_dependency_resolved(&r("haa_1"));
        assert_eq!(ready, vec![record]);
        assert!(buffer.is_empty());
        assert!(buffer.on_dependency_resolved(&r("haa_1")).is_empty());
    }

    #[test]
    fn one_reference_releases_many_waiters() {
        let mut buffer = DependencyBuffer::new(Duration::seconds(300));
        buffer.submit(event("hal_1", "haf_1", &[]), refs(&["haf_1"]), t(0));
        buffer.submit(event("hal_2", "haf_1", &[]), refs(&["haf_1"]), t(1));

        let ready = buffer.on_dependency_resolved(&r("haf_1"));
        assert_eq!(ready.len(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn newer_submission_replaces_older() {
        let mut buffer = DependencyBuffer::new(Duration::seconds(300));
        buffer.submit(event("hal_1", "haf_old", &[]), refs(&["haf_old"]), t(0));
        buffer.submit(event("hal_1", "haf_new", &[]), refs(&["haf_new"]), t(10));

        assert_eq!(buffer.len(), 1);
        assert!(buffer.on_dependency_resolved(&r("haf_old")).is_empty());
        assert_eq!(buffer.get(&r("hal_1")).unwrap().expires_at, t(310));
        assert_eq!(buffer.on_dependency_resolved(&r("haf_new")).len(), 1);
    }

    #[test]
    fn sweep_returns_degraded_records_at_deadline() {
        let mut buffer = DependencyBuffer::new(Duration::seconds(300));
        buffer.submit(
            event("hal_1", "haf_1", &["haa_1", "haa_2"]),
            refs(&["haf_1", "haa_2"]),
            t(0),
        );
        buffer.submit(event("hal_2", "haf_2", &[]), refs(&["haf_2"]), t(100));

        assert!(buffer.sweep(t(299)).is_empty());

        let flushed = buffer.sweep(t(300));
        assert_eq!(flushed.len(), 1);
        let degraded = &flushed[0];
        assert_eq!(degraded.external_id, "hal_1");
        assert!(!degraded.relations.contains_key("frame"));
        assert_eq!(degraded.relations["assets"], RelationValue::List(vec![r("haa_1")]));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn full_buffer_evicts_closest_to_expiry() {
        let mut buffer = DependencyBuffer::new(Duration::seconds(300)).with_max_items(Some(2));
        assert!(buffer.submit(event("hal_1", "haf_1", &[]), refs(&["haf_1"]), t(0)).is_none());
        assert!(buffer.submit(event("hal_2", "haf_2", &[]), refs(&["haf_2"]), t(1)).is_none());

        let evicted = buffer.submit(event("hal_3", "haf_3", &[]), refs(&["haf_3"]), t(2)).unwrap();
        assert_eq!(evicted.external_id, "hal_1");
        assert!(evicted.relations.is_empty());
        assert_eq!(buffer.len(), 2);

        // Replacing an existing key never evicts
        assert!(buffer.submit(event("hal_2", "haf_2", &[]), refs(&["haf_2"]), t(3)).is_none());
    }

    #[test]
    fn remove_cleans_reverse_index() {
        let mut buffer = DependencyBuffer::new(Duration::seconds(300));
        buffer.submit(event("hal_1", "haf_1", &[]), refs(&["haf_1"]), t(0));
        assert!(buffer.remove(&r("hal_1")).is_some());
        assert!(buffer.on_dependency_resolved(&r("haf_1")).is_empty());
        assert!(buffer.remove(&r("hal_1")).is_none());
    }
}
