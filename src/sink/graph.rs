//! In-memory referential-integrity store
//!
//! Accepts a record only when every record its relations point at already
//! exists. Used by `graphbridge replay` and as a realistic sink in tests.

use super::{RecordSink, WriteOutcome};
use crate::model::{EntityReference, TransformedRecord};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct GraphSink {
    records: DashMap<EntityReference, TransformedRecord>,
    rejected: AtomicUsize,
}

impl GraphSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record without integrity checks.
    pub fn seed(&self, record: TransformedRecord) {
        self.records.insert(record.key(), record);
    }

    pub fn get(&self, key: &EntityReference) -> Option<TransformedRecord> {
        self.records.get(key).map(|r| r.value().clone())
    }

    pub fn contains(&self, key: &EntityReference) -> bool {
        self.records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Writes rejected for missing relation targets so far.
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RecordSink for GraphSink {
    async fn write(&self, record: &TransformedRecord) -> WriteOutcome {
        let key = record.key();
        let missing: Vec<EntityReference> = record
            .references()
            .into_iter()
            .filter(|r| *r != key && !self.records.contains_key(r))
            .collect();

        if !missing.is_empty() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return WriteOutcome::MissingReference(missing);
        }

        self.records.insert(key, record.clone());
        WriteOutcome::Accepted
    }
}
