//! Bounded retry queue for transient write failures
//!
//! Bounded two ways: at most `max_queue_size` entries (the oldest is evicted
//! to admit a new one) and no entry older than `max_age` is ever attempted.
//!
//! A drain pass takes the queued entries out, attempts each exactly once in
//! FIFO order without holding the lock, and puts the transient failures back
//! at the front. Only one drain runs at a time; a drain requested while
//! another is in progress returns an empty report.

use crate::model::{EntityReference, TransformedRecord};
use crate::sink::WriteOutcome;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryItem {
    pub record: TransformedRecord,
    pub first_failure_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub attempts: u32,
}

/// What one drain pass did.
#[derive(Debug, Default)]
pub struct DrainReport {
    pub succeeded: usize,
    /// Transient failures, still queued
    pub failed: usize,
    /// Dropped unattempted for exceeding `max_age`
    pub expired: usize,
    /// Discarded by the write function without an attempt
    pub discarded: usize,
    /// Evicted while re-queueing failures
    pub evicted: usize,
    /// Records written during this pass
    pub written: Vec<TransformedRecord>,
    /// Records whose retry failed non-transiently, for the caller to route
    pub diverted: Vec<(TransformedRecord, WriteOutcome)>,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed + self.diverted.len()
    }
}

#[derive(Debug)]
pub struct RetryQueue {
    max_queue_size: usize,
    max_age: Duration,
    items: Mutex<VecDeque<RetryItem>>,
    draining: AtomicBool,
}

/// Clears the draining flag even if a write future panics.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetryQueue {
    pub fn new(max_queue_size: usize, max_age: Duration) -> Self {
        Self {
            max_queue_size: max_queue_size.max(1),
            max_age,
            items: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<RetryItem>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, key: &EntityReference) -> bool {
        self.lock().iter().any(|item| item.record.key() == *key)
    }

    /// Queue a record after a failed attempt at `now`.
    ///
    /// An entry for the same key is merged in place (the newer revision wins
    /// field by field) and keeps its age.
    /// Returns `true` if the oldest entry had to be evicted.
    pub fn enqueue(&self, record: TransformedRecord, now: DateTime<Utc>) -> bool {
        let key = record.key();
        let mut items = self.lock();

        if let Some(existing) = items.iter_mut().find(|item| item.record.key() == key) {
            existing.record = existing.record.clone().merged(record);
            existing.last_attempt_at = now;
            existing.attempts += 1;
            return false;
        }

        let evicted = if items.len() >= self.max_queue_size {
            if let Some(old) = items.pop_front() {
                tracing::warn!(
                    target: crate::TRACING_TARGET_RETRY,
                    external_id = %old.record.external_id,
                    attempts = old.attempts,
                    "retry queue full, evicting oldest entry"
                );
            }
            true
        } else {
            false
        };

        items.push_back(RetryItem {
            record,
            first_failure_at: now,
            last_attempt_at: now,
            attempts: 1,
        });
        evicted
    }

    /// Remove the entry for `key`, if queued.
    pub fn remove(&self, key: &EntityReference) -> Option<RetryItem> {
        let mut items = self.lock();
        let pos = items.iter().position(|item| item.record.key() == *key)?;
        items.remove(pos)
    }

    /// Remove the entry for `key` if it is older than `revision`.
    pub fn remove_older_than(&self, key: &EntityReference, revision: u64) -> Option<RetryItem> {
        let mut items = self.lock();
        let pos = items
            .iter()
            .position(|item| item.record.key() == *key && item.record.revision < revision)?;
        items.remove(pos)
    }

    /// Attempt every queued entry once.
    ///
    /// `write` returns `None` when it discarded the record without writing
    /// it (e.g. a newer copy already exists).
    pub async fn drain_once<F, Fut>(&self, now: DateTime<Utc>, mut write: F) -> DrainReport
    where
        F: FnMut(TransformedRecord) -> Fut,
        Fut: Future<Output = Option<WriteOutcome>>,
    {
        let mut report = DrainReport::default();
        if self.draining.swap(true, Ordering::Acquire) {
            return report;
        }
        let _guard = DrainGuard(&self.draining);

        let pending: Vec<RetryItem> = self.lock().drain(..).collect();
        let mut keep = Vec::new();

        for mut item in pending {
            if now - item.first_failure_at > self.max_age {
                tracing::warn!(
                    target: crate::TRACING_TARGET_RETRY,
                    external_id = %item.record.external_id,
                    attempts = item.attempts,
                    "retry entry exceeded max age, dropping"
                );
                report.expired += 1;
                continue;
            }

            match write(item.record.clone()).await {
                None => report.discarded += 1,
                Some(WriteOutcome::Accepted) => {
                    report.succeeded += 1;
                    report.written.push(item.record);
                }
                Some(WriteOutcome::Transient(reason)) => {
                    tracing::debug!(
                        target: crate::TRACING_TARGET_RETRY,
                        external_id = %item.record.external_id,
                        attempts = item.attempts + 1,
                        reason = %reason,
                        "retry failed"
                    );
                    item.attempts += 1;
                    item.last_attempt_at = now;
                    report.failed += 1;
                    keep.push(item);
                }
                Some(outcome) => report.diverted.push((item.record, outcome)),
            }
        }

        let mut items = self.lock();
        for item in keep.into_iter().rev() {
            let key = item.record.key();
            // A copy queued during the pass absorbs this one and its age
            match items.iter_mut().find(|queued| queued.record.key() == key) {
                Some(queued) => {
                    queued.first_failure_at = queued.first_failure_at.min(item.first_failure_at);
                    queued.attempts += item.attempts;
                    queued.record = queued.record.clone().merged(item.record);
                }
                None => items.push_front(item),
            }
        }
        while items.len() > self.max_queue_size {
            items.pop_front();
            report.evicted += 1;
        }

        report
    }
}
