//! Per-identifier write gate
//!
//! Serializes writes for the same record key and enforces last-write-wins:
//! each key remembers the highest revision observed for it, and a write
//! carrying a lower revision is refused as superseded.

use crate::model::EntityReference;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
struct Slot {
    latest: AtomicU64,
    written: AtomicBool,
    lock: Arc<Mutex<()>>,
}

/// Held for the duration of one write.
#[derive(Debug)]
pub struct GateGuard {
    slot: Arc<Slot>,
    _lock: OwnedMutexGuard<()>,
}

impl GateGuard {
    /// The key now exists in the store.
    pub fn mark_written(&self) {
        self.slot.written.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct KeyedGate {
    slots: DashMap<EntityReference, Arc<Slot>>,
}

impl KeyedGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &EntityReference) -> Arc<Slot> {
        self.slots.entry(key.clone()).or_default().clone()
    }

    /// Note that `revision` of `key` exists.
    pub fn observe(&self, key: &EntityReference, revision: u64) {
        self.slot(key).latest.fetch_max(revision, Ordering::AcqRel);
    }

    pub fn is_superseded(&self, key: &EntityReference, revision: u64) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| revision < slot.latest.load(Ordering::Acquire))
    }

    /// True if a write for `key` has been accepted since its slot was
    /// created.
    pub fn is_written(&self, key: &EntityReference) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| slot.written.load(Ordering::SeqCst))
    }

    /// Wait for exclusive access to `key`. `None` if a newer revision has
    /// been observed by the time access is granted.
    pub async fn acquire(&self, key: &EntityReference, revision: u64) -> Option<GateGuard> {
        let slot = self.slot(key);
        let lock = slot.lock.clone().lock_owned().await;
        if revision < slot.latest.load(Ordering::Acquire) {
            return None;
        }
        slot.latest.fetch_max(revision, Ordering::AcqRel);
        Some(GateGuard {
            slot,
            _lock: lock,
        })
    }

    /// Drop idle slots. Only safe while no message or write is in flight,
    /// since a dropped slot forgets its latest revision.
    pub fn prune(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| Arc::strong_count(slot) == 1);
        before - self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(id: &str) -> EntityReference {
        EntityReference::new("inst", id)
    }

    #[tokio::test]
    async fn older_revision_is_refused() {
        let gate = KeyedGate::new();
        gate.observe(&key("a"), 2);
        assert!(gate.acquire(&key("a"), 1).await.is_none());
        assert!(gate.is_superseded(&key("a"), 1));
        assert!(gate.acquire(&key("a"), 2).await.is_some());
        assert!(!gate.is_superseded(&key("b"), 0));
    }

    #[tokio::test]
    async fn written_keys_are_remembered() {
        let gate = KeyedGate::new();
        let guard = gate.acquire(&key("a"), 1).await.unwrap();
        assert!(!gate.is_written(&key("a")));
        guard.mark_written();
        drop(guard);
        assert!(gate.is_written(&key("a")));
        assert!(!gate.is_written(&key("b")));
    }

    #[tokio::test]
    async fn same_key_writes_are_serialized() {
        let gate = Arc::new(KeyedGate::new());
        let first = gate.acquire(&key("a"), 1).await.unwrap();

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.acquire(&key("a"), 2).await.is_some() }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // Other keys are not blocked
        assert!(gate.acquire(&key("b"), 1).await.is_some());

        drop(first);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn prune_keeps_held_slots() {
        let gate = KeyedGate::new();
        gate.observe(&key("idle"), 1);
        let held = gate.acquire(&key("busy"), 1).await.unwrap();

        assert_eq!(gate.prune(), 1);
        assert_eq!(gate.len(), 1);
        drop(held);
        assert_eq!(gate.prune(), 1);
        assert!(gate.is_empty());
    }
}
