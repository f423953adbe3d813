//! Debounced, throttled workflow trigger
//!
//! One `DebounceState` per trigger key, created on the first message for
//! the key and kept for the life of the registry. Per key:
//!
//! ```text
//!  Idle ──msg, interval elapsed──────────▶ DebouncePending(at + debounce)
//!  Idle ──msg, inside min interval──────▶ ThrottledPending(last + min_interval)
//!  DebouncePending ──msg────────────────▶ DebouncePending(at + debounce)
//!  ThrottledPending ──msg───────────────▶ DebouncePending(at + debounce)
//!  *Pending ──check_due(now ≥ pending)──▶ fire, Idle
//! ```
//!
//! At most one fire is ever pending per key; rescheduling replaces it.
//! The throttle deadline is absolute, but a message arriving before it
//! cancels it in favour of a fresh debounce, so a stream that never goes
//! quiet for `debounce` never fires.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error("trigger '{key}' failed: {reason}")]
    Failed { key: String, reason: String },
}

/// The downstream side effect.
#[async_trait]
pub trait TriggerAction: Send + Sync {
    async fn fire(&self, key: &str) -> Result<(), TriggerError>;
}

/// Logs each fire and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTriggerAction;

#[async_trait]
impl TriggerAction for LoggingTriggerAction {
    async fn fire(&self, key: &str) -> Result<(), TriggerError> {
        tracing::info!(target: crate::TRACING_TARGET_TRIGGER, key = %key, "workflow trigger fired");
        Ok(())
    }
}

/// Timing for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerConfig {
    /// Quiet period required before a fire
    pub debounce: Duration,
    /// Floor on the time between two fires
    pub min_interval: Duration,
}

impl TriggerConfig {
    pub fn new(debounce: Duration, min_interval: Duration) -> Self {
        Self {
            debounce,
            min_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    DebouncePending,
    ThrottledPending,
}

/// What a message did to its key's schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEffect {
    /// A fire was scheduled from idle
    Scheduled(Phase),
    /// The pending fire was replaced by a new one
    Rescheduled(Phase),
}

impl MessageEffect {
    /// True if the message joined a fire that was already pending.
    pub fn is_coalesced(&self) -> bool {
        matches!(self, Self::Rescheduled(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebounceState {
    pub config: TriggerConfig,
    pub phase: Phase,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_trigger_at: Option<DateTime<Utc>>,
    pub pending_fire_at: Option<DateTime<Utc>>,
}

impl DebounceState {
    pub fn new(config: TriggerConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            last_message_at: None,
            last_trigger_at: None,
            pending_fire_at: None,
        }
    }

    pub fn on_message(&mut self, at: DateTime<Utc>) -> MessageEffect {
        self.last_message_at = Some(at);
        let quiet_at = at + self.config.debounce;

        if self.pending_fire_at.is_some() {
            // Any pending fire, throttled or not, restarts the quiet period
            self.schedule(Phase::DebouncePending, quiet_at);
            return MessageEffect::Rescheduled(Phase::DebouncePending);
        }

        let throttle_deadline = self
            .last_trigger_at
            .filter(|last| at - *last < self.config.min_interval)
            .map(|last| last + self.config.min_interval);
        match throttle_deadline {
            Some(deadline) => {
                self.schedule(Phase::ThrottledPending, deadline);
                MessageEffect::Scheduled(Phase::ThrottledPending)
            }
            None => {
                self.schedule(Phase::DebouncePending, quiet_at);
                MessageEffect::Scheduled(Phase::DebouncePending)
            }
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.pending_fire_at.is_some_and(|at| at <= now)
    }

    fn schedule(&mut self, phase: Phase, at: DateTime<Utc>) {
        self.phase = phase;
        self.pending_fire_at = Some(at);
    }

    fn mark_fired(&mut self, now: DateTime<Utc>) {
        self.phase = Phase::Idle;
        self.pending_fire_at = None;
        self.last_trigger_at = Some(now);
    }
}

/// All debounce state, keyed by trigger key.
pub struct TriggerRegistry {
    defaults: TriggerConfig,
    overrides: HashMap<String, TriggerConfig>,
    states: Mutex<HashMap<String, DebounceState>>,
    action: Arc<dyn TriggerAction>,
}

impl std::fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRegistry")
            .field("defaults", &self.defaults)
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}

impl TriggerRegistry {
    pub fn new(defaults: TriggerConfig, action: Arc<dyn TriggerAction>) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            states: Mutex::new(HashMap::new()),
            action,
        }
    }

    pub fn with_key_config(mut self, key: impl Into<String>, config: TriggerConfig) -> Self {
        self.overrides.insert(key.into(), config);
        self
    }

    pub fn with_action(mut self, action: Arc<dyn TriggerAction>) -> Self {
        self.action = action;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DebounceState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config_for(&self, key: &str) -> TriggerConfig {
        self.overrides.get(key).copied().unwrap_or(self.defaults)
    }

    /// Record a message for `key` at `at`.
    pub fn on_message(&self, key: &str, at: DateTime<Utc>) -> MessageEffect {
        let config = self.config_for(key);
        let mut states = self.lock();
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| DebounceState::new(config));
        let effect = state.on_message(at);
        tracing::trace!(
            target: crate::TRACING_TARGET_TRIGGER,
            key = %key,
            effect = ?effect,
            pending_fire_at = ?state.pending_fire_at,
            "trigger message"
        );
        effect
    }

    /// Fire every key whose pending time has come. Returns the fired keys.
    ///
    /// State is settled under the lock; the action runs outside it. A
    /// failing action is logged and still counts as a fire.
    pub async fn check_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<String> = {
            let mut states = self.lock();
            states
                .iter_mut()
                .filter(|(_, state)| state.is_due(now))
                .map(|(key, state)| {
                    state.mark_fired(now);
                    key.clone()
                })
                .collect()
        };
        due.sort();

        for key in &due {
            if let Err(e) = self.action.fire(key).await {
                tracing::warn!(
                    target: crate::TRACING_TARGET_TRIGGER,
                    key = %key,
                    error = %e,
                    "trigger action failed"
                );
            }
        }
        due
    }

    /// Snapshot of one key's state.
    pub fn state(&self, key: &str) -> Option<DebounceState> {
        self.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn has_pending(&self) -> bool {
        self.lock().values().any(|s| s.pending_fire_at.is_some())
    }
}
