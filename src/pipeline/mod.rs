//! Delivery pipeline
//!
//! Single entry point per message: `handle(raw)`. Steps:
//! 1. Resolve the topic to a mapping (unmatched topics are ignored)
//! 2. Transform into a record (validation failures are dropped)
//! 3. Write through the per-key gate and route the outcome:
//!    - accepted: notify the trigger, release buffered dependents, drain
//!      the retry queue
//!    - missing reference: buffer until the targets exist
//!    - transient: queue for retry
//!    - permanent: drop
//!
//! `tick()` runs the maintenance side on a fixed period: expired buffer
//! items are flushed degraded, the retry queue is drained and due triggers
//! fire. `run()` wires both to an ingestion channel.

pub mod gate;
pub mod stats;

pub use gate::KeyedGate;
pub use stats::{PipelineStats, StatsSnapshot};
pub use tokio_util::sync::CancellationToken;

use crate::buffer::DependencyBuffer;
use crate::clock::{Clock, SystemClock};
use crate::config::{BridgeConfig, ConfigError};
use crate::model::{EntityReference, RawMessage, TransformedRecord};
use crate::retry::RetryQueue;
use crate::routing::TopicRouter;
use crate::sink::{RecordSink, WriteOutcome};
use crate::transform::Transformer;
use crate::trigger::{LoggingTriggerAction, TriggerAction, TriggerRegistry};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

/// Where a record about to be written came from. Decides how far a
/// success cascades and whether a failure may be buffered again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Straight from a message
    Fresh,
    /// Released from the buffer by a dependency write
    Resolved,
    /// Final flush of an expired or evicted buffer item
    Degraded,
    /// Diverted out of a retry drain
    Retried,
}

type Work = VecDeque<(TransformedRecord, Origin)>;

/// Counts messages between arrival and completion.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The orchestrator: owns the buffer, retry queue and trigger registry and
/// routes every write outcome between them.
pub struct Pipeline {
    router: TopicRouter,
    transformer: Transformer,
    sink: Arc<dyn RecordSink>,
    buffer: Mutex<DependencyBuffer>,
    retry: RetryQueue,
    triggers: TriggerRegistry,
    gate: KeyedGate,
    stats: PipelineStats,
    clock: Arc<dyn Clock>,
    next_revision: AtomicU64,
    in_flight: Arc<AtomicUsize>,
    workers: usize,
    tick_interval: std::time::Duration,
}

impl Pipeline {
    /// Build a pipeline from validated configuration. Uses the wall clock and
    /// a logging trigger action until told otherwise.
    pub fn new(config: &BridgeConfig, sink: Arc<dyn RecordSink>) -> Result<Self, ConfigError> {
        config.validate()?;
        let router = TopicRouter::new(&config.mappings)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut triggers =
            TriggerRegistry::new(config.trigger.defaults(), Arc::new(LoggingTriggerAction));
        for key in config.trigger.keys.keys() {
            triggers = triggers.with_key_config(key.clone(), config.trigger.config_for(key));
        }

        Ok(Self {
            router,
            transformer: Transformer::new(config.prefixes.clone()),
            sink,
            buffer: Mutex::new(
                DependencyBuffer::new(config.buffer.timeout())
                    .with_max_items(config.buffer.max_items),
            ),
            retry: RetryQueue::new(config.retry.max_queue_size, config.retry.max_age()),
            triggers,
            gate: KeyedGate::new(),
            stats: PipelineStats::new(),
            clock: Arc::new(SystemClock),
            next_revision: AtomicU64::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            workers: config.pipeline.workers,
            tick_interval: config.pipeline.tick_interval(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_trigger_action(mut self, action: Arc<dyn TriggerAction>) -> Self {
        self.triggers = self.triggers.with_action(action);
        self
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn triggers(&self) -> &TriggerRegistry {
        &self.triggers
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    pub fn buffered(&self) -> usize {
        self.buffer().len()
    }

    pub fn is_buffered(&self, key: &EntityReference) -> bool {
        self.buffer().contains(key)
    }

    pub fn queued(&self) -> usize {
        self.retry.len()
    }

    /// Nothing buffered, queued or waiting to fire.
    pub fn is_settled(&self) -> bool {
        self.buffered() == 0 && self.queued() == 0 && !self.triggers.has_pending()
    }

    fn buffer(&self) -> MutexGuard<'_, DependencyBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_revision(&self) -> u64 {
        self.next_revision.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Process one message to completion.
    pub async fn handle(&self, raw: RawMessage) {
        let _in_flight = InFlight::new(&self.in_flight);
        let revision = self.next_revision();
        self.process(raw, revision).await;
    }

    async fn process(&self, raw: RawMessage, revision: u64) {
        PipelineStats::incr(&self.stats.received);

        let Some(mapping) = self.router.resolve(&raw.topic) else {
            PipelineStats::incr(&self.stats.unmatched);
            tracing::debug!(
                target: crate::TRACING_TARGET_PIPELINE,
                topic = %raw.topic,
                "no mapping for topic"
            );
            return;
        };

        let mut record = match self.transformer.transform(&raw, &mapping) {
            Ok(record) => record,
            Err(e) => {
                PipelineStats::incr(&self.stats.validation_dropped);
                tracing::warn!(
                    target: crate::TRACING_TARGET_PIPELINE,
                    topic = %raw.topic,
                    error = %e,
                    "dropping invalid message"
                );
                return;
            }
        };
        record.revision = revision;

        let key = record.key();
        self.gate.observe(&key, revision);
        if self.gate.is_superseded(&key, revision) {
            PipelineStats::incr(&self.stats.superseded);
            return;
        }
        self.absorb_older_copies(&mut record);

        self.deliver(VecDeque::from([(record, Origin::Fresh)])).await;
    }

    /// Take queued or buffered copies of the record's key that are older
    /// than it out of their holders and fold their fields into the record.
    fn absorb_older_copies(&self, record: &mut TransformedRecord) {
        let key = record.key();
        if let Some(item) = self.retry.remove_older_than(&key, record.revision) {
            record.fill_from(&item.record);
            PipelineStats::incr(&self.stats.superseded);
        }
        let mut buffer = self.buffer();
        if buffer
            .get(&key)
            .is_some_and(|item| item.record.revision < record.revision)
        {
            if let Some(item) = buffer.remove(&key) {
                record.fill_from(&item.record);
                PipelineStats::incr(&self.stats.superseded);
            }
        }
    }

    /// Write through the gate. `None` if a newer copy exists.
    async fn write_gated(&self, record: &TransformedRecord) -> Option<WriteOutcome> {
        let guard = self.gate.acquire(&record.key(), record.revision).await?;
        let outcome = self.sink.write(record).await;
        if outcome.is_accepted() {
            guard.mark_written();
        }
        Some(outcome)
    }

    /// Write and route every record in `work`, including the follow-ups
    /// that routing produces.
    async fn deliver(&self, mut work: Work) {
        while let Some((record, origin)) = work.pop_front() {
            let Some(outcome) = self.write_gated(&record).await else {
                PipelineStats::incr(&self.stats.superseded);
                tracing::debug!(
                    target: crate::TRACING_TARGET_PIPELINE,
                    external_id = %record.external_id,
                    revision = record.revision,
                    "superseded by a newer message"
                );
                continue;
            };
            if self.route(record, outcome, origin, &mut work) {
                self.drain_retry(&mut work).await;
            }
        }
    }

    /// Route one outcome. Follow-up writes are pushed onto `work`; returns
    /// true when the retry queue should be drained.
    fn route(
        &self,
        record: TransformedRecord,
        outcome: WriteOutcome,
        origin: Origin,
        work: &mut Work,
    ) -> bool {
        let now = self.clock.now();
        match outcome {
            WriteOutcome::Accepted => {
                PipelineStats::incr(&self.stats.written);
                tracing::debug!(
                    target: crate::TRACING_TARGET_PIPELINE,
                    external_id = %record.external_id,
                    space = %record.space,
                    origin = ?origin,
                    "record written"
                );
                self.on_written(&record);
                // Released records do not release further dependents
                if origin != Origin::Resolved {
                    self.release_dependents(&record.key(), work);
                }
                !self.retry.is_empty()
            }
            WriteOutcome::MissingReference(_)
            | WriteOutcome::Transient(_)
            | WriteOutcome::Permanent(_)
                if origin == Origin::Degraded =>
            {
                PipelineStats::incr(&self.stats.degraded_failed);
                tracing::warn!(
                    target: crate::TRACING_TARGET_PIPELINE,
                    external_id = %record.external_id,
                    outcome = %outcome,
                    "degraded write failed, dropping"
                );
                false
            }
            WriteOutcome::MissingReference(refs) => {
                let missing: BTreeSet<EntityReference> = if refs.is_empty() {
                    record.references()
                } else {
                    refs.into_iter().collect()
                };
                tracing::debug!(
                    target: crate::TRACING_TARGET_PIPELINE,
                    external_id = %record.external_id,
                    missing = missing.len(),
                    "buffering until references exist"
                );
                PipelineStats::incr(&self.stats.buffered);
                let waiting_on: Vec<EntityReference> = missing.iter().cloned().collect();
                let evicted = self.buffer().submit(record, missing, now);
                if let Some(evicted) = evicted {
                    tracing::warn!(
                        target: crate::TRACING_TARGET_PIPELINE,
                        external_id = %evicted.external_id,
                        "dependency buffer full, flushing oldest item"
                    );
                    PipelineStats::incr(&self.stats.expired_degraded);
                    work.push_back((evicted, Origin::Degraded));
                }
                // A target may have been written while this write was in
                // flight. Released records are not re-released, which would loop.
                if origin != Origin::Resolved {
                    for reference in waiting_on.iter().filter(|r| self.gate.is_written(r)) {
                        self.release_dependents(reference, work);
                    }
                }
                false
            }
            WriteOutcome::Transient(reason) => {
                tracing::debug!(
                    target: crate::TRACING_TARGET_PIPELINE,
                    external_id = %record.external_id,
                    reason = %reason,
                    "queueing for retry"
                );
                PipelineStats::incr(&self.stats.retry_queued);
                if self.retry.enqueue(record, now) {
                    PipelineStats::incr(&self.stats.retry_evicted);
                }
                false
            }
            WriteOutcome::Permanent(reason) => {
                PipelineStats::incr(&self.stats.permanent_dropped);
                tracing::warn!(
                    target: crate::TRACING_TARGET_PIPELINE,
                    external_id = %record.external_id,
                    reason = %reason,
                    "write rejected, dropping"
                );
                false
            }
        }
    }

    fn on_written(&self, record: &TransformedRecord) {
        let trigger_key = self
            .router
            .resolve(&record.source_topic)
            .and_then(|mapping| mapping.trigger_key.clone());
        if let Some(key) = trigger_key {
            if self.triggers.on_message(&key, self.clock.now()).is_coalesced() {
                PipelineStats::incr(&self.stats.trigger_coalesced);
            }
        }
    }

    fn release_dependents(&self, key: &EntityReference, work: &mut Work) {
        let ready = self.buffer().on_dependency_resolved(key);
        if !ready.is_empty() {
            tracing::debug!(
                target: crate::TRACING_TARGET_PIPELINE,
                reference = %key,
                released = ready.len(),
                "dependency resolved"
            );
        }
        PipelineStats::add(&self.stats.resolved, ready.len());
        work.extend(ready.into_iter().map(|r| (r, Origin::Resolved)));
    }

    async fn drain_retry(&self, work: &mut Work) {
        let now = self.clock.now();
        let report = self
            .retry
            .drain_once(now, |record| async move { self.write_gated(&record).await })
            .await;

        PipelineStats::add(&self.stats.retried, report.succeeded);
        PipelineStats::add(&self.stats.written, report.succeeded);
        PipelineStats::add(&self.stats.retry_expired, report.expired);
        PipelineStats::add(&self.stats.retry_evicted, report.evicted);
        PipelineStats::add(&self.stats.superseded, report.discarded);

        if report.attempted() > 0 {
            tracing::debug!(
                target: crate::TRACING_TARGET_RETRY,
                succeeded = report.succeeded,
                failed = report.failed,
                expired = report.expired,
                "retry queue drained"
            );
        }

        for record in &report.written {
            self.on_written(record);
            self.release_dependents(&record.key(), work);
        }
        for (record, outcome) in report.diverted {
            self.route(record, outcome, Origin::Retried, work);
        }
    }

    /// One maintenance pass at the clock's current time.
    pub async fn tick(&self) {
        let now = self.clock.now();

        let expired = self.buffer().sweep(now);
        if !expired.is_empty() {
            tracing::info!(
                target: crate::TRACING_TARGET_PIPELINE,
                count = expired.len(),
                "flushing expired buffer items without unresolved relations"
            );
        }
        PipelineStats::add(&self.stats.expired_degraded, expired.len());
        let mut work: Work = expired.into_iter().map(|r| (r, Origin::Degraded)).collect();

        if !self.retry.is_empty() {
            self.drain_retry(&mut work).await;
        }
        self.deliver(work).await;

        let fired = self.triggers.check_due(now).await;
        PipelineStats::add(&self.stats.trigger_fired, fired.len());

        if self.in_flight.load(Ordering::Acquire) == 0 {
            self.gate.prune();
        }
    }

    /// Consume `rx` with up to `workers` messages in flight, ticking on the
    /// configured interval. Returns once the channel closes or `shutdown`
    /// fires, after in-flight messages finish and a final tick runs.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<RawMessage>,
        shutdown: CancellationToken,
    ) -> StatsSnapshot {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            target: crate::TRACING_TARGET_PIPELINE,
            workers = self.workers,
            mappings = self.router.len(),
            "pipeline started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(
                            target: crate::TRACING_TARGET_PIPELINE,
                            error = %e,
                            "worker task failed"
                        );
                    }
                }
                msg = rx.recv() => {
                    let Some(raw) = msg else { break };
                    let Ok(permit) = permits.clone().acquire_owned().await else { break };
                    let in_flight = InFlight::new(&self.in_flight);
                    let revision = self.next_revision();
                    let pipeline = self.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        let _in_flight = in_flight;
                        pipeline.process(raw, revision).await;
                    });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(
                    target: crate::TRACING_TARGET_PIPELINE,
                    error = %e,
                    "worker task failed"
                );
            }
        }
        self.tick().await;

        let stats = self.stats();
        tracing::info!(target: crate::TRACING_TARGET_PIPELINE, %stats, "pipeline stopped");
        stats
    }
}
