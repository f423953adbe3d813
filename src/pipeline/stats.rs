//! Pipeline counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        /// Monotonic counters, updated lock-free from every worker.
        #[derive(Debug, Default)]
        pub struct PipelineStats {
            $(pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of `PipelineStats`.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct StatsSnapshot {
            $(pub $name: u64,)*
        }

        impl PipelineStats {
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters!(
    received,
    unmatched,
    written,
    validation_dropped,
    permanent_dropped,
    superseded,
    buffered,
    resolved,
    expired_degraded,
    degraded_failed,
    retried,
    retry_queued,
    retry_evicted,
    retry_expired,
    trigger_fired,
    trigger_coalesced,
);

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl StatsSnapshot {
    /// Records dropped for good, for any reason.
    pub fn dropped(&self) -> u64 {
        self.validation_dropped
            + self.permanent_dropped
            + self.degraded_failed
            + self.retry_expired
            + self.retry_evicted
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "received={} unmatched={} written={} invalid={} permanent={} superseded={} \
             buffered={} resolved={} degraded={} degraded_failed={} retried={} queued={} \
             evicted={} expired={} fired={} coalesced={}",
            self.received,
            self.unmatched,
            self.written,
            self.validation_dropped,
            self.permanent_dropped,
            self.superseded,
            self.buffered,
            self.resolved,
            self.expired_degraded,
            self.degraded_failed,
            self.retried,
            self.retry_queued,
            self.retry_evicted,
            self.retry_expired,
            self.trigger_fired,
            self.trigger_coalesced,
        )
    }
}
