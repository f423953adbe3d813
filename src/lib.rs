//! Graphbridge: topic-routed attribute messages into a referential-integrity graph store
//!
//! Sits between a pub/sub source and a store that rejects records pointing at
//! records it does not have yet. Every message is transformed, written and
//! routed on the write's outcome.
//!
//! # Core Concepts
//!
//! - **Transformer**: payload → record, with identifier sanitization
//! - **DependencyBuffer**: records waiting for their relation targets
//! - **RetryQueue**: bounded queue of transient write failures
//! - **TriggerRegistry**: debounced, throttled downstream trigger per key
//! - **Pipeline**: the orchestrator wiring the above to a sink and a timer
//!
//! # Example
//!
//! ```
//! use graphbridge::{BridgeConfig, GraphSink, Pipeline, RawMessage, TopicMapping};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = BridgeConfig::with_mappings(vec![
//!     TopicMapping::new("frames/log", "haAlarmFrame", "inst").with_type_prefix("haf_"),
//! ]);
//! let sink = Arc::new(GraphSink::new());
//! let pipeline = Pipeline::new(&config, sink.clone()).unwrap();
//!
//! let payload = br#"{"externalId": "42"}"#;
//! let raw = RawMessage::decode("frames/log", payload, chrono::Utc::now()).unwrap();
//! pipeline.handle(raw).await;
//! assert_eq!(pipeline.stats().written, 1);
//! # });
//! ```

/// Tracing target for message handling and outcome routing.
pub const TRACING_TARGET_PIPELINE: &str = "graphbridge::pipeline";

/// Tracing target for retry queue activity.
pub const TRACING_TARGET_RETRY: &str = "graphbridge::retry";

/// Tracing target for workflow trigger scheduling and fires.
pub const TRACING_TARGET_TRIGGER: &str = "graphbridge::trigger";

pub mod buffer;
pub mod clock;
pub mod config;
pub mod model;
pub mod pipeline;
pub mod retry;
pub mod routing;
pub mod sink;
pub mod transform;
pub mod trigger;

pub use buffer::{BufferedItem, DependencyBuffer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BooleanConvention, BridgeConfig, ConfigError, TopicMapping};
pub use model::{
    EntityReference, PrefixTable, PropertyValue, RawMessage, RelationValue, TargetKind,
    TransformedRecord, ValidationError,
};
pub use pipeline::{CancellationToken, Pipeline, PipelineStats, StatsSnapshot};
pub use retry::{DrainReport, RetryItem, RetryQueue};
pub use routing::{TopicPattern, TopicRouter};
pub use sink::{classify_response, GraphSink, RecordSink, SinkError, WriteOutcome};
pub use transform::Transformer;
pub use trigger::{
    DebounceState, LoggingTriggerAction, Phase, TriggerAction, TriggerConfig, TriggerError,
    TriggerRegistry,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
