//! Common test utilities for pipeline integration tests
//!
//! Scripted collaborators (sink, trigger action) and a shared alarm
//! configuration with events, frames, definitions and assets.

pub mod scripted;

pub use scripted::{RecordingTrigger, ScriptedSink};

use graphbridge::{BridgeConfig, EntityReference, ManualClock, Pipeline, RawMessage};
use serde_json::Value;
use std::sync::Arc;

/// Alarm pipeline configuration used across tests.
pub const ALARM_CONFIG: &str = r#"
buffer:
  timeout_secs: 300
retry:
  max_queue_size: 3
  max_age_secs: 3600
trigger:
  debounce_secs: 5
  min_interval_secs: 300
prefixes:
  event: hal_
  definition: had_
  frame: haf_
  asset: haa_
mappings:
  - topic: alarms/events/log
    target_kind: haAlarmEvent
    model_space: schema
    model_version: v1
    space: inst
    type_prefix: hal_
    trigger_key: alarms
  - topic: alarms/frames/+
    target_kind: haAlarmFrame
    space: inst
    type_prefix: haf_
    trigger_key: alarms
  - topic: alarms/definitions/log
    target_kind: haAlarmDefinition
    space: inst
    type_prefix: had_
  - topic: assets/#
    target_kind: haAsset
    space: inst
    type_prefix: haa_
  - topic: states/#
    target_kind: haState
    space: inst
    booleans: numeric
    generate_missing_id: true
"#;

pub fn alarm_config() -> BridgeConfig {
    BridgeConfig::from_yaml_str(ALARM_CONFIG).expect("alarm config parses")
}

/// Pipeline over `sink` with a manual clock and a recording trigger.
pub fn alarm_pipeline(
    sink: Arc<ScriptedSink>,
) -> (Pipeline, Arc<ManualClock>, Arc<RecordingTrigger>) {
    let clock = Arc::new(ManualClock::at_millis(1_700_000_000_000));
    let trigger = Arc::new(RecordingTrigger::default());
    let pipeline = Pipeline::new(&alarm_config(), sink)
        .expect("pipeline builds")
        .with_clock(clock.clone())
        .with_trigger_action(trigger.clone());
    (pipeline, clock, trigger)
}

pub fn msg(topic: &str, payload: Value) -> RawMessage {
    let bytes = serde_json::to_vec(&payload).expect("payload serializes");
    RawMessage::decode(topic, &bytes, chrono::Utc::now()).expect("payload decodes")
}

pub fn inst(id: &str) -> EntityReference {
    EntityReference::new("inst", id)
}
