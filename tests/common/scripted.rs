//! Scripted sink and recording trigger action

use async_trait::async_trait;
use graphbridge::{
    GraphSink, RecordSink, TransformedRecord, TriggerAction, TriggerError, WriteOutcome,
};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Answers from a queue of scripted outcomes, then from a real graph store.
///
/// While `down` is set every write is answered `Transient`.
#[derive(Default)]
pub struct ScriptedSink {
    pub graph: GraphSink,
    script: Mutex<VecDeque<WriteOutcome>>,
    down: Mutex<bool>,
    writes: Mutex<Vec<TransformedRecord>>,
}

impl ScriptedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(outcomes: Vec<WriteOutcome>) -> Self {
        let sink = Self::default();
        *sink.script.lock().unwrap() = outcomes.into();
        sink
    }

    pub fn set_down(&self, down: bool) {
        *self.down.lock().unwrap() = down;
    }

    /// Every record this sink was asked to write, in order.
    pub fn writes(&self) -> Vec<TransformedRecord> {
        self.writes.lock().unwrap().clone()
    }

    pub fn write_ids(&self) -> Vec<String> {
        self.writes().into_iter().map(|r| r.external_id).collect()
    }
}

#[async_trait]
impl RecordSink for ScriptedSink {
    async fn write(&self, record: &TransformedRecord) -> WriteOutcome {
        self.writes.lock().unwrap().push(record.clone());
        if *self.down.lock().unwrap() {
            return WriteOutcome::Transient("503 service unavailable".into());
        }
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => self.graph.write(record).await,
        }
    }
}

/// Records every fired key.
#[derive(Default)]
pub struct RecordingTrigger {
    fired: Mutex<Vec<String>>,
}

impl RecordingTrigger {
    pub fn fired(&self) -> Vec<String> {
        self.fired.lock().unwrap().clone()
    }
}

#[async_trait]
impl TriggerAction for RecordingTrigger {
    async fn fire(&self, key: &str) -> Result<(), TriggerError> {
        self.fired.lock().unwrap().push(key.to_string());
        Ok(())
    }
}
