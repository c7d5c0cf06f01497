//! Progress observability: structured, best-effort pipeline events.
//!
//! Components emit through a [`ProgressRuntime`], which stamps a timestamp and a
//! per-runtime sequence number and hands the event to a [`ProgressSink`]. Sink
//! failures are logged and never interrupt the pipeline.

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub ts: String,
    pub session: String,
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

pub trait ProgressSink: Send + Sync {
    fn record(&self, event: ProgressEvent) -> Result<(), String>;
}

/// Keeps every event in memory; used by tests and by callers that inspect a run.
#[derive(Debug, Default)]
pub struct MemoryProgressSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl MemoryProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|event| event.event_type.clone())
            .collect()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.event_type == event_type)
            .count()
    }
}

impl ProgressSink for MemoryProgressSink {
    fn record(&self, event: ProgressEvent) -> Result<(), String> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Forwards events to the tracing subscriber under the `archsheet::progress` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn record(&self, event: ProgressEvent) -> Result<(), String> {
        info!(
            target: "archsheet::progress",
            session = %event.session,
            seq = event.seq,
            event_type = %event.event_type,
            data = %event.data,
            "progress"
        );
        Ok(())
    }
}

pub struct ProgressRuntime {
    sink: Arc<dyn ProgressSink>,
    next_seq: AtomicU64,
}

impl ProgressRuntime {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingProgressSink))
    }

    pub fn emit_event(&self, session_id: &str, event_type: &str, data: Value) -> Result<(), String> {
        let event = ProgressEvent {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            session: session_id.to_string(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            event_type: event_type.to_string(),
            data,
        };
        self.sink.record(event)
    }

    pub fn emit_event_best_effort(&self, session_id: &str, event_type: &str, data: Value) {
        if let Err(err) = self.emit_event(session_id, event_type, data) {
            warn!(
                session_id = %session_id,
                event_type = %event_type,
                error = %err,
                "failed to emit progress event"
            );
        }
    }
}
