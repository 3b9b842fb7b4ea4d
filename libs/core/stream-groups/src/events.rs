//! Typed stream events
//!
//! The core raises an event for every publish, acknowledgement, retry and
//! worker lifecycle change. Where they go is up to the [`EventSink`]; the
//! default forwards them to the `metrics` facade, so installing an exporter
//! is the host's concern.

use metrics::{counter, gauge};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::entry::EntryId;

/// Something observable happened in a publisher or worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Published {
        group: String,
        entry_id: EntryId,
    },
    WorkerStarted {
        group: String,
        consumer: String,
    },
    WorkerStopped {
        group: String,
        consumer: String,
    },
    /// A worker left its loop on an unexpected error; its slot is not replaced.
    WorkerDied {
        group: String,
        consumer: String,
        error: String,
    },
    Acknowledged {
        group: String,
        entry_id: EntryId,
        attempts: u32,
    },
    RetryScheduled {
        group: String,
        entry_id: EntryId,
        attempt: u32,
    },
    RetriesExhausted {
        group: String,
        entry_id: EntryId,
        attempts: u32,
        acknowledged: bool,
    },
    ReadFailed {
        group: String,
        error: String,
    },
    ActiveWorkers {
        count: usize,
    },
}

impl StreamEvent {
    /// Short, stable name for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Published { .. } => "published",
            StreamEvent::WorkerStarted { .. } => "worker_started",
            StreamEvent::WorkerStopped { .. } => "worker_stopped",
            StreamEvent::WorkerDied { .. } => "worker_died",
            StreamEvent::Acknowledged { .. } => "acknowledged",
            StreamEvent::RetryScheduled { .. } => "retry_scheduled",
            StreamEvent::RetriesExhausted { .. } => "retries_exhausted",
            StreamEvent::ReadFailed { .. } => "read_failed",
            StreamEvent::ActiveWorkers { .. } => "active_workers",
        }
    }
}

/// Receives stream events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &StreamEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &StreamEvent) {}
}

/// Logs every event at `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &StreamEvent) {
        debug!(kind = event.kind(), event = ?event, "Stream event");
    }
}

/// Records events through the `metrics` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSink;

impl EventSink for MetricsSink {
    fn emit(&self, event: &StreamEvent) {
        trace!(kind = event.kind(), "Recording stream metric");
        match event {
            StreamEvent::Published { group, .. } => {
                counter!("stream_groups_published_total", "group" => group.clone()).increment(1);
            }
            StreamEvent::WorkerStarted { group, .. } => {
                counter!("stream_groups_workers_started_total", "group" => group.clone())
                    .increment(1);
            }
            StreamEvent::WorkerStopped { group, .. } => {
                counter!("stream_groups_workers_stopped_total", "group" => group.clone())
                    .increment(1);
            }
            StreamEvent::WorkerDied { group, .. } => {
                counter!("stream_groups_workers_died_total", "group" => group.clone())
                    .increment(1);
            }
            StreamEvent::Acknowledged { group, .. } => {
                counter!(
                    "stream_groups_entries_total",
                    "group" => group.clone(),
                    "status" => "acknowledged"
                )
                .increment(1);
            }
            StreamEvent::RetryScheduled { group, .. } => {
                counter!("stream_groups_retries_total", "group" => group.clone()).increment(1);
            }
            StreamEvent::RetriesExhausted {
                group,
                acknowledged,
                ..
            } => {
                let status = if *acknowledged { "dropped" } else { "parked" };
                counter!(
                    "stream_groups_entries_total",
                    "group" => group.clone(),
                    "status" => status
                )
                .increment(1);
            }
            StreamEvent::ReadFailed { group, .. } => {
                counter!("stream_groups_read_errors_total", "group" => group.clone())
                    .increment(1);
            }
            StreamEvent::ActiveWorkers { count } => {
                gauge!("stream_groups_active_workers").set(*count as f64);
            }
        }
    }
}

/// Forwards every event to several sinks.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &StreamEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
