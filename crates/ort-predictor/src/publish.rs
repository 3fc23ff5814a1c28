//! Span Publishing
//!
//! Turns the events of a per-call sub-trace into finished spans timed with
//! the event's own start and end, parented on that call's span.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::Span;

use crate::trace::{Trace, TraceEvent};

/// Engine events for model loading and the top-level run, never published
pub const NOISE_EVENTS: [&str; 4] = [
    "model_loading_from_uri",
    "session_initialization",
    "model_run",
    "SequentialExecutor::Execute",
];

/// Check if an event is engine bookkeeping rather than model work
pub fn is_noise(name: &str) -> bool {
    NOISE_EVENTS.contains(&name)
}

/// A span whose start and end are already known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedSpan {
    /// Index of the predict call the span belongs to
    pub call: usize,
    pub name: String,
    pub category: String,
    pub phase: String,
    pub process_id: i64,
    pub thread_id: i64,
    pub args: BTreeMap<String, String>,
    pub start: SystemTime,
    pub end: SystemTime,
}

impl FinishedSpan {
    fn from_event(call: usize, event: &TraceEvent) -> Self {
        Self {
            call,
            name: event.name.clone(),
            category: event.category.clone(),
            phase: event.phase.clone(),
            process_id: event.process_id,
            thread_id: event.thread_id,
            args: event.args.clone(),
            start: event.start_time(),
            end: event.end_time(),
        }
    }
}

/// Destination for published profiling spans
pub trait SpanSink: Send + Sync {
    /// Publish `span` as a child of `parent`
    fn publish(&self, parent: &Span, span: FinishedSpan);
}

/// Emits each span as a `framework_event` tracing span under the call's span
///
/// `tracing` spans cannot be backdated: the span opens and closes at publish
/// time, so subscribers that time spans see the publish clock. The event's own
/// times are carried only in the `start_ns` and `end_ns` fields. Embedders
/// that need spans with explicit start and end times should install their own
/// [`SpanSink`] through [`crate::Predictor::with_sink`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl SpanSink for TracingSink {
    fn publish(&self, parent: &Span, span: FinishedSpan) {
        let start_ns = unix_nanos(span.start);
        let end_ns = unix_nanos(span.end);

        let event_span = tracing::trace_span!(
            parent: parent,
            "framework_event",
            call = span.call,
            event_name = %span.name,
            category = %span.category,
            phase = %span.phase,
            process_id = span.process_id,
            thread_id = span.thread_id,
            args = ?span.args,
            start_ns,
            end_ns
        );
        let _entered = event_span.entered();
    }
}

/// Keeps published spans in memory
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    spans: Arc<Mutex<Vec<FinishedSpan>>>,
}

impl CollectingSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far
    pub fn spans(&self) -> Vec<FinishedSpan> {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SpanSink for CollectingSink {
    fn publish(&self, _parent: &Span, span: FinishedSpan) {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(span);
    }
}

/// Publish every non-noise event of a call's sub-trace, returns the count published
pub fn publish_trace(sink: &dyn SpanSink, parent: &Span, call: usize, trace: &Trace) -> usize {
    let mut published = 0;
    for event in trace.events.iter().filter(|event| !is_noise(&event.name)) {
        sink.publish(parent, FinishedSpan::from_event(call, event));
        published += 1;
    }
    published
}

fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, start: i64, end: i64) -> TraceEvent {
        TraceEvent {
            name: name.to_string(),
            category: "Node".to_string(),
            start,
            end,
            ..Default::default()
        }
    }

    #[test]
    fn test_noise_filter() {
        for name in NOISE_EVENTS {
            assert!(is_noise(name));
        }
        assert!(!is_noise("conv1_kernel_time"));
    }

    #[test]
    fn test_publish_skips_noise_and_keeps_event_times() {
        let trace = Trace {
            start_time: 0,
            events: vec![
                event("model_run", 100, 900),
                event("SequentialExecutor::Execute", 110, 890),
                event("conv1_kernel_time", 120, 450),
                event("session_initialization", 130, 140),
                event("relu_kernel_time", 460, 470),
            ],
        };

        let sink = CollectingSink::new();
        let published = publish_trace(&sink, &Span::none(), 2, &trace);
        assert_eq!(published, 2);

        let spans = sink.spans();
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().all(|s| !is_noise(&s.name)));
        assert_eq!(spans[0].name, "conv1_kernel_time");
        assert_eq!(spans[0].call, 2);
        assert_eq!(unix_nanos(spans[0].start), 120);
        assert_eq!(unix_nanos(spans[0].end), 450);
    }

    #[test]
    fn test_tracing_sink_without_subscriber() {
        let sink = TracingSink;
        sink.publish(
            &Span::none(),
            FinishedSpan::from_event(0, &event("conv1_kernel_time", 1, 2)),
        );
    }
}
