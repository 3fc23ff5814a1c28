//! Profiling Trace Capture
//!
//! Parses the engine's profiling buffer (a JSON array of trace events),
//! places every event on the host wall clock, and splits the session trace
//! into one sub-trace per predict call.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::error::{PredictorError, Result};

/// Engine timestamps are microseconds, host timestamps are nanoseconds
pub const ENGINE_CLOCK_SCALE: i64 = 1_000;

/// Current wall-clock time in nanoseconds since the UNIX epoch
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Convert nanoseconds since the UNIX epoch to a `SystemTime`
pub fn to_system_time(ns: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(ns.max(0) as u64)
}

/// One event from the engine profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    #[serde(rename = "cat", default, deserialize_with = "null_as_default")]
    pub category: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(rename = "ph", default, deserialize_with = "null_as_default")]
    pub phase: String,
    /// Start relative to the profiling start, engine clock units
    #[serde(rename = "ts", default, deserialize_with = "null_as_default")]
    pub timestamp: i64,
    /// Duration in engine clock units
    #[serde(rename = "dur", default, deserialize_with = "null_as_default")]
    pub duration: i64,
    #[serde(rename = "pid", default, deserialize_with = "null_as_default")]
    pub process_id: i64,
    #[serde(rename = "tid", default, deserialize_with = "null_as_default")]
    pub thread_id: i64,
    #[serde(default, deserialize_with = "string_args")]
    pub args: BTreeMap<String, String>,
    /// Absolute start, ns since the UNIX epoch
    #[serde(skip)]
    pub start: i64,
    /// Absolute end, ns since the UNIX epoch
    #[serde(skip)]
    pub end: i64,
}

impl TraceEvent {
    /// Identifier of the event within its thread
    pub fn id(&self) -> String {
        format!("{}/{}", self.name, self.thread_id)
    }

    /// Absolute start as a `SystemTime`
    pub fn start_time(&self) -> SystemTime {
        to_system_time(self.start)
    }

    /// Absolute end as a `SystemTime`
    pub fn end_time(&self) -> SystemTime {
        to_system_time(self.end)
    }
}

/// Treat an explicit `null` like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}

/// Arguments are usually strings; anything else is kept as its JSON text
fn string_args<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(text) => (key, text),
            other => (key, other.to_string()),
        })
        .collect())
}

/// Session trace ordered by absolute start time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    /// Start of the trace, ns since the UNIX epoch
    pub start_time: i64,
    /// Events in non-decreasing `start` order
    pub events: Vec<TraceEvent>,
}

impl Trace {
    /// Create an empty trace starting at `start_time`
    pub fn new(start_time: i64) -> Self {
        Self {
            start_time,
            events: Vec::new(),
        }
    }

    /// Parse a profiling buffer recorded from `start_time` (ns since the UNIX epoch)
    pub fn parse(data: &str, start_time: i64) -> Result<Self> {
        let mut events: Vec<TraceEvent> = serde_json::from_str(data)?;

        for event in &mut events {
            event.start = start_time.saturating_add(event.timestamp.saturating_mul(ENGINE_CLOCK_SCALE));
            event.end = event
                .start
                .saturating_add(event.duration.saturating_mul(ENGINE_CLOCK_SCALE));
        }

        // Stable, so events with equal start keep buffer order
        events.sort_by_key(|event| event.start);

        Ok(Self { start_time, events })
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the trace has no events
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Start of the trace as a `SystemTime`
    pub fn start(&self) -> SystemTime {
        to_system_time(self.start_time)
    }

    /// Split into one sub-trace per recorded predict call
    ///
    /// `starts[i]`/`ends[i]` are the wall-clock window of call `i`. An event
    /// ending before the current window's end joins it when it also started
    /// after the window's start; any event ending at or past that end moves
    /// on to the next call and is attributed to it unconditionally. An event
    /// spanning several windows therefore only advances one call.
    pub fn split(&self, starts: &[i64], ends: &[i64]) -> Result<Vec<Trace>> {
        if starts.len() != ends.len() {
            return Err(PredictorError::TraceSplit {
                starts: starts.len(),
                ends: ends.len(),
            });
        }
        if starts.is_empty() {
            return Ok(Vec::new());
        }

        let mut batch = 0;
        let mut traces = vec![Trace::new(starts[0])];

        for (position, event) in self.events.iter().enumerate() {
            if event.end < ends[batch] {
                if event.start > starts[batch] {
                    traces[batch].events.push(event.clone());
                }
            } else {
                batch += 1;
                if batch == starts.len() {
                    debug!(
                        "Dropping {} trace events after the last recorded call",
                        self.events.len() - position
                    );
                    break;
                }
                let mut trace = Trace::new(starts[batch]);
                trace.events.push(event.clone());
                traces.push(trace);
            }
        }

        while traces.len() < starts.len() {
            traces.push(Trace::new(starts[traces.len()]));
        }

        Ok(traces)
    }
}
