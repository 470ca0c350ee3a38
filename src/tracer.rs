//! Timing and counting hooks.
//!
//! The connection manager, retry loops and background scheduler report named timings
//! and counters through a [`TracerDriver`]. Drivers decide what to do with them: log
//! through `tracing`, keep them in memory for assertions, or drop them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Sink for trace timings and counters.
pub trait TracerDriver: Send + Sync + fmt::Debug {
    /// Record how long a named operation took.
    fn add_trace(&self, name: &str, elapsed: Duration, session_id: Option<i64>);
    /// Increment a named counter.
    fn add_count(&self, name: &str, increment: u64);
}

/// Shared handle to the configured driver.
#[derive(Debug, Clone)]
pub struct Tracer {
    driver: Arc<dyn TracerDriver>,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new(LogTracerDriver)
    }
}

impl Tracer {
    pub fn new<D: TracerDriver + 'static>(driver: D) -> Self {
        Self { driver: Arc::new(driver) }
    }

    pub fn from_arc(driver: Arc<dyn TracerDriver>) -> Self {
        Self { driver }
    }

    /// Start timing `name`; the time is reported on [`OperationTrace::commit`].
    pub fn start(&self, name: &'static str) -> OperationTrace {
        OperationTrace { name, session_id: None, started: Instant::now(), tracer: self.clone() }
    }

    /// Count a single occurrence of `name`.
    pub fn event(&self, name: &'static str) -> EventTrace {
        EventTrace { name, tracer: self.clone() }
    }
}

/// A timed operation; dropped traces are never reported.
#[must_use = "call commit() to report the trace"]
#[derive(Debug)]
pub struct OperationTrace {
    name: &'static str,
    session_id: Option<i64>,
    started: Instant,
    tracer: Tracer,
}

impl OperationTrace {
    pub fn with_session_id(mut self, session_id: i64) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn commit(self) {
        self.tracer.driver.add_trace(self.name, self.started.elapsed(), self.session_id);
    }
}

/// A counted event.
#[must_use = "call commit() to report the event"]
#[derive(Debug)]
pub struct EventTrace {
    name: &'static str,
    tracer: Tracer,
}

impl EventTrace {
    pub fn commit(self) {
        self.tracer.driver.add_count(self.name, 1);
    }
}

/// Driver that emits `tracing` events at trace level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracerDriver;

impl TracerDriver for LogTracerDriver {
    fn add_trace(&self, name: &str, elapsed: Duration, session_id: Option<i64>) {
        tracing::trace!(trace = name, elapsed_ms = elapsed.as_millis() as u64, session_id, "trace");
    }

    fn add_count(&self, name: &str, increment: u64) {
        tracing::trace!(counter = name, increment, "counter");
    }
}

/// Driver that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTracerDriver;

impl TracerDriver for NullTracerDriver {
    fn add_trace(&self, _name: &str, _elapsed: Duration, _session_id: Option<i64>) {}

    fn add_count(&self, _name: &str, _increment: u64) {}
}

/// Driver that keeps counters and trace timings in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryTracerDriver {
    counts: Arc<Mutex<HashMap<String, u64>>>,
    traces: Arc<Mutex<Vec<(String, Duration)>>>,
}

impl MemoryTracerDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter (0 when never incremented).
    pub fn count(&self, name: &str) -> u64 {
        self.counts.lock().map(|c| c.get(name).copied().unwrap_or(0)).unwrap_or(0)
    }

    /// Number of committed traces with the given name.
    pub fn trace_count(&self, name: &str) -> usize {
        self.traces.lock().map(|t| t.iter().filter(|(n, _)| n == name).count()).unwrap_or(0)
    }
}

impl TracerDriver for MemoryTracerDriver {
    fn add_trace(&self, name: &str, elapsed: Duration, _session_id: Option<i64>) {
        if let Ok(mut traces) = self.traces.lock() {
            traces.push((name.to_string(), elapsed));
        }
    }

    fn add_count(&self, name: &str, increment: u64) {
        if let Ok(mut counts) = self.counts.lock() {
            *counts.entry(name.to_string()).or_insert(0) += increment;
        }
    }
}
