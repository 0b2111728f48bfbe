//! Structured pass events.
//!
//! Passes and pipelines report what they did through [`emit_pass_event`]. Events go to the sink
//! installed on the current thread, so independent pipelines running on different threads never
//! observe each other.

use std::cell::RefCell;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::Serialize;

/// Statistics reported after a pipeline pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub changed: bool,
    pub iterations: usize,
    pub rewrites_applied: usize,
    pub erased_insts: usize,
    /// Instructions across the whole module after the pass ran.
    pub module_len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PassEventKind {
    PassStats {
        run_id: Option<usize>,
        module: String,
        pass: String,
        stats: PassStats,
    },
    /// A run of commands was outlined into a new computation.
    CommandBufferLifted {
        module: String,
        parent: String,
        computation: String,
        commands: usize,
        instructions: usize,
        arguments: usize,
        results: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassEvent {
    pub timestamp: SystemTime,
    pub kind: PassEventKind,
}

impl PassEvent {
    pub fn now(kind: PassEventKind) -> Self {
        Self {
            timestamp: SystemTime::now(),
            kind,
        }
    }
}

/// Receiver of pass events.
pub trait PassEventSink: Send + Sync {
    fn on_event(&self, event: &PassEvent);
}

thread_local! {
    static CURRENT_SINK: RefCell<Option<Arc<dyn PassEventSink>>> = const { RefCell::new(None) };
}

/// Restores the previously installed sink when dropped.
#[must_use = "the sink is uninstalled when the guard is dropped"]
pub struct TraceGuard {
    previous: Option<Arc<dyn PassEventSink>>,
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_SINK.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// Installs `sink` for the current thread until the returned guard is dropped.
pub fn install_sink(sink: Arc<dyn PassEventSink>) -> TraceGuard {
    let previous = CURRENT_SINK.with(|slot| slot.borrow_mut().replace(sink));
    TraceGuard { previous }
}

pub fn current_sink() -> Option<Arc<dyn PassEventSink>> {
    CURRENT_SINK.with(|slot| slot.borrow().clone())
}

pub fn emit_pass_event(event: PassEvent) {
    if let Some(sink) = current_sink() {
        sink.on_event(&event);
    }
}

/// Collects events in memory; mostly useful in tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<PassEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PassEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn kinds(&self) -> Vec<PassEventKind> {
        self.events().into_iter().map(|event| event.kind).collect()
    }
}

impl PassEventSink for MemorySink {
    fn on_event(&self, event: &PassEvent) {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event.clone());
    }
}

/// Writes one JSON object per event.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> PassEventSink for JsonLinesSink<W> {
    fn on_event(&self, event: &PassEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize pass event");
                return;
            }
        };
        let mut writer = match self.writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = writeln!(writer, "{line}") {
            tracing::warn!(error = %err, "failed to write pass event");
        }
    }
}
