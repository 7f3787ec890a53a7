//! Task lifecycle events.
//!
//! The coordinator reports every state change of every task to the
//! [`EventListener`]s registered with the engine. Listeners are called from
//! the coordinating thread, one event at a time, in the order the changes
//! happened.

use std::io::Write;
use std::sync::Mutex;
use std::time::SystemTime;

use serde::Serialize;

use crate::core::TaskId;
use crate::outcome::SkipReason;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// The task was out of date and its actions are about to run.
    Started { reasons: Vec<String> },
    UpToDate,
    FromCache,
    Succeeded,
    Failed { cause: String },
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskEvent {
    pub task: TaskId,
    pub at: SystemTime,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl TaskEvent {
    pub fn new(task: TaskId, kind: EventKind) -> Self {
        Self {
            task,
            at: SystemTime::now(),
            kind,
        }
    }
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &TaskEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl EventListener for TracingListener {
    fn on_event(&self, event: &TaskEvent) {
        let task = &event.task;
        match &event.kind {
            EventKind::Started { reasons } => {
                tracing::info!(%task, "running");
                for reason in reasons {
                    tracing::debug!(%task, "{reason}");
                }
            }
            EventKind::UpToDate => tracing::info!(%task, "UP-TO-DATE"),
            EventKind::FromCache => tracing::info!(%task, "FROM-CACHE"),
            EventKind::Succeeded => tracing::info!(%task, "done"),
            EventKind::Failed { cause } => tracing::error!(%task, "FAILED: {cause}"),
            EventKind::Skipped { reason } => tracing::info!(%task, "SKIPPED: {reason}"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<TaskEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// The kinds of events recorded for `task`, in order.
    pub fn kinds_for(&self, task: &str) -> Vec<EventKind> {
        self.events()
            .into_iter()
            .filter(|event| event.task.as_str() == task)
            .map(|event| event.kind)
            .collect()
    }
}

impl EventListener for EventLog {
    fn on_event(&self, event: &TaskEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Writes each event as one line of JSON.
pub struct JsonLinesListener<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesListener<W> {
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

impl<W: Write + Send> EventListener for JsonLinesListener<W> {
    fn on_event(&self, event: &TaskEvent) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };

        let result = serde_json::to_writer(&mut *writer, event)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"));

        if let Err(e) = result {
            tracing::debug!("couldn't write event: {e}");
        }
    }
}
