//! Event stream consumer.
//!
//! Runs as its own task for the lifetime of one session, turning classified
//! events into log lines and trace records. It stops as soon as the session
//! reports completion or an error and hands that single outcome to the
//! orchestrator over a oneshot channel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::agent::events::{
    EventClassifier, SessionEvent, TEXT_LOG_CHARS, THINKING_LOG_CHARS,
};
use crate::runtime::{EventStream, RawEvent};
use crate::session_log::{SessionLog, TraceKind, first_line};

/// How the session ended, as reported by the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The session went idle: the prompt has been fully worked.
    Idle,
    /// The agent's own execution failed.
    Errored {
        message: String,
        name: Option<String>,
    },
}

/// Activity counters, readable while the consumer is still running.
#[derive(Debug, Default)]
pub struct SessionStats {
    events: AtomicU64,
    foreign_events: AtomicU64,
    tool_calls: AtomicU64,
    tool_results: AtomicU64,
    file_edits: AtomicU64,
    todo_updates: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events: u64,
    pub foreign_events: u64,
    pub tool_calls: u64,
    pub tool_results: u64,
    pub file_edits: u64,
    pub todo_updates: u64,
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            foreign_events: self.foreign_events.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            tool_results: self.tool_results.load(Ordering::Relaxed),
            file_edits: self.file_edits.load(Ordering::Relaxed),
            todo_updates: self.todo_updates.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reports the events of one session.
pub struct EventConsumer {
    classifier: EventClassifier,
    log: Arc<SessionLog>,
    stats: Arc<SessionStats>,
    /// Call ids already reported as started. A stateful tool part is
    /// republished on every status change.
    started_calls: Mutex<HashSet<String>>,
}

impl EventConsumer {
    pub fn new(classifier: EventClassifier, log: Arc<SessionLog>, stats: Arc<SessionStats>) -> Self {
        Self {
            classifier,
            log,
            stats,
            started_calls: Mutex::new(HashSet::new()),
        }
    }

    /// False if this call id was already reported.
    fn first_start(&self, id: Option<&str>) -> bool {
        let Some(id) = id else {
            return true;
        };
        self.started_calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.to_string())
    }

    /// Report one event. Returns the completion it signals, if any.
    pub fn handle(&self, event: &RawEvent) -> Option<Completion> {
        SessionStats::bump(&self.stats.events);
        if self.classifier.is_foreign(event) {
            SessionStats::bump(&self.stats.foreign_events);
            return None;
        }

        match self.classifier.classify(event)? {
            SessionEvent::Thinking { text } => {
                let line = first_line(&text, THINKING_LOG_CHARS);
                self.log.info(format!("Thinking: {}", line));
                self.log.trace(
                    TraceKind::Thinking,
                    json!({ "text": line, "length": text.chars().count() }),
                );
            }
            SessionEvent::Text { text } => {
                let line = first_line(&text, TEXT_LOG_CHARS);
                self.log.info(format!("Response: {}", line));
                self.log.trace(
                    TraceKind::Text,
                    json!({ "text": line, "length": text.chars().count() }),
                );
            }
            SessionEvent::ToolStart(call) => {
                if !self.first_start(call.id.as_deref()) {
                    tracing::debug!(tool = %call.name, "Tool call already reported");
                    return None;
                }
                SessionStats::bump(&self.stats.tool_calls);
                self.log.info(format!("Using tool: {}", call.name));
                self.log.trace(
                    TraceKind::ToolStart,
                    json!({ "tool": call.name, "args": call.args, "id": call.id }),
                );
            }
            SessionEvent::ToolEnd(result) => {
                SessionStats::bump(&self.stats.tool_results);
                tracing::debug!(tool = %result.name, "Tool finished");
                self.log.trace(
                    TraceKind::ToolEnd,
                    json!({ "tool": result.name, "id": result.id, "result": result.result }),
                );
            }
            SessionEvent::FileEdit {
                path,
                additions,
                deletions,
            } => {
                SessionStats::bump(&self.stats.file_edits);
                self.log.info(format!("Edited file: {}", path));
                self.log.trace(
                    TraceKind::FileEdit,
                    json!({ "path": path, "additions": additions, "deletions": deletions }),
                );
            }
            SessionEvent::Todo { items } => {
                SessionStats::bump(&self.stats.todo_updates);
                for item in &items {
                    match &item.status {
                        Some(status) => self.log.info(format!("Todo [{}]: {}", status, item.content)),
                        None => self.log.info(format!("Todo: {}", item.content)),
                    }
                }
                let items: Vec<_> = items
                    .iter()
                    .map(|item| json!({ "content": item.content, "status": item.status }))
                    .collect();
                self.log.trace(TraceKind::Todo, json!({ "items": items }));
            }
            SessionEvent::SessionDone => {
                tracing::debug!(session_id = self.classifier.session_id(), "Session idle");
                return Some(Completion::Idle);
            }
            SessionEvent::SessionError { message, name } => {
                self.log.info(format!("Session error: {}", message));
                self.log.trace(
                    TraceKind::SessionError,
                    json!({ "message": message, "name": name }),
                );
                return Some(Completion::Errored { message, name });
            }
        }

        None
    }

    /// Consume until the session completes, the stream ends, or it fails.
    ///
    /// A stream failure is logged but is not a session error; without a
    /// completion the orchestrator's timeout decides the outcome.
    pub async fn run(self, mut stream: EventStream, done: oneshot::Sender<Completion>) {
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    if let Some(completion) = self.handle(&event) {
                        let _ = done.send(completion);
                        return;
                    }
                }
                Err(e) => {
                    self.log.info(format!("Event stream failed: {}", e));
                    tracing::warn!("Event stream failed before completion: {}", e);
                    return;
                }
            }
        }

        tracing::warn!("Event stream closed before the session completed");
    }

    /// Run on a separate task.
    pub fn spawn(self, stream: EventStream) -> (ConsumerHandle, oneshot::Receiver<Completion>) {
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(self.run(stream, tx));
        (
            ConsumerHandle {
                handle: Some(handle),
            },
            rx,
        )
    }
}

/// Owns the consumer task and, through it, the event subscription.
///
/// Dropping the handle aborts the task; `release` also waits for it to
/// finish so the subscription is gone when it returns.
pub struct ConsumerHandle {
    handle: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
