//! Scriptable in-process runtime for tests and dry runs.
//!
//! A `MockRuntime` is cheap to clone; every clone shares the same state, so a
//! test can hand one clone to the orchestrator and keep another to inject
//! events and inspect what happened.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{Result, RuntimeError};
use crate::runtime::{AgentRuntime, EventStream, HistoryMessage, RawEvent, RuntimeLauncher};

/// Session id issued by default.
pub const MOCK_SESSION_ID: &str = "ses_mock";

type EventSender = mpsc::UnboundedSender<Result<RawEvent>>;

#[derive(Default)]
struct MockState {
    session_id: Mutex<Option<String>>,
    on_prompt: Mutex<Vec<RawEvent>>,
    history: Mutex<Option<Vec<HistoryMessage>>>,
    prompt_error: Mutex<Option<RuntimeError>>,
    sender: Mutex<Option<EventSender>>,
    prompts: Mutex<Vec<(String, String)>>,
    history_fetches: AtomicUsize,
    aborted: AtomicBool,
    shut_down: AtomicBool,
}

/// In-process stand-in for the agent runtime.
#[derive(Clone)]
pub struct MockRuntime {
    state: Arc<MockState>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// A runtime that issues [`MOCK_SESSION_ID`] and emits nothing by itself.
    pub fn new() -> Self {
        let state = MockState::default();
        *lock(&state.session_id) = Some(MOCK_SESSION_ID.to_string());
        Self {
            state: Arc::new(state),
        }
    }

    /// Session creation succeeds but yields no identifier.
    pub fn without_session_id(self) -> Self {
        *lock(&self.state.session_id) = None;
        self
    }

    /// Events emitted as soon as a prompt is accepted.
    pub fn on_prompt(self, events: Vec<RawEvent>) -> Self {
        *lock(&self.state.on_prompt) = events;
        self
    }

    /// History returned by `messages`. Without one, `messages` is unsupported.
    pub fn with_history(self, history: Vec<HistoryMessage>) -> Self {
        *lock(&self.state.history) = Some(history);
        self
    }

    /// Make the prompt submission fail with this error.
    pub fn failing_prompt(self, error: RuntimeError) -> Self {
        *lock(&self.state.prompt_error) = Some(error);
        self
    }

    /// Push an event into the live subscription. Returns false if nobody listens.
    pub fn emit(&self, event: RawEvent) -> bool {
        self.send(Ok(event))
    }

    /// Inject a transport failure into the live subscription.
    pub fn fail_stream(&self, reason: &str) -> bool {
        self.send(Err(RuntimeError::Stream {
            reason: reason.to_string(),
        }))
    }

    /// Close the live subscription from the runtime side.
    pub fn close_stream(&self) {
        lock(&self.state.sender).take();
    }

    fn send(&self, item: Result<RawEvent>) -> bool {
        lock(&self.state.sender)
            .as_ref()
            .is_some_and(|tx| tx.send(item).is_ok())
    }

    /// `(agent, prompt)` pairs received so far.
    pub fn prompts(&self) -> Vec<(String, String)> {
        lock(&self.state.prompts).clone()
    }

    pub fn history_fetches(&self) -> usize {
        self.state.history_fetches.load(Ordering::SeqCst)
    }

    pub fn was_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::SeqCst)
    }

    pub fn was_shut_down(&self) -> bool {
        self.state.shut_down.load(Ordering::SeqCst)
    }

    /// True once the consumer side of the subscription has been dropped.
    pub fn subscription_released(&self) -> bool {
        lock(&self.state.sender)
            .as_ref()
            .is_none_or(|tx| tx.is_closed())
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    async fn create_session(&self) -> Result<Option<String>> {
        Ok(lock(&self.state.session_id).clone())
    }

    async fn subscribe(&self) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.state.sender) = Some(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn prompt_async(&self, _session_id: &str, agent: &str, prompt: &str) -> Result<()> {
        if let Some(err) = lock(&self.state.prompt_error).take() {
            return Err(err);
        }
        lock(&self.state.prompts).push((agent.to_string(), prompt.to_string()));

        let scripted = lock(&self.state.on_prompt).clone();
        for event in scripted {
            self.emit(event);
        }
        Ok(())
    }

    async fn messages(&self, _session_id: &str) -> Result<Vec<HistoryMessage>> {
        self.state.history_fetches.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.history)
            .clone()
            .ok_or(RuntimeError::Unsupported("messages"))
    }

    async fn abort(&self, _session_id: &str) -> Result<()> {
        self.state.aborted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) {
        self.state.shut_down.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RuntimeLauncher for MockRuntime {
    async fn launch(&self) -> Result<Box<dyn AgentRuntime>> {
        Ok(Box::new(self.clone()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Builders for runtime events in the shape the runtime publishes them.
pub mod events {
    use super::*;

    /// A completed part (no `delta`).
    pub fn part(session_id: &str, part: serde_json::Value) -> RawEvent {
        let mut part = part;
        part["sessionID"] = json!(session_id);
        RawEvent::new("message.part.updated", json!({ "part": part }))
    }

    /// An incremental fragment of a part.
    pub fn part_delta(session_id: &str, part: serde_json::Value, delta: &str) -> RawEvent {
        let mut event = self::part(session_id, part);
        event.properties["delta"] = json!(delta);
        event
    }

    pub fn text(session_id: &str, text: &str) -> RawEvent {
        part(session_id, json!({ "type": "text", "text": text }))
    }

    pub fn reasoning(session_id: &str, text: &str) -> RawEvent {
        part(session_id, json!({ "type": "reasoning", "text": text }))
    }

    pub fn tool_call(session_id: &str, tool: &str, args: serde_json::Value) -> RawEvent {
        part(
            session_id,
            json!({ "type": "tool-invocation", "toolName": tool, "args": args, "toolCallId": "call_1" }),
        )
    }

    pub fn tool_result(session_id: &str, tool: &str, result: &str) -> RawEvent {
        part(
            session_id,
            json!({ "type": "tool-result", "toolName": tool, "result": result, "toolCallId": "call_1" }),
        )
    }

    /// A stateful `tool` part; one is published per status change of a call.
    pub fn tool_state(session_id: &str, tool: &str, call_id: &str, status: &str) -> RawEvent {
        part(
            session_id,
            json!({
                "type": "tool",
                "tool": tool,
                "callID": call_id,
                "state": { "status": status, "input": { "command": "ls" }, "output": "done" },
            }),
        )
    }

    pub fn file_edited(session_id: &str, file: &str, additions: u64, deletions: u64) -> RawEvent {
        RawEvent::new(
            "file.edited",
            json!({ "sessionID": session_id, "file": file, "additions": additions, "deletions": deletions }),
        )
    }

    pub fn todo_updated(session_id: &str, todos: &[&str]) -> RawEvent {
        let todos: Vec<_> = todos
            .iter()
            .map(|content| json!({ "content": content, "status": "pending" }))
            .collect();
        RawEvent::new(
            "todo.updated",
            json!({ "sessionID": session_id, "todos": todos }),
        )
    }

    pub fn session_idle(session_id: &str) -> RawEvent {
        RawEvent::new("session.idle", json!({ "sessionID": session_id }))
    }

    pub fn session_error(session_id: &str, name: &str, message: &str) -> RawEvent {
        RawEvent::new(
            "session.error",
            json!({
                "sessionID": session_id,
                "error": { "name": name, "data": { "message": message } },
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_scripted_events_arrive_after_prompt() {
        let mock = MockRuntime::new().on_prompt(vec![events::session_idle(MOCK_SESSION_ID)]);
        let mut stream = mock.subscribe().await.unwrap();

        mock.prompt_async(MOCK_SESSION_ID, "build", "hello").await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.kind, "session.idle");
        assert_eq!(mock.prompts(), vec![("build".to_string(), "hello".to_string())]);
    }

    #[tokio::test]
    async fn test_subscription_release_is_observable() {
        let mock = MockRuntime::new();
        let stream = mock.subscribe().await.unwrap();
        assert!(!mock.subscription_released());
        drop(stream);
        assert!(mock.subscription_released());
    }

    #[tokio::test]
    async fn test_history_unsupported_by_default() {
        let mock = MockRuntime::new();
        assert!(matches!(
            mock.messages(MOCK_SESSION_ID).await,
            Err(RuntimeError::Unsupported(_))
        ));
        assert_eq!(mock.history_fetches(), 1);
    }
}
