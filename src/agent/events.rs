//! Event classification.
//!
//! Raw runtime events are loosely typed: the same concept can live under
//! several keys depending on the runtime version. Everything is normalized
//! here, at the boundary, into [`SessionEvent`]; nothing downstream looks at
//! raw JSON again.
//!
//! ```text
//!  RawEvent ──▶ session filter ──▶ Part normalization ──▶ thresholds ──▶ SessionEvent
//!                (foreign: drop)    (fallback chains)      (drop noise)
//! ```

use serde_json::Value;

use crate::runtime::RawEvent;

/// Completed reasoning shorter than or equal to this is not logged.
pub const THINKING_MIN_CHARS: usize = 100;
/// Completed text shorter than or equal to this is not logged.
pub const TEXT_MIN_CHARS: usize = 20;
/// Logged length of a reasoning line.
pub const THINKING_LOG_CHARS: usize = 150;
/// Logged length of a text line.
pub const TEXT_LOG_CHARS: usize = 200;
/// Maximum length of a textual tool result in trace records.
pub const TOOL_RESULT_MAX_CHARS: usize = 500;

const TOOL_NAME_KEYS: &[&str] = &["tool", "toolName", "name"];
const TOOL_ARGS_KEYS: &[&str] = &["args", "input", "arguments", "parameters"];
const TOOL_ID_KEYS: &[&str] = &["callID", "toolCallId", "callId", "id"];
const TOOL_RESULT_KEYS: &[&str] = &["result", "output"];

/// Closed set of facts worth logging.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Thinking { text: String },
    Text { text: String },
    ToolStart(ToolCall),
    ToolEnd(ToolResult),
    FileEdit {
        path: String,
        additions: u64,
        deletions: u64,
    },
    Todo { items: Vec<TodoItem> },
    SessionDone,
    SessionError {
        message: String,
        name: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub args: Value,
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub name: String,
    pub id: Option<String>,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TodoItem {
    pub content: String,
    pub status: Option<String>,
}

/// One piece of agent output, normalized from a raw part payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Reasoning { text: String, complete: bool },
    Text { text: String, complete: bool },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Other,
}

/// Classifies raw events for one session.
#[derive(Debug, Clone)]
pub struct EventClassifier {
    session_id: String,
}

impl EventClassifier {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// True if the event names a session and it is not ours.
    pub fn is_foreign(&self, event: &RawEvent) -> bool {
        event_session_id(event).is_some_and(|id| id != self.session_id)
    }

    /// Classify an event. `None` means nothing worth reporting.
    pub fn classify(&self, event: &RawEvent) -> Option<SessionEvent> {
        if self.is_foreign(event) {
            return None;
        }

        let props = &event.properties;
        match event.kind.as_str() {
            "message.part.updated" | "message.updated" => {
                let part = props.get("part")?;
                let is_delta = props.get("delta").is_some_and(|d| !d.is_null());
                classify_part(Part::from_value(part, is_delta))
            }
            "file.edited" => Some(SessionEvent::FileEdit {
                path: first_str(props, &["file", "path", "filePath"])?.to_string(),
                additions: props.get("additions").and_then(Value::as_u64).unwrap_or(0),
                deletions: props.get("deletions").and_then(Value::as_u64).unwrap_or(0),
            }),
            "todo.updated" => {
                let items = todo_items(props);
                (!items.is_empty()).then_some(SessionEvent::Todo { items })
            }
            "session.idle" => Some(SessionEvent::SessionDone),
            "session.status" => {
                let status = props.pointer("/status/type").and_then(Value::as_str);
                (status == Some("idle")).then_some(SessionEvent::SessionDone)
            }
            "session.error" => Some(session_error(props)),
            _ => None,
        }
    }
}

/// Apply the noise thresholds to a normalized part.
fn classify_part(part: Part) -> Option<SessionEvent> {
    match part {
        Part::Reasoning { text, complete } => (complete
            && text.chars().count() > THINKING_MIN_CHARS)
            .then_some(SessionEvent::Thinking { text }),
        Part::Text { text, complete } => (complete && text.chars().count() > TEXT_MIN_CHARS)
            .then_some(SessionEvent::Text { text }),
        Part::ToolCall(call) => Some(SessionEvent::ToolStart(call)),
        Part::ToolResult(result) => Some(SessionEvent::ToolEnd(result)),
        Part::Other => None,
    }
}

impl Part {
    /// Normalize a raw part. `is_delta` marks an incremental fragment.
    pub fn from_value(part: &Value, is_delta: bool) -> Self {
        let kind = part.get("type").and_then(Value::as_str).unwrap_or_default();
        let text = || {
            part.get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        // A part with timing info is finished once it carries an end time.
        let complete = !is_delta
            && part
                .get("time")
                .is_none_or(|time| time.get("end").is_some_and(|end| !end.is_null()));

        match kind {
            "reasoning" | "thinking" => Part::Reasoning {
                text: text(),
                complete,
            },
            "text" => Part::Text {
                text: text(),
                complete,
            },
            "tool-invocation" | "tool-call" => Part::ToolCall(tool_call(part)),
            "tool-result" => Part::ToolResult(tool_result(part)),
            "tool" => {
                let status = part.pointer("/state/status").and_then(Value::as_str);
                match status {
                    Some("completed") | Some("error") => Part::ToolResult(tool_result(part)),
                    _ => Part::ToolCall(tool_call(part)),
                }
            }
            _ => Part::Other,
        }
    }
}

/// Where a tool payload keeps its fields: top level, then nested containers.
fn tool_scopes(part: &Value) -> [Option<&Value>; 3] {
    [
        Some(part),
        part.get("toolInvocation"),
        part.get("state"),
    ]
}

fn tool_lookup<'a>(part: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    tool_scopes(part)
        .into_iter()
        .flatten()
        .find_map(|scope| {
            keys.iter()
                .find_map(|key| scope.get(*key).filter(|value| !value.is_null()))
        })
}

fn tool_name(part: &Value) -> String {
    tool_lookup(part, TOOL_NAME_KEYS)
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

fn tool_id(part: &Value) -> Option<String> {
    tool_lookup(part, TOOL_ID_KEYS)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn tool_call(part: &Value) -> ToolCall {
    ToolCall {
        name: tool_name(part),
        args: tool_lookup(part, TOOL_ARGS_KEYS)
            .cloned()
            .unwrap_or(Value::Object(Default::default())),
        id: tool_id(part),
    }
}

fn tool_result(part: &Value) -> ToolResult {
    let result = match tool_lookup(part, TOOL_RESULT_KEYS).or_else(|| part.pointer("/state/error"))
    {
        Some(Value::String(text)) => {
            Value::String(crate::session_log::truncate(text, TOOL_RESULT_MAX_CHARS))
        }
        Some(other) => other.clone(),
        None => Value::Null,
    };

    ToolResult {
        name: tool_name(part),
        id: tool_id(part),
        result,
    }
}

fn todo_items(props: &Value) -> Vec<TodoItem> {
    if let Some(todos) = props.get("todos").and_then(Value::as_array) {
        return todos
            .iter()
            .filter_map(|todo| {
                let content = first_str(todo, &["content", "text", "title"])?;
                Some(TodoItem {
                    content: content.to_string(),
                    status: todo.get("status").and_then(Value::as_str).map(str::to_string),
                })
            })
            .collect();
    }

    first_str(props, &["content", "todo"])
        .map(|content| {
            vec![TodoItem {
                content: content.to_string(),
                status: None,
            }]
        })
        .unwrap_or_default()
}

fn session_error(props: &Value) -> SessionEvent {
    let error = props.get("error");
    let message = error
        .and_then(|e| {
            e.pointer("/data/message")
                .or_else(|| e.get("message"))
                .and_then(Value::as_str)
                .or_else(|| e.as_str())
        })
        .or_else(|| props.get("message").and_then(Value::as_str))
        .unwrap_or("Unknown session error")
        .to_string();
    let name = error
        .and_then(|e| e.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);

    SessionEvent::SessionError { message, name }
}

fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
}

/// Session id embedded in an event, wherever this event kind keeps it.
pub fn event_session_id(event: &RawEvent) -> Option<&str> {
    let props = &event.properties;
    props
        .get("sessionID")
        .or_else(|| props.pointer("/part/sessionID"))
        .or_else(|| props.pointer("/info/sessionID"))
        .and_then(Value::as_str)
}
