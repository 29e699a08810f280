//! Connection to the external agent runtime.
//!
//! The runtime owns the actual agent: it creates sessions, accepts prompts,
//! publishes a server-sent event stream, and exposes message history. The
//! orchestrator only ever talks to it through [`AgentRuntime`], so the HTTP
//! client and the in-process mock are interchangeable.

pub mod http;
pub mod mock;
pub mod server;
pub mod sse;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use http::{HttpLauncher, HttpRuntime};
pub use server::LocalServer;
pub use sse::SseParser;

/// One event from the runtime's event stream, exactly as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Event-kind tag, e.g. `message.part.updated` or `session.idle`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Kind-dependent payload.
    #[serde(default)]
    pub properties: Value,
}

impl RawEvent {
    pub fn new(kind: impl Into<String>, properties: Value) -> Self {
        Self {
            kind: kind.into(),
            properties,
        }
    }
}

/// A message in the session history, reduced to what context estimation needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryMessage {
    #[serde(default)]
    pub parts: Vec<HistoryPart>,
}

/// One part of a history message. Non-text parts carry no `text`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl HistoryMessage {
    /// Build a single-part text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![HistoryPart {
                kind: "text".to_string(),
                text: Some(text.into()),
            }],
        }
    }
}

/// Live subscription to the runtime's event stream.
///
/// Dropping the stream releases the subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RawEvent>> + Send>>;

/// Operations the orchestrator needs from an agent runtime.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Create a new session. `Ok(None)` means the runtime answered without an id.
    async fn create_session(&self) -> Result<Option<String>>;

    /// Subscribe to the global event stream.
    async fn subscribe(&self) -> Result<EventStream>;

    /// Submit a prompt. Returns once the runtime accepted it, not when work is done.
    async fn prompt_async(&self, session_id: &str, agent: &str, prompt: &str) -> Result<()>;

    /// Fetch the full message history of a session.
    async fn messages(&self, session_id: &str) -> Result<Vec<HistoryMessage>>;

    /// Ask the runtime to abort the in-flight work of a session.
    async fn abort(&self, session_id: &str) -> Result<()>;

    /// Release the connection and anything the runtime started locally.
    async fn shutdown(&self);
}

/// Produces a connected runtime. Each call owns a fresh connection.
#[async_trait]
pub trait RuntimeLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn AgentRuntime>>;
}
