//! Session-side agent logic.
//!
//! - Event classification for one session's stream
//! - The consumer task that reports events and signals completion
//! - Context window monitoring

pub mod consumer;
pub mod context_monitor;
pub mod events;

pub use consumer::{Completion, ConsumerHandle, EventConsumer, SessionStats, StatsSnapshot};
pub use context_monitor::{ContextMonitor, ContextUsage};
pub use events::{EventClassifier, Part, SessionEvent, TodoItem, ToolCall, ToolResult};
