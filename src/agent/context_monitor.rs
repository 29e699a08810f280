//! Context window monitoring and restart triggers.
//!
//! Estimates how much of the model's context window the session history
//! occupies and reports when the session should be restarted with a fresh
//! context.
//!
//! The estimate is characters / 4. The restart threshold is calibrated
//! against that heuristic; changing one means revisiting the other.

use crate::runtime::{AgentRuntime, HistoryMessage};

/// Default context window size in tokens.
const DEFAULT_CONTEXT_LIMIT: usize = 200_000;

/// Restart threshold as a fraction of the limit.
const RESTART_THRESHOLD: f64 = 0.7;

/// Approximate characters per token.
const CHARS_PER_TOKEN: usize = 4;

/// Monitors context size and decides when a restart is required.
#[derive(Debug, Clone)]
pub struct ContextMonitor {
    /// Maximum tokens in the context window.
    context_limit: usize,
    /// Fraction of the limit at which a restart is required.
    threshold_ratio: f64,
}

impl ContextMonitor {
    /// Create a new context monitor with default settings.
    pub fn new() -> Self {
        Self {
            context_limit: DEFAULT_CONTEXT_LIMIT,
            threshold_ratio: RESTART_THRESHOLD,
        }
    }

    /// Create with a custom context limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.context_limit = limit;
        self
    }

    /// Create with a custom threshold ratio.
    pub fn with_threshold(mut self, ratio: f64) -> Self {
        self.threshold_ratio = ratio.clamp(0.1, 1.0);
        self
    }

    /// Estimate the token count for a message history.
    pub fn estimate_tokens(&self, messages: &[HistoryMessage]) -> usize {
        count_chars(messages) / CHARS_PER_TOKEN
    }

    /// Check if the history is large enough to require a restart.
    pub fn needs_restart(&self, messages: &[HistoryMessage]) -> bool {
        self.estimate_tokens(messages) >= self.threshold()
    }

    /// Get the context limit.
    pub fn limit(&self) -> usize {
        self.context_limit
    }

    /// Get the current threshold in tokens.
    pub fn threshold(&self) -> usize {
        (self.context_limit as f64 * self.threshold_ratio).round() as usize
    }

    /// Measure a history against this monitor's limits.
    pub fn measure(&self, messages: &[HistoryMessage]) -> ContextUsage {
        let total_chars = count_chars(messages);
        let estimated_tokens = total_chars / CHARS_PER_TOKEN;
        ContextUsage {
            message_count: messages.len(),
            total_chars,
            estimated_tokens,
            limit: self.context_limit,
            threshold: self.threshold(),
        }
    }

    /// Fetch the session history and measure it.
    ///
    /// Returns `None` when the history is unavailable; the caller simply
    /// tries again on the next interval.
    pub async fn check(&self, runtime: &dyn AgentRuntime, session_id: &str) -> Option<ContextUsage> {
        match runtime.messages(session_id).await {
            Ok(messages) => Some(self.measure(&messages)),
            Err(e) => {
                tracing::debug!("Skipping context check: {}", e);
                None
            }
        }
    }
}

impl Default for ContextMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Sum the length of every text-bearing part.
fn count_chars(messages: &[HistoryMessage]) -> usize {
    messages
        .iter()
        .flat_map(|message| &message.parts)
        .filter_map(|part| part.text.as_deref())
        .map(|text| text.chars().count())
        .sum()
}

/// One context measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextUsage {
    pub message_count: usize,
    pub total_chars: usize,
    pub estimated_tokens: usize,
    pub limit: usize,
    pub threshold: usize,
}

impl ContextUsage {
    /// Whether the estimate reached the restart threshold.
    pub fn exceeds_threshold(&self) -> bool {
        self.estimated_tokens >= self.threshold
    }

    /// Usage as a percentage of the full window.
    pub fn percent(&self) -> f64 {
        if self.limit == 0 {
            return 100.0;
        }
        (self.estimated_tokens as f64 / self.limit as f64) * 100.0
    }
}
