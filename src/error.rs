//! Error types for the session runner.

use std::path::PathBuf;
use std::time::Duration;

/// Errors raised while talking to the agent runtime service.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime answered with a non-success HTTP status.
    #[error("Runtime returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The request never produced a response (DNS, refused, reset, ...).
    #[error("Runtime request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response body could not be decoded.
    #[error("Invalid runtime response: {reason}")]
    InvalidResponse { reason: String },

    /// The local runtime server could not be spawned.
    #[error("Failed to start runtime server '{command}': {reason}")]
    ServerSpawn { command: String, reason: String },

    /// The local runtime server exited before it accepted connections.
    #[error("Runtime server exited before becoming ready (status: {status})")]
    ServerExited { status: String },

    /// The local runtime server did not accept connections in time.
    #[error("Runtime server not ready after {0:?}")]
    StartupTimeout(Duration),

    /// The event stream failed after it was established.
    #[error("Event stream error: {reason}")]
    Stream { reason: String },

    /// The operation is not offered by this runtime.
    #[error("Operation not supported by runtime: {0}")]
    Unsupported(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from building the orchestrator configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Workspace directory does not exist: {}", .0.display())]
    MissingWorkspace(PathBuf),
}

/// Errors from persisting the termination record.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Failed to serialize termination state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write termination state to {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove termination state at {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Closed classification of everything that can end a session in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    RateLimit,
    Timeout,
    Connection,
    Session,
    Unclassified,
}

impl ErrorKind {
    /// Name written into the termination record's `error_type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::RateLimit => "RateLimitError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Session => "SessionError",
            ErrorKind::Unclassified => "UnclassifiedError",
        }
    }

    /// Classify from an HTTP status code, if it is one we recognize.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 | 403 => Some(ErrorKind::Authentication),
            429 => Some(ErrorKind::RateLimit),
            408 | 504 => Some(ErrorKind::Timeout),
            502 | 503 => Some(ErrorKind::Connection),
            _ => None,
        }
    }

    /// Classify from a symbolic error code or name (e.g. `ProviderAuthError`).
    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.to_ascii_lowercase();
        if code.contains("auth") || code == "unauthorized" || code == "forbidden" {
            Some(ErrorKind::Authentication)
        } else if code.contains("ratelimit") || code.contains("rate_limit") || code == "throttled" {
            Some(ErrorKind::RateLimit)
        } else if code.contains("timeout") || code == "etimedout" {
            Some(ErrorKind::Timeout)
        } else if code == "econnrefused" || code == "econnreset" || code.contains("connection") {
            Some(ErrorKind::Connection)
        } else {
            None
        }
    }

    /// Fallback heuristics over a free-form error message.
    pub fn from_message(message: &str) -> Self {
        let msg = message.to_ascii_lowercase();
        if msg.contains("unauthorized")
            || msg.contains("authentication")
            || msg.contains("api key")
            || msg.contains("401")
        {
            ErrorKind::Authentication
        } else if msg.contains("rate limit") || msg.contains("too many requests") || msg.contains("429")
        {
            ErrorKind::RateLimit
        } else if msg.contains("timed out") || msg.contains("timeout") {
            ErrorKind::Timeout
        } else if msg.contains("connection refused")
            || msg.contains("connection reset")
            || msg.contains("econnrefused")
            || msg.contains("unreachable")
            || msg.contains("network")
        {
            ErrorKind::Connection
        } else {
            ErrorKind::Unclassified
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RuntimeError {
    /// Best-effort classification: structured fields first, then the message.
    pub fn kind(&self) -> ErrorKind {
        let structured = match self {
            RuntimeError::Http { status, .. } => ErrorKind::from_status(*status),
            RuntimeError::Transport(e) if e.is_timeout() => Some(ErrorKind::Timeout),
            RuntimeError::Transport(e) if e.is_connect() => Some(ErrorKind::Connection),
            RuntimeError::Transport(e) => e.status().and_then(|s| ErrorKind::from_status(s.as_u16())),
            RuntimeError::StartupTimeout(_) => Some(ErrorKind::Timeout),
            RuntimeError::ServerSpawn { .. } | RuntimeError::ServerExited { .. } => {
                Some(ErrorKind::Connection)
            }
            RuntimeError::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut => Some(ErrorKind::Timeout),
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted => Some(ErrorKind::Connection),
                _ => None,
            },
            _ => None,
        };

        structured.unwrap_or_else(|| ErrorKind::from_message(&self.to_string()))
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
