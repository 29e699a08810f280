//! Configuration for the session runner.
//!
//! Every option is a command-line flag that falls back to an environment
//! variable (a `.env` file is loaded first by the binary). The raw values are
//! validated into an [`OrchestratorConfig`] and an [`HttpLauncher`] before any
//! session work starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::ConfigError;
use crate::orchestrator::{ExitCode, StopPolicy};
use crate::runtime::HttpLauncher;

/// Default state directory, relative to the working directory.
pub const DEFAULT_STATE_DIR: &str = ".session";

const STOP_FLAG_FILE: &str = "stop_requested";
const TERMINATION_STATE_FILE: &str = "termination_state.json";
const SESSION_LOG_FILE: &str = "session.log";

/// One week.
const MAX_WAIT_MINUTES_LIMIT: u64 = 7 * 24 * 60;
/// One hour.
const POLL_INTERVAL_MS_LIMIT: u64 = 60 * 60 * 1000;
/// One day.
const CONTEXT_CHECK_INTERVAL_SECS_LIMIT: u64 = 24 * 60 * 60;

/// Validated settings for one orchestrator run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on how long to wait for the session to complete.
    pub max_wait: Duration,
    /// Tick of the polling loop.
    pub poll_interval: Duration,
    /// How often the context estimate is refreshed.
    pub context_check_interval: Duration,
    /// Context window size in tokens.
    pub context_window: usize,
    /// Fraction of the window that triggers a restart.
    pub context_threshold: f64,
    pub stop_policy: StopPolicy,
    /// Marker file whose presence requests a graceful stop.
    pub stop_flag_path: PathBuf,
    /// Where the termination record is written.
    pub termination_state_path: PathBuf,
    /// Shared append-only log file.
    pub log_path: PathBuf,
    /// Prefix of human-readable log lines.
    pub log_prefix: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(120 * 60),
            poll_interval: Duration::from_secs(1),
            context_check_interval: Duration::from_secs(30),
            context_window: 200_000,
            context_threshold: 0.7,
            stop_policy: StopPolicy::Finish,
            stop_flag_path: Path::new(DEFAULT_STATE_DIR).join(STOP_FLAG_FILE),
            termination_state_path: Path::new(DEFAULT_STATE_DIR).join(TERMINATION_STATE_FILE),
            log_path: Path::new(DEFAULT_STATE_DIR).join(SESSION_LOG_FILE),
            log_prefix: "AGENT".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Put the stop marker, termination record and log file under `dir`.
    pub fn with_state_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        self.stop_flag_path = dir.join(STOP_FLAG_FILE);
        self.termination_state_path = dir.join(TERMINATION_STATE_FILE);
        self.log_path = dir.join(SESSION_LOG_FILE);
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_context_check_interval(mut self, interval: Duration) -> Self {
        self.context_check_interval = interval;
        self
    }

    pub fn with_stop_policy(mut self, policy: StopPolicy) -> Self {
        self.stop_policy = policy;
        self
    }
}

/// Format of the diagnostic log on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Drive one coding-agent session and report the outcome through the exit code.
///
/// The prompt is read from standard input.
#[derive(Debug, Parser)]
#[command(name = "session-runner", version)]
pub struct Cli {
    /// Agent behavioral profile passed with the prompt
    #[arg(long, env = "AGENT_TYPE", default_value = "build")]
    pub agent: String,

    /// Connect to an already running runtime instead of starting one
    #[arg(long, env = "RUNTIME_URL")]
    pub runtime_url: Option<String>,

    /// Command used to start a local runtime server
    #[arg(long, env = "RUNTIME_COMMAND", default_value = "opencode")]
    pub runtime_command: String,

    /// Port of the local runtime server
    #[arg(long, env = "RUNTIME_PORT", default_value_t = 4096)]
    pub runtime_port: u16,

    /// Seconds to wait for the local runtime server to accept connections
    #[arg(long, env = "RUNTIME_STARTUP_TIMEOUT_SECS", default_value_t = 30)]
    pub runtime_startup_timeout_secs: u64,

    /// Working directory of the local runtime server (defaults to the current directory)
    #[arg(long, env = "WORKSPACE_DIR")]
    pub workspace_dir: Option<PathBuf>,

    /// Maximum time to wait for the session to complete
    #[arg(long, env = "SESSION_MAX_WAIT_MINUTES", default_value_t = 120)]
    pub max_wait_minutes: u64,

    /// Tick of the polling loop
    #[arg(long, env = "SESSION_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Interval between context usage checks
    #[arg(long, env = "CONTEXT_CHECK_INTERVAL_SECS", default_value_t = 30)]
    pub context_check_interval_secs: u64,

    /// Context window size in tokens
    #[arg(long, env = "CONTEXT_WINDOW_TOKENS", default_value_t = 200_000)]
    pub context_window_tokens: usize,

    /// Fraction of the context window that triggers a restart (0.1 to 1.0)
    #[arg(long, env = "CONTEXT_RESTART_THRESHOLD", default_value_t = 0.7)]
    pub context_restart_threshold: f64,

    /// What to do when a stop is requested: finish or abort
    #[arg(long, env = "STOP_POLICY", default_value = "finish")]
    pub stop_policy: StopPolicy,

    /// Directory for the stop marker, termination record and session log
    #[arg(long, env = "SESSION_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    #[arg(long, env = "STOP_FLAG_PATH")]
    pub stop_flag_path: Option<PathBuf>,

    #[arg(long, env = "TERMINATION_STATE_PATH")]
    pub termination_state_path: Option<PathBuf>,

    #[arg(long, env = "SESSION_LOG_PATH")]
    pub session_log_path: Option<PathBuf>,

    /// Prefix of human-readable log lines
    #[arg(long, env = "LOG_PREFIX", default_value = "AGENT")]
    pub log_prefix: String,

    /// Diagnostic log format on stderr
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Everything the binary needs, validated.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub agent: String,
    pub orchestrator: OrchestratorConfig,
    pub launcher: HttpLauncher,
    pub log_format: LogFormat,
}

impl Cli {
    /// Validate the raw options.
    pub fn into_config(self) -> Result<RunnerConfig, ConfigError> {
        if self.agent.trim().is_empty() {
            return Err(invalid("AGENT_TYPE", "must not be empty"));
        }
        let max_wait_secs = bounded("SESSION_MAX_WAIT_MINUTES", self.max_wait_minutes, MAX_WAIT_MINUTES_LIMIT)?
            .checked_mul(60)
            .ok_or_else(|| invalid("SESSION_MAX_WAIT_MINUTES", "is too large"))?;
        bounded("SESSION_POLL_INTERVAL_MS", self.poll_interval_ms, POLL_INTERVAL_MS_LIMIT)?;
        bounded(
            "CONTEXT_CHECK_INTERVAL_SECS",
            self.context_check_interval_secs,
            CONTEXT_CHECK_INTERVAL_SECS_LIMIT,
        )?;
        if self.context_window_tokens == 0 {
            return Err(invalid("CONTEXT_WINDOW_TOKENS", "must be greater than zero"));
        }
        if !(0.1..=1.0).contains(&self.context_restart_threshold) {
            return Err(invalid(
                "CONTEXT_RESTART_THRESHOLD",
                format!("{} is outside 0.1..=1.0", self.context_restart_threshold),
            ));
        }
        if let Some(url) = &self.runtime_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(invalid("RUNTIME_URL", format!("'{}' is not an http(s) URL", url)));
            }
        }

        let workdir = match self.workspace_dir {
            Some(dir) => dir,
            None => std::env::current_dir()
                .map_err(|e| invalid("WORKSPACE_DIR", format!("current directory unavailable: {}", e)))?,
        };
        // Only a locally started server runs in the workspace.
        if self.runtime_url.is_none() && !workdir.is_dir() {
            return Err(ConfigError::MissingWorkspace(workdir));
        }

        let mut orchestrator = OrchestratorConfig {
            max_wait: Duration::from_secs(max_wait_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            context_check_interval: Duration::from_secs(self.context_check_interval_secs),
            context_window: self.context_window_tokens,
            context_threshold: self.context_restart_threshold,
            stop_policy: self.stop_policy,
            log_prefix: self.log_prefix,
            ..OrchestratorConfig::default()
        }
        .with_state_dir(&self.state_dir);

        if let Some(path) = self.stop_flag_path {
            orchestrator.stop_flag_path = path;
        }
        if let Some(path) = self.termination_state_path {
            orchestrator.termination_state_path = path;
        }
        if let Some(path) = self.session_log_path {
            orchestrator.log_path = path;
        }

        let launcher = HttpLauncher {
            base_url: self.runtime_url,
            command: self.runtime_command,
            port: self.runtime_port,
            workdir,
            startup_timeout: Duration::from_secs(self.runtime_startup_timeout_secs),
        };

        Ok(RunnerConfig {
            agent: self.agent,
            orchestrator,
            launcher,
            log_format: self.log_format,
        })
    }
}

/// Exit code for a command line clap refused to parse.
///
/// Help and version output count as success. Usage errors are failures and
/// must never look like a graceful stop.
pub fn usage_exit_code(err: &clap::Error) -> ExitCode {
    if err.use_stderr() {
        ExitCode::Failure
    } else {
        ExitCode::Success
    }
}

fn bounded(key: &str, value: u64, limit: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(invalid(key, "must be greater than zero"));
    }
    if value > limit {
        return Err(invalid(key, format!("{} exceeds the limit of {}", value, limit)));
    }
    Ok(value)
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}
