//! Session lifecycle.
//!
//! ```text
//! Init ─► Connected ─► SessionCreated ─► PromptSent ─► Running ─┬─► Completed
//!                                                              ├─► SessionErrored
//!                                                              ├─► TimedOut
//!                                                              ├─► GracefulStop
//!                                                              └─► ContextLimit
//! any state ─► Failed | Interrupted | Terminated
//! ```
//!
//! While the session runs, a consumer task reads the event stream and the
//! polling loop here checks, once per tick: completion, the stop marker, the
//! context estimate, then the overall timeout. The consumer reports the
//! outcome exactly once over a oneshot channel. The event subscription and the
//! runtime connection are released on every path before `run` returns; on a
//! signal the dropped session future releases them through `Drop`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};

use crate::agent::{
    Completion, ContextMonitor, EventClassifier, EventConsumer, SessionStats, StatsSnapshot,
};
use crate::config::OrchestratorConfig;
use crate::error::{ErrorKind, RuntimeError};
use crate::orchestrator::exit_code::ExitCode;
use crate::orchestrator::stop::{StopPolicy, StopSignal};
use crate::orchestrator::termination::{TerminationRecorder, TerminationState};
use crate::runtime::{AgentRuntime, RuntimeLauncher};
use crate::session_log::{SessionLog, TraceKind};
use crate::signals::{ShutdownSignal, until_signal};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Init,
    Connected,
    SessionCreated,
    PromptSent,
    Running,
    /// The session went idle without error and without flags set.
    Completed,
    /// The agent reported an error through the event stream.
    SessionErrored {
        message: String,
        name: Option<String>,
    },
    TimedOut,
    GracefulStop,
    ContextLimit,
    /// A transport or API error, or a session without an id.
    Failed {
        error: String,
        kind: ErrorKind,
    },
    Interrupted,
    Terminated,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::Connected => "connected",
            SessionState::SessionCreated => "session_created",
            SessionState::PromptSent => "prompt_sent",
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::SessionErrored { .. } => "session_errored",
            SessionState::TimedOut => "timed_out",
            SessionState::GracefulStop => "graceful_stop",
            SessionState::ContextLimit => "context_limit",
            SessionState::Failed { .. } => "failed",
            SessionState::Interrupted => "interrupted",
            SessionState::Terminated => "terminated",
        }
    }

    /// Exit code of a terminal state; `None` while the session is in flight.
    pub fn exit_code(&self) -> Option<ExitCode> {
        match self {
            SessionState::Init
            | SessionState::Connected
            | SessionState::SessionCreated
            | SessionState::PromptSent
            | SessionState::Running => None,
            SessionState::Completed => Some(ExitCode::Success),
            SessionState::SessionErrored { .. }
            | SessionState::TimedOut
            | SessionState::Failed { .. } => Some(ExitCode::Failure),
            SessionState::GracefulStop | SessionState::Terminated => Some(ExitCode::GracefulStop),
            SessionState::ContextLimit => Some(ExitCode::ContextLimit),
            SessionState::Interrupted => Some(ExitCode::Interrupted),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.exit_code().is_some()
    }

    /// The record to persist for this outcome. `None` means planned exit.
    fn termination_record(&self, max_wait: Duration) -> Option<TerminationState> {
        match self {
            SessionState::Failed { error, kind } => Some(TerminationState::failed(error, *kind)),
            SessionState::SessionErrored { message, .. } => {
                Some(TerminationState::failed(message, ErrorKind::Session))
            }
            SessionState::TimedOut => Some(TerminationState::failed(
                format!("Session timed out after {}", describe(max_wait)),
                ErrorKind::Timeout,
            )),
            SessionState::Interrupted => Some(TerminationState::interrupted()),
            SessionState::Terminated => Some(TerminationState::terminated()),
            _ => None,
        }
    }
}

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub state: SessionState,
    pub exit_code: ExitCode,
    pub session_id: Option<String>,
    pub stop_requested: bool,
    pub context_limit_reached: bool,
    pub stats: StatsSnapshot,
    pub elapsed: Duration,
}

/// Mutable bookkeeping for the in-flight session.
#[derive(Debug)]
struct Progress {
    state: SessionState,
    session_id: Option<String>,
    stop_requested: bool,
    context_limit_reached: bool,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: SessionState::Init,
            session_id: None,
            stop_requested: false,
            context_limit_reached: false,
        }
    }

    fn advance(&mut self, next: SessionState) {
        tracing::debug!(from = self.state.name(), to = next.name(), "Session state");
        self.state = next;
    }
}

/// Drives one session from connection to exit code.
pub struct SessionOrchestrator<L> {
    launcher: L,
    config: OrchestratorConfig,
    log: Arc<SessionLog>,
    recorder: TerminationRecorder,
    stop: StopSignal,
    monitor: ContextMonitor,
}

impl<L: RuntimeLauncher> SessionOrchestrator<L> {
    pub fn new(launcher: L, config: OrchestratorConfig, log: Arc<SessionLog>) -> Self {
        let recorder = TerminationRecorder::new(&config.termination_state_path);
        let stop = StopSignal::new(&config.stop_flag_path, config.stop_policy);
        let monitor = ContextMonitor::new()
            .with_limit(config.context_window)
            .with_threshold(config.context_threshold);
        Self {
            launcher,
            config,
            log,
            recorder,
            stop,
            monitor,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn recorder(&self) -> &TerminationRecorder {
        &self.recorder
    }

    /// Run one session and return its exit code.
    pub async fn start(&self, prompt: &str, agent: &str) -> ExitCode {
        self.run(prompt, agent).await.exit_code
    }

    /// Run one session without listening for signals.
    pub async fn run(&self, prompt: &str, agent: &str) -> SessionReport {
        self.run_until_shutdown(prompt, agent, std::future::pending())
            .await
    }

    /// Run one session, giving up as soon as `shutdown` resolves.
    ///
    /// The signal takes priority over anything the session is doing; the
    /// in-flight session future is dropped and its resources released.
    pub async fn run_until_shutdown<F>(&self, prompt: &str, agent: &str, shutdown: F) -> SessionReport
    where
        F: Future<Output = ShutdownSignal>,
    {
        let started = Instant::now();
        let stats = Arc::new(SessionStats::default());
        let mut progress = Progress::new();

        let outcome = until_signal(shutdown, self.drive(prompt, agent, &stats, &mut progress)).await;

        let state = match outcome {
            Ok(state) => state,
            Err(ShutdownSignal::Interrupt) => {
                self.log.info("Interrupted, exiting");
                SessionState::Interrupted
            }
            Err(ShutdownSignal::Terminate) => {
                self.log.info("Termination requested, exiting gracefully");
                SessionState::Terminated
            }
        };

        self.finish(state, progress, &stats, started.elapsed()).await
    }

    async fn drive(
        &self,
        prompt: &str,
        agent: &str,
        stats: &Arc<SessionStats>,
        progress: &mut Progress,
    ) -> SessionState {
        let runtime = match self.launcher.launch().await {
            Ok(runtime) => runtime,
            Err(e) => return self.failure(e),
        };
        progress.advance(SessionState::Connected);

        let state = self
            .drive_connected(runtime.as_ref(), prompt, agent, stats, progress)
            .await;

        runtime.shutdown().await;
        state
    }

    async fn drive_connected(
        &self,
        runtime: &dyn AgentRuntime,
        prompt: &str,
        agent: &str,
        stats: &Arc<SessionStats>,
        progress: &mut Progress,
    ) -> SessionState {
        let session_id = match runtime.create_session().await {
            Ok(Some(id)) => id,
            Ok(None) => {
                let error = "Session creation returned no session id".to_string();
                self.log.info(format!("Error: {}", error));
                tracing::error!("{}", error);
                return SessionState::Failed {
                    error,
                    kind: ErrorKind::Unclassified,
                };
            }
            Err(e) => return self.failure(e),
        };
        progress.session_id = Some(session_id.clone());
        progress.advance(SessionState::SessionCreated);

        self.log.info(format!("Session created: {}", session_id));
        self.log.trace(
            TraceKind::SessionStart,
            json!({ "session_id": session_id, "agent": agent, "prompt_chars": prompt.chars().count() }),
        );

        let stream = match runtime.subscribe().await {
            Ok(stream) => stream,
            Err(e) => return self.failure(e),
        };
        let consumer = EventConsumer::new(
            EventClassifier::new(&session_id),
            self.log.clone(),
            stats.clone(),
        );
        let (consumer, done) = consumer.spawn(stream);

        let state = match runtime.prompt_async(&session_id, agent, prompt).await {
            Ok(()) => {
                progress.advance(SessionState::PromptSent);
                self.log.info(format!("Prompt sent to {} agent", agent));
                progress.advance(SessionState::Running);
                self.wait_for_completion(runtime, &session_id, done, progress)
                    .await
            }
            Err(e) => self.failure(e),
        };

        consumer.release().await;
        state
    }

    /// The polling loop.
    async fn wait_for_completion(
        &self,
        runtime: &dyn AgentRuntime,
        session_id: &str,
        mut done: oneshot::Receiver<Completion>,
        progress: &mut Progress,
    ) -> SessionState {
        // `None` means the duration reaches past what the clock can represent.
        let deadline = Instant::now().checked_add(self.config.max_wait);
        let mut next_context_check = Instant::now().checked_add(self.config.context_check_interval);
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consumer_gone = false;

        loop {
            tokio::select! {
                biased;
                completion = &mut done, if !consumer_gone => match completion {
                    Ok(completion) => return self.resolve(completion, progress),
                    Err(_) => {
                        tracing::debug!("Event consumer ended without a completion");
                        consumer_gone = true;
                        continue;
                    }
                },
                _ = ticker.tick() => {}
            }

            if !progress.stop_requested && self.stop.is_requested().await {
                progress.stop_requested = true;
                let policy = self.stop.policy();
                self.log.info(match policy {
                    StopPolicy::Finish => "Stop requested, letting the current work finish",
                    StopPolicy::Abort => "Stop requested, aborting the session",
                });
                self.log.trace(
                    TraceKind::StopRequested,
                    json!({ "policy": policy.to_string(), "path": self.stop.path().display().to_string() }),
                );
                if policy == StopPolicy::Abort {
                    if let Err(e) = runtime.abort(session_id).await {
                        tracing::warn!("Failed to abort session {}: {}", session_id, e);
                    }
                    return SessionState::GracefulStop;
                }
            }

            if !progress.stop_requested
                && !progress.context_limit_reached
                && next_context_check.is_some_and(|at| Instant::now() >= at)
            {
                next_context_check = Instant::now().checked_add(self.config.context_check_interval);
                if let Some(usage) = self.monitor.check(runtime, session_id).await {
                    self.log.trace(
                        TraceKind::ContextUsage,
                        json!({
                            "messages": usage.message_count,
                            "estimated_tokens": usage.estimated_tokens,
                            "limit": usage.limit,
                            "threshold": usage.threshold,
                            "percent": usage.percent(),
                        }),
                    );
                    if usage.exceeds_threshold() {
                        progress.context_limit_reached = true;
                        self.log.info(format!(
                            "Context usage ~{} tokens ({:.0}%) reached the restart threshold of {}",
                            usage.estimated_tokens,
                            usage.percent(),
                            usage.threshold
                        ));
                    }
                }
            }

            if deadline.is_some_and(|at| Instant::now() >= at) {
                self.log
                    .info(format!("Session timed out after {}", describe(self.config.max_wait)));
                tracing::warn!(session_id, "Session timed out");
                return SessionState::TimedOut;
            }
        }
    }

    /// Error beats context limit, which beats a stop request, which beats success.
    fn resolve(&self, completion: Completion, progress: &Progress) -> SessionState {
        match completion {
            Completion::Errored { message, name } => SessionState::SessionErrored { message, name },
            Completion::Idle if progress.context_limit_reached => {
                self.log.info("Context limit reached, exiting for restart");
                SessionState::ContextLimit
            }
            Completion::Idle if progress.stop_requested => {
                self.log.info("Work finished, stopping as requested");
                SessionState::GracefulStop
            }
            Completion::Idle => {
                self.log.info("Completed successfully");
                SessionState::Completed
            }
        }
    }

    fn failure(&self, error: RuntimeError) -> SessionState {
        let kind = error.kind();
        self.log.info(format!("Error ({}): {}", kind, error));
        tracing::error!(error_type = %kind, "Session failed: {}", error);
        SessionState::Failed {
            error: error.to_string(),
            kind,
        }
    }

    async fn finish(
        &self,
        state: SessionState,
        mut progress: Progress,
        stats: &SessionStats,
        elapsed: Duration,
    ) -> SessionReport {
        let exit_code = state.exit_code().unwrap_or(ExitCode::Failure);
        progress.advance(state.clone());

        match state.termination_record(self.config.max_wait) {
            Some(record) => self.recorder.record(&record).await,
            None => self.recorder.clear().await,
        }

        let stats = stats.snapshot();
        self.log.trace(
            TraceKind::SessionEnd,
            json!({
                "session_id": progress.session_id,
                "state": state.name(),
                "exit_code": exit_code.code(),
                "elapsed_ms": elapsed.as_millis() as u64,
                "stop_requested": progress.stop_requested,
                "context_limit_reached": progress.context_limit_reached,
                "stats": stats,
            }),
        );
        tracing::info!(
            state = state.name(),
            exit_code = exit_code.code(),
            "Session finished in {:.1}s",
            elapsed.as_secs_f64()
        );

        SessionReport {
            state,
            exit_code,
            session_id: progress.session_id,
            stop_requested: progress.stop_requested,
            context_limit_reached: progress.context_limit_reached,
            stats,
            elapsed,
        }
    }
}

/// `120 minutes`, `45s`, `300ms`.
fn describe(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 60 {
        "1 minute".to_string()
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{} minutes", secs / 60)
    } else if secs >= 1 {
        format!("{}s", secs)
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::{MOCK_SESSION_ID, MockRuntime, events};

    fn orchestrator(
        mock: &MockRuntime,
        dir: &tempfile::TempDir,
    ) -> SessionOrchestrator<MockRuntime> {
        let config = OrchestratorConfig::default()
            .with_state_dir(dir.path())
            .with_poll_interval(Duration::from_millis(10))
            .with_max_wait(Duration::from_secs(5));
        let log = Arc::new(SessionLog::open("AGENT", Some(&config.log_path)));
        SessionOrchestrator::new(mock.clone(), config, log)
    }

    #[test]
    fn test_terminal_states_map_to_exit_codes() {
        assert_eq!(SessionState::Running.exit_code(), None);
        assert!(!SessionState::Init.is_terminal());
        assert_eq!(SessionState::Completed.exit_code(), Some(ExitCode::Success));
        assert_eq!(SessionState::TimedOut.exit_code(), Some(ExitCode::Failure));
        assert_eq!(SessionState::ContextLimit.exit_code(), Some(ExitCode::ContextLimit));
        assert_eq!(SessionState::Terminated.exit_code(), Some(ExitCode::GracefulStop));
        assert_eq!(SessionState::Interrupted.exit_code(), Some(ExitCode::Interrupted));
    }

    #[test]
    fn test_planned_exits_leave_no_record() {
        let wait = Duration::from_secs(60);
        assert!(SessionState::Completed.termination_record(wait).is_none());
        assert!(SessionState::ContextLimit.termination_record(wait).is_none());
        assert!(SessionState::GracefulStop.termination_record(wait).is_none());
        match SessionState::TimedOut.termination_record(wait) {
            Some(TerminationState::Failed { error, error_type, .. }) => {
                assert_eq!(error, "Session timed out after 1 minute");
                assert_eq!(error_type, "TimeoutError");
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_describe_durations() {
        assert_eq!(describe(Duration::from_secs(7200)), "120 minutes");
        assert_eq!(describe(Duration::from_secs(45)), "45s");
        assert_eq!(describe(Duration::from_millis(300)), "300ms");
    }

    #[tokio::test]
    async fn test_error_takes_precedence_over_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockRuntime::new();
        let orchestrator = orchestrator(&mock, &dir);

        let mut progress = Progress::new();
        progress.stop_requested = true;
        progress.context_limit_reached = true;

        let state = orchestrator.resolve(
            Completion::Errored {
                message: "boom".to_string(),
                name: None,
            },
            &progress,
        );
        assert!(matches!(state, SessionState::SessionErrored { .. }));
        assert_eq!(
            orchestrator.resolve(Completion::Idle, &progress),
            SessionState::ContextLimit
        );

        progress.context_limit_reached = false;
        assert_eq!(
            orchestrator.resolve(Completion::Idle, &progress),
            SessionState::GracefulStop
        );
    }

    #[tokio::test]
    async fn test_report_carries_session_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockRuntime::new().on_prompt(vec![
            events::tool_call(MOCK_SESSION_ID, "bash", json!({ "command": "ls" })),
            events::session_idle(MOCK_SESSION_ID),
        ]);

        let report = orchestrator(&mock, &dir).run("hello", "build").await;

        assert_eq!(report.exit_code, ExitCode::Success);
        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.session_id.as_deref(), Some(MOCK_SESSION_ID));
        assert_eq!(report.stats.tool_calls, 1);
        assert!(mock.was_shut_down());
        assert!(mock.subscription_released());
    }

    #[tokio::test]
    async fn test_unbounded_waits_do_not_overflow_the_clock() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockRuntime::new().on_prompt(vec![events::session_idle(MOCK_SESSION_ID)]);
        let config = OrchestratorConfig::default()
            .with_state_dir(dir.path())
            .with_poll_interval(Duration::from_millis(10))
            .with_context_check_interval(Duration::MAX)
            .with_max_wait(Duration::MAX);
        let log = Arc::new(SessionLog::open("AGENT", Some(&config.log_path)));

        let report = SessionOrchestrator::new(mock.clone(), config, log)
            .run("hello", "build")
            .await;

        assert_eq!(report.exit_code, ExitCode::Success);
        assert_eq!(mock.history_fetches(), 0);
    }
}
