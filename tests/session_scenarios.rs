//! End-to-end session scenarios against the in-process mock runtime.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use session_runner::config::OrchestratorConfig;
use session_runner::error::RuntimeError;
use session_runner::orchestrator::{
    ExitCode, SessionOrchestrator, SessionState, StopPolicy, TerminationState,
};
use session_runner::runtime::HistoryMessage;
use session_runner::runtime::mock::{MOCK_SESSION_ID, MockRuntime, events};
use session_runner::session_log::SessionLog;
use session_runner::signals::ShutdownSignal;

fn config(dir: &Path) -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_state_dir(dir)
        .with_poll_interval(Duration::from_millis(10))
        .with_context_check_interval(Duration::from_millis(20))
        .with_max_wait(Duration::from_secs(5))
}

fn orchestrator(mock: &MockRuntime, config: OrchestratorConfig) -> SessionOrchestrator<MockRuntime> {
    let log = Arc::new(SessionLog::open("AGENT", Some(&config.log_path)));
    SessionOrchestrator::new(mock.clone(), config, log)
}

fn read_log(config: &OrchestratorConfig) -> String {
    std::fs::read_to_string(&config.log_path).unwrap_or_default()
}

fn read_state(config: &OrchestratorConfig) -> Option<Value> {
    let content = std::fs::read_to_string(&config.termination_state_path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Wait until the mock has received the prompt.
async fn prompt_received(mock: &MockRuntime) {
    while mock.prompts().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_idle_session_exits_success() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let mock = MockRuntime::new().on_prompt(vec![events::session_idle(MOCK_SESSION_ID)]);

    let code = orchestrator(&mock, config.clone()).start("hello", "build").await;

    assert_eq!(code, ExitCode::Success);
    assert_eq!(mock.prompts(), vec![("build".to_string(), "hello".to_string())]);
    let log = read_log(&config);
    assert!(log.lines().any(|line| line.ends_with("Completed successfully")));
    assert!(!log.contains("timed out"));
    assert!(!config.termination_state_path.exists());
    assert!(mock.was_shut_down());
    assert!(mock.subscription_released());
}

#[tokio::test]
async fn test_success_removes_stale_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    std::fs::write(
        &config.termination_state_path,
        r#"{"status":"interrupted","interrupted_at":"2026-01-01T00:00:00Z"}"#,
    )
    .unwrap();
    let mock = MockRuntime::new().on_prompt(vec![events::session_idle(MOCK_SESSION_ID)]);

    let code = orchestrator(&mock, config.clone()).start("hello", "build").await;

    assert_eq!(code, ExitCode::Success);
    assert!(!config.termination_state_path.exists());
}

#[tokio::test]
async fn test_session_without_completion_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path()).with_max_wait(Duration::from_millis(150));
    let mock = MockRuntime::new();

    let report = orchestrator(&mock, config.clone()).run("hello", "build").await;

    assert_eq!(report.exit_code, ExitCode::Failure);
    assert_eq!(report.state, SessionState::TimedOut);
    assert!(read_log(&config).contains("Session timed out after 150ms"));

    let state = read_state(&config).unwrap();
    assert_eq!(state["status"], "failed");
    assert_eq!(state["error_type"], "TimeoutError");
    assert!(mock.was_shut_down());
    assert!(mock.subscription_released());
}

#[tokio::test]
async fn test_stream_failure_falls_through_to_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path()).with_max_wait(Duration::from_millis(150));
    let mock = MockRuntime::new();

    let watcher = mock.clone();
    tokio::spawn(async move {
        prompt_received(&watcher).await;
        watcher.fail_stream("connection reset by peer");
    });

    let report = orchestrator(&mock, config.clone()).run("hello", "build").await;

    assert_eq!(report.state, SessionState::TimedOut);
    let log = read_log(&config);
    assert!(log.contains("Event stream error"));
    assert!(!log.contains("Session error"));
}

#[tokio::test]
async fn test_stop_marker_lets_work_finish() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let mock = MockRuntime::new();

    let driver = mock.clone();
    let marker = config.stop_flag_path.clone();
    tokio::spawn(async move {
        prompt_received(&driver).await;
        std::fs::write(&marker, "").unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        driver.emit(events::file_edited(MOCK_SESSION_ID, "src/lib.rs", 4, 2));
        driver.emit(events::session_idle(MOCK_SESSION_ID));
    });

    let report = orchestrator(&mock, config.clone()).run("hello", "build").await;

    assert_eq!(report.exit_code, ExitCode::GracefulStop);
    assert_eq!(report.state, SessionState::GracefulStop);
    assert!(report.stop_requested);
    assert!(!mock.was_aborted());
    // The in-flight work was not discarded.
    assert_eq!(report.stats.file_edits, 1);
    assert!(config.stop_flag_path.exists());
    assert!(!config.termination_state_path.exists());

    let log = read_log(&config);
    assert_eq!(log.matches("Stop requested").count(), 1);
    assert!(log.contains("\"type\":\"stop_requested\""));
}

#[tokio::test]
async fn test_stop_marker_aborts_under_abort_policy() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path()).with_stop_policy(StopPolicy::Abort);
    let mock = MockRuntime::new();

    let driver = mock.clone();
    let marker = config.stop_flag_path.clone();
    tokio::spawn(async move {
        prompt_received(&driver).await;
        std::fs::write(&marker, "").unwrap();
    });

    let report = orchestrator(&mock, config.clone()).run("hello", "build").await;

    assert_eq!(report.exit_code, ExitCode::GracefulStop);
    assert!(mock.was_aborted());
    assert!(mock.was_shut_down());
    assert!(report.elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn test_session_error_beats_stop_request() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    std::fs::write(&config.stop_flag_path, "").unwrap();
    let mock = MockRuntime::new();

    let driver = mock.clone();
    tokio::spawn(async move {
        prompt_received(&driver).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        driver.emit(events::session_error(
            MOCK_SESSION_ID,
            "ProviderAuthError",
            "invalid credentials",
        ));
    });

    let report = orchestrator(&mock, config.clone()).run("hello", "build").await;

    assert_eq!(report.exit_code, ExitCode::Failure);
    assert!(report.stop_requested);
    assert!(matches!(report.state, SessionState::SessionErrored { .. }));

    let state = read_state(&config).unwrap();
    assert_eq!(state["status"], "failed");
    assert_eq!(state["error"], "invalid credentials");
    assert_eq!(state["error_type"], "SessionError");
    assert!(read_log(&config).contains("[AGENT] Session error: invalid credentials"));
}

#[tokio::test]
async fn test_large_history_exits_for_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let history: Vec<HistoryMessage> = (0..6)
        .map(|_| HistoryMessage::text("x".repeat(100_000)))
        .collect();
    let mock = MockRuntime::new().with_history(history);

    let driver = mock.clone();
    tokio::spawn(async move {
        while driver.history_fetches() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        driver.emit(events::session_idle(MOCK_SESSION_ID));
    });

    let report = orchestrator(&mock, config.clone()).run("hello", "build").await;

    assert_eq!(report.exit_code, ExitCode::ContextLimit);
    assert!(report.context_limit_reached);
    // The flag is set once and no further checks run.
    assert_eq!(mock.history_fetches(), 1);
    assert!(!config.termination_state_path.exists());

    let log = read_log(&config);
    assert!(log.contains("\"estimated_tokens\":150000"));
    assert!(log.contains("Context limit reached"));
}

#[tokio::test]
async fn test_small_history_completes_normally() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let mock = MockRuntime::new().with_history(vec![HistoryMessage::text("x".repeat(4_000))]);

    let driver = mock.clone();
    tokio::spawn(async move {
        while driver.history_fetches() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        driver.emit(events::session_idle(MOCK_SESSION_ID));
    });

    let report = orchestrator(&mock, config).run("hello", "build").await;

    assert_eq!(report.exit_code, ExitCode::Success);
    assert!(!report.context_limit_reached);
}

#[tokio::test]
async fn test_unavailable_history_never_fails_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let mock = MockRuntime::new();

    let driver = mock.clone();
    tokio::spawn(async move {
        while driver.history_fetches() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        driver.emit(events::session_idle(MOCK_SESSION_ID));
    });

    let report = orchestrator(&mock, config).run("hello", "build").await;

    assert_eq!(report.exit_code, ExitCode::Success);
}

#[tokio::test]
async fn test_foreign_events_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let mock = MockRuntime::new().on_prompt(vec![
        events::session_error("ses_other", "APIError", "not ours"),
        events::session_idle("ses_other"),
        events::tool_call("ses_other", "bash", json!({ "command": "rm -rf /" })),
        events::session_idle(MOCK_SESSION_ID),
    ]);

    let report = orchestrator(&mock, config.clone()).run("hello", "build").await;

    assert_eq!(report.exit_code, ExitCode::Success);
    assert_eq!(report.stats.foreign_events, 3);
    assert_eq!(report.stats.tool_calls, 0);
    let log = read_log(&config);
    assert!(!log.contains("not ours"));
    assert!(!log.contains("rm -rf"));
}

#[tokio::test]
async fn test_missing_session_id_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let mock = MockRuntime::new().without_session_id();

    let report = orchestrator(&mock, config.clone()).run("hello", "build").await;

    assert_eq!(report.exit_code, ExitCode::Failure);
    assert!(mock.prompts().is_empty());
    assert!(mock.was_shut_down());
    assert_eq!(read_state(&config).unwrap()["status"], "failed");
}

#[tokio::test]
async fn test_prompt_rejection_is_classified() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let mock = MockRuntime::new().failing_prompt(RuntimeError::Http {
        status: 429,
        body: "slow down".to_string(),
    });

    let report = orchestrator(&mock, config.clone()).run("hello", "build").await;

    assert_eq!(report.exit_code, ExitCode::Failure);
    assert!(mock.subscription_released());
    assert!(mock.was_shut_down());

    match serde_json::from_value::<TerminationState>(read_state(&config).unwrap()).unwrap() {
        TerminationState::Failed { error, error_type, .. } => {
            assert_eq!(error_type, "RateLimitError");
            assert!(error.contains("429"));
        }
        other => panic!("unexpected record: {:?}", other),
    }
}

#[tokio::test]
async fn test_termination_signal_exits_gracefully() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let mock = MockRuntime::new();

    let watcher = mock.clone();
    let shutdown = async move {
        prompt_received(&watcher).await;
        ShutdownSignal::Terminate
    };

    let report = orchestrator(&mock, config.clone())
        .run_until_shutdown("hello", "build", shutdown)
        .await;

    assert_eq!(report.exit_code, ExitCode::GracefulStop);
    assert_eq!(report.state, SessionState::Terminated);
    let state = read_state(&config).unwrap();
    assert_eq!(state["status"], "terminated");
    assert!(state["terminated_at"].is_string());

    // The dropped session releases its subscription.
    for _ in 0..100 {
        if mock.subscription_released() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(mock.subscription_released());
}

#[tokio::test]
async fn test_interrupt_takes_priority() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let mock = MockRuntime::new();

    let report = orchestrator(&mock, config.clone())
        .run_until_shutdown("hello", "build", async { ShutdownSignal::Interrupt })
        .await;

    assert_eq!(report.exit_code, ExitCode::Interrupted);
    assert_eq!(report.exit_code.code(), 130);
    let state = read_state(&config).unwrap();
    assert_eq!(state["status"], "interrupted");
    assert!(state["interrupted_at"].is_string());
}

#[tokio::test]
async fn test_session_end_trace_summarizes_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let mock = MockRuntime::new().on_prompt(vec![
        events::tool_call(MOCK_SESSION_ID, "read", json!({ "path": "README.md" })),
        events::tool_result(MOCK_SESSION_ID, "read", "# Title"),
        events::todo_updated(MOCK_SESSION_ID, &["write tests"]),
        events::session_idle(MOCK_SESSION_ID),
    ]);

    orchestrator(&mock, config.clone()).run("hello", "build").await;

    let log = read_log(&config);
    let end = log
        .lines()
        .filter_map(|line| line.strip_prefix("[TRACE] "))
        .filter_map(|json| serde_json::from_str::<Value>(json).ok())
        .find(|record| record["type"] == "session_end")
        .unwrap();
    assert_eq!(end["data"]["state"], "completed");
    assert_eq!(end["data"]["exit_code"], 0);
    assert_eq!(end["data"]["session_id"], MOCK_SESSION_ID);
    assert_eq!(end["data"]["stats"]["tool_calls"], 1);
    assert_eq!(end["data"]["stats"]["tool_results"], 1);
    assert_eq!(end["data"]["stats"]["todo_updates"], 1);
    assert!(log.contains("[AGENT] Todo [pending]: write tests"));
}
