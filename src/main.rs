//! Session runner entry point.
//!
//! Reads the prompt from stdin, runs one session and exits with the code of
//! its outcome. Diagnostics go to stderr; stdout carries the line protocol.

use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing_subscriber::EnvFilter;

use session_runner::config::{Cli, LogFormat, usage_exit_code};
use session_runner::error::ErrorKind;
use session_runner::orchestrator::{SessionOrchestrator, TerminationRecorder, TerminationState};
use session_runner::session_log::SessionLog;
use session_runner::signals::{ShutdownListener, until_signal};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let _ = dotenvy::dotenv();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return usage_exit_code(&e).into();
        }
    };
    init_tracing(cli.log_format);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            session_runner::orchestrator::ExitCode::Failure.into()
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<std::process::ExitCode> {
    let mut shutdown = ShutdownListener::install();
    let config = cli.into_config().context("Invalid configuration")?;

    let recorder = TerminationRecorder::new(&config.orchestrator.termination_state_path);
    let prompt = match until_signal(shutdown.recv(), read_prompt(tokio::io::stdin())).await {
        Ok(Ok(prompt)) => prompt,
        Ok(Err(e)) => {
            recorder
                .record(&TerminationState::failed(format!("{:#}", e), ErrorKind::Unclassified))
                .await;
            return Err(e);
        }
        Err(signal) => {
            tracing::info!(?signal, "Shutdown requested while reading the prompt");
            recorder.record(&signal.termination_state()).await;
            return Ok(signal.exit_code().into());
        }
    };

    let log = Arc::new(SessionLog::open(
        config.orchestrator.log_prefix.clone(),
        Some(&config.orchestrator.log_path),
    ));
    log.info(format!(
        "Starting {} session ({} chars of prompt)",
        config.agent,
        prompt.chars().count()
    ));

    let orchestrator = SessionOrchestrator::new(config.launcher, config.orchestrator, log);
    let report = orchestrator
        .run_until_shutdown(&prompt, &config.agent, shutdown.recv())
        .await;

    Ok(report.exit_code.into())
}

async fn read_prompt(mut input: impl AsyncRead + Unpin) -> anyhow::Result<String> {
    let mut prompt = String::new();
    input
        .read_to_string(&mut prompt)
        .await
        .context("Failed to read prompt from stdin")?;
    if prompt.trim().is_empty() {
        bail!("No prompt provided on stdin");
    }
    Ok(prompt)
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("session_runner=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
