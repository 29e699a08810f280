//! Process signals that end a session early.

use std::future::Future;

use crate::orchestrator::{ExitCode, TerminationState};

/// Which signal asked the process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT / ctrl-c: user-initiated cancel.
    Interrupt,
    /// SIGTERM: the supervisor asks for a stop.
    Terminate,
}

impl ShutdownSignal {
    pub fn exit_code(self) -> ExitCode {
        match self {
            ShutdownSignal::Interrupt => ExitCode::Interrupted,
            ShutdownSignal::Terminate => ExitCode::GracefulStop,
        }
    }

    /// The record left behind when this signal ends the process.
    pub fn termination_state(self) -> TerminationState {
        match self {
            ShutdownSignal::Interrupt => TerminationState::interrupted(),
            ShutdownSignal::Terminate => TerminationState::terminated(),
        }
    }
}

/// SIGINT and SIGTERM handlers, registered when the listener is built.
///
/// Signals delivered between [`ShutdownListener::install`] and the first
/// [`ShutdownListener::recv`] are not lost. A handler that cannot be
/// installed never fires; the process then runs without that signal.
pub struct ShutdownListener {
    #[cfg(unix)]
    interrupt: Option<tokio::signal::unix::Signal>,
    #[cfg(unix)]
    terminate: Option<tokio::signal::unix::Signal>,
}

impl ShutdownListener {
    /// Must be called from within a tokio runtime.
    pub fn install() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let install = |kind: SignalKind, name: &str| match signal(kind) {
                Ok(stream) => Some(stream),
                Err(e) => {
                    tracing::warn!("Failed to install {} handler: {}", name, e);
                    None
                }
            };
            Self {
                interrupt: install(SignalKind::interrupt(), "SIGINT"),
                terminate: install(SignalKind::terminate(), "SIGTERM"),
            }
        }

        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    /// Resolves on the next SIGINT or SIGTERM.
    pub async fn recv(&mut self) -> ShutdownSignal {
        let signal = self.next().await;
        tracing::debug!(?signal, "Shutdown signal received");
        signal
    }

    #[cfg(unix)]
    async fn next(&mut self) -> ShutdownSignal {
        let Self {
            interrupt,
            terminate,
        } = self;
        let interrupt = async move {
            if let Some(stream) = interrupt {
                if stream.recv().await.is_some() {
                    return ShutdownSignal::Interrupt;
                }
            }
            std::future::pending().await
        };
        let terminate = async move {
            if let Some(stream) = terminate {
                if stream.recv().await.is_some() {
                    return ShutdownSignal::Terminate;
                }
            }
            std::future::pending().await
        };

        tokio::select! {
            signal = interrupt => signal,
            signal = terminate => signal,
        }
    }

    #[cfg(not(unix))]
    async fn next(&mut self) -> ShutdownSignal {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownSignal::Interrupt,
            Err(e) => {
                tracing::warn!("Failed to listen for ctrl-c: {}", e);
                std::future::pending().await
            }
        }
    }
}

/// Run `work` unless `shutdown` resolves first.
///
/// The signal wins when both are ready.
pub async fn until_signal<S, F>(shutdown: S, work: F) -> Result<F::Output, ShutdownSignal>
where
    S: Future<Output = ShutdownSignal>,
    F: Future,
{
    tokio::select! {
        biased;
        signal = shutdown => Err(signal),
        output = work => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signals_map_to_exit_codes_and_records() {
        assert_eq!(ShutdownSignal::Interrupt.exit_code().code(), 130);
        assert_eq!(ShutdownSignal::Terminate.exit_code().code(), 2);
        assert_eq!(ShutdownSignal::Interrupt.termination_state().status(), "interrupted");
        assert_eq!(ShutdownSignal::Terminate.termination_state().status(), "terminated");
    }

    #[tokio::test]
    async fn test_signal_cuts_short_pending_work() {
        let outcome = until_signal(
            async { ShutdownSignal::Terminate },
            std::future::pending::<()>(),
        )
        .await;
        assert_eq!(outcome, Err(ShutdownSignal::Terminate));

        let outcome = until_signal(std::future::pending(), async { 7 }).await;
        assert_eq!(outcome, Ok(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_before_recv_is_not_lost() {
        let mut listener = ShutdownListener::install();

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let signal = tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .unwrap();
        assert_eq!(signal, ShutdownSignal::Terminate);
    }
}
