//! Exit code protocol consumed by the supervisor.
//!
//! ```text
//! ┌──────────────┬──────┬───────────────────────────────────────────┐
//! │ Outcome      │ Code │ Supervisor action                         │
//! ├──────────────┼──────┼───────────────────────────────────────────┤
//! │ Success      │   0  │ mark work complete                        │
//! │ Failure      │   1  │ surface failure                           │
//! │ GracefulStop │   2  │ stop cleanly, do not restart              │
//! │ ContextLimit │   3  │ restart with a fresh context              │
//! │ Interrupted  │ 130  │ treat as user-initiated cancel            │
//! └──────────────┴──────┴───────────────────────────────────────────┘
//! ```

/// Process exit status for one session run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    Failure,
    GracefulStop,
    ContextLimit,
    Interrupted,
}

impl ExitCode {
    pub fn code(&self) -> u8 {
        match self {
            ExitCode::Success => 0,
            ExitCode::Failure => 1,
            ExitCode::GracefulStop => 2,
            ExitCode::ContextLimit => 3,
            ExitCode::Interrupted => 130,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Success),
            1 => Some(ExitCode::Failure),
            2 => Some(ExitCode::GracefulStop),
            3 => Some(ExitCode::ContextLimit),
            130 => Some(ExitCode::Interrupted),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.code())
    }
}
