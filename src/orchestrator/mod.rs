//! Session orchestration.
//!
//! - Lifecycle state machine and polling loop
//! - External stop marker
//! - Termination state record
//! - Exit code protocol

pub mod exit_code;
pub mod session;
pub mod stop;
pub mod termination;

pub use exit_code::ExitCode;
pub use session::{SessionOrchestrator, SessionReport, SessionState};
pub use stop::{StopPolicy, StopSignal};
pub use termination::{TerminationRecorder, TerminationState};
