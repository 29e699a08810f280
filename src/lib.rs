//! Agent session runner.
//!
//! Drives one coding-agent session against an external agent runtime and
//! reports the outcome to a supervising process through the exit code, a
//! line-oriented log and a termination state file.

pub mod agent;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod runtime;
pub mod session_log;
pub mod signals;
