//! External stop signal.
//!
//! An operator requests a graceful stop by creating a marker file. The
//! marker is only ever read here, never written or removed.

use std::path::{Path, PathBuf};

/// What to do with in-flight work once a stop is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopPolicy {
    /// Let the current unit of work finish, then exit with the graceful code.
    #[default]
    Finish,
    /// Abort the session right away and exit with the graceful code.
    Abort,
}

impl std::str::FromStr for StopPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "finish" | "drain" | "wait" => Ok(StopPolicy::Finish),
            "abort" | "immediate" => Ok(StopPolicy::Abort),
            _ => Err(format!(
                "invalid stop policy '{}', expected 'finish' or 'abort'",
                s
            )),
        }
    }
}

impl std::fmt::Display for StopPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopPolicy::Finish => f.write_str("finish"),
            StopPolicy::Abort => f.write_str("abort"),
        }
    }
}

/// Watches for the stop marker.
#[derive(Debug, Clone)]
pub struct StopSignal {
    path: PathBuf,
    policy: StopPolicy,
}

impl StopSignal {
    pub fn new(path: impl Into<PathBuf>, policy: StopPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> StopPolicy {
        self.policy
    }

    /// Whether the marker is present. Anything unreadable counts as absent.
    pub async fn is_requested(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parsing() {
        assert_eq!("finish".parse::<StopPolicy>().unwrap(), StopPolicy::Finish);
        assert_eq!("ABORT".parse::<StopPolicy>().unwrap(), StopPolicy::Abort);
        assert!("later".parse::<StopPolicy>().is_err());
        assert_eq!(StopPolicy::default(), StopPolicy::Finish);
        assert_eq!(StopPolicy::Abort.to_string(), "abort");
    }

    #[tokio::test]
    async fn test_marker_presence() {
        let dir = tempfile::tempdir().unwrap();
        let signal = StopSignal::new(dir.path().join("stop_requested"), StopPolicy::Finish);

        assert!(!signal.is_requested().await);
        std::fs::write(signal.path(), "").unwrap();
        assert!(signal.is_requested().await);
        std::fs::remove_file(signal.path()).unwrap();
        assert!(!signal.is_requested().await);
    }

    #[tokio::test]
    async fn test_missing_parent_is_not_requested() {
        let signal = StopSignal::new("/nonexistent/dir/stop_requested", StopPolicy::Abort);
        assert!(!signal.is_requested().await);
    }
}
