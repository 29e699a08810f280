//! Termination state record.
//!
//! A small JSON file the supervisor reads to diagnose an abnormal exit
//! without scraping the log. It is written on failure, interruption and
//! forced termination, and removed after a planned exit.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{ErrorKind, StateError};

/// Why the process ended abnormally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TerminationState {
    Failed {
        error: String,
        error_type: String,
        failed_at: DateTime<Utc>,
    },
    Interrupted {
        interrupted_at: DateTime<Utc>,
    },
    Terminated {
        terminated_at: DateTime<Utc>,
    },
}

impl TerminationState {
    pub fn failed(error: impl Into<String>, kind: ErrorKind) -> Self {
        TerminationState::Failed {
            error: error.into(),
            error_type: kind.as_str().to_string(),
            failed_at: Utc::now(),
        }
    }

    pub fn interrupted() -> Self {
        TerminationState::Interrupted {
            interrupted_at: Utc::now(),
        }
    }

    pub fn terminated() -> Self {
        TerminationState::Terminated {
            terminated_at: Utc::now(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            TerminationState::Failed { .. } => "failed",
            TerminationState::Interrupted { .. } => "interrupted",
            TerminationState::Terminated { .. } => "terminated",
        }
    }
}

/// Writes and clears the termination record at a fixed path.
#[derive(Debug, Clone)]
pub struct TerminationRecorder {
    path: PathBuf,
}

impl TerminationRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the record, replacing any previous one.
    ///
    /// The JSON goes to a sibling temp file first and is renamed into place,
    /// so the supervisor never reads a half-written record.
    pub async fn try_record(&self, state: &TerminationState) -> Result<(), StateError> {
        let content = serde_json::to_string_pretty(state)?;
        let tmp_path = self.tmp_path();

        let write_result = async {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &self.path).await
        }
        .await;

        if let Err(source) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(StateError::Write {
                path: self.path.clone(),
                source,
            });
        }
        Ok(())
    }

    /// Best-effort write. A failure is logged and otherwise ignored.
    pub async fn record(&self, state: &TerminationState) {
        match self.try_record(state).await {
            Ok(()) => tracing::debug!(
                status = state.status(),
                path = %self.path.display(),
                "Termination state recorded"
            ),
            Err(e) => tracing::warn!("{}", e),
        }
    }

    /// Remove the record if present. A missing file is not an error.
    pub async fn try_clear(&self) -> Result<(), StateError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Best-effort removal.
    pub async fn clear(&self) {
        if let Err(e) = self.try_clear().await {
            tracing::warn!("{}", e);
        }
    }

    /// Read the current record. Used by tests and diagnostics.
    pub async fn load(&self) -> Option<TerminationState> {
        let content = tokio::fs::read_to_string(&self.path).await.ok()?;
        serde_json::from_str(&content).ok()
    }

    fn tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "termination_state".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
    }
}
