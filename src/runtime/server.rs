//! Local runtime server process.
//!
//! When no runtime URL is configured the runner starts the runtime itself:
//!
//! ```text
//! <command> serve --hostname 127.0.0.1 --port <port>   (cwd = workspace)
//! ```
//!
//! The child is killed on `shutdown()` and, as a backstop, when the handle
//! is dropped.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{Result, RuntimeError};

/// How often readiness is probed while the server boots.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A runtime server owned by this process.
pub struct LocalServer {
    child: Mutex<Option<Child>>,
    port: u16,
}

impl LocalServer {
    /// Spawn the server and wait until its port accepts connections.
    pub async fn start(
        command: &str,
        port: u16,
        workdir: &Path,
        startup_timeout: Duration,
    ) -> Result<Self> {
        tracing::info!(command, port, "Starting local runtime server");

        let child = Command::new(command)
            .args(["serve", "--hostname", "127.0.0.1", "--port"])
            .arg(port.to_string())
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::ServerSpawn {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        let server = Self {
            child: Mutex::new(Some(child)),
            port,
        };
        server.wait_ready(startup_timeout).await?;

        tracing::info!(port, "Local runtime server ready");
        Ok(server)
    }

    /// Base URL of the server.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(child) = self.child.lock().await.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(RuntimeError::ServerExited {
                        status: status.to_string(),
                    });
                }
            }

            if TcpStream::connect(("127.0.0.1", self.port)).await.is_ok() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                self.shutdown().await;
                return Err(RuntimeError::StartupTimeout(timeout));
            }

            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Kill the server and reap it. Safe to call more than once.
    pub async fn shutdown(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        if let Err(e) = child.kill().await {
            tracing::warn!("Failed to stop runtime server: {}", e);
        } else {
            tracing::debug!(port = self.port, "Runtime server stopped");
        }
    }
}
