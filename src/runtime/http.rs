//! HTTP client for the agent runtime service.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;

use crate::error::{Result, RuntimeError};
use crate::runtime::server::LocalServer;
use crate::runtime::sse::SseParser;
use crate::runtime::{AgentRuntime, EventStream, HistoryMessage, RawEvent, RuntimeLauncher};

/// Timeout for plain request/response calls. The event stream has none.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Runtime reached over HTTP, optionally backed by a server we started.
pub struct HttpRuntime {
    client: Client,
    base_url: String,
    server: Option<LocalServer>,
}

impl HttpRuntime {
    /// Connect to an already running runtime.
    pub fn connect(base_url: impl Into<String>) -> Self {
        Self::with_server(base_url.into(), None)
    }

    fn with_server(base_url: String, server: Option<LocalServer>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            server,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Turn non-success statuses into errors, keeping the body for diagnosis.
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RuntimeError::Http {
            status: status.as_u16(),
            body,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SessionInfo {
    #[serde(default)]
    id: Option<String>,
}

#[async_trait]
impl AgentRuntime for HttpRuntime {
    async fn create_session(&self) -> Result<Option<String>> {
        let response = self
            .client
            .post(self.url("session"))
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({}))
            .send()
            .await?;
        let info: SessionInfo = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| RuntimeError::InvalidResponse {
                reason: format!("session create: {}", e),
            })?;

        Ok(info.id.filter(|id| !id.is_empty()))
    }

    async fn subscribe(&self) -> Result<EventStream> {
        let response = self
            .client
            .get(self.url("event"))
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        let body = Box::pin(Self::check(response).await?.bytes_stream());

        let stream = futures::stream::unfold(
            (body, SseParser::default(), Vec::<RawEvent>::new().into_iter()),
            |(mut body, mut parser, mut pending)| async move {
                loop {
                    if let Some(event) = pending.next() {
                        return Some((Ok(event), (body, parser, pending)));
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => pending = parser.feed(&chunk).into_iter(),
                        Some(Err(e)) => {
                            let err = RuntimeError::Stream {
                                reason: e.to_string(),
                            };
                            return Some((Err(err), (body, parser, pending)));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }

    async fn prompt_async(&self, session_id: &str, agent: &str, prompt: &str) -> Result<()> {
        let body = json!({
            "agent": agent,
            "parts": [{ "type": "text", "text": prompt }],
        });
        let response = self
            .client
            .post(self.url(&format!("session/{}/prompt_async", session_id)))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<HistoryMessage>> {
        let response = self
            .client
            .get(self.url(&format!("session/{}/message", session_id)))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| RuntimeError::InvalidResponse {
                reason: format!("message history: {}", e),
            })
    }

    async fn abort(&self, session_id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("session/{}/abort", session_id)))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn shutdown(&self) {
        if let Some(server) = &self.server {
            server.shutdown().await;
        }
    }
}

/// Launches [`HttpRuntime`] connections from configuration.
#[derive(Debug, Clone)]
pub struct HttpLauncher {
    /// Existing runtime to connect to. `None` starts a local server.
    pub base_url: Option<String>,
    pub command: String,
    pub port: u16,
    pub workdir: PathBuf,
    pub startup_timeout: Duration,
}

#[async_trait]
impl RuntimeLauncher for HttpLauncher {
    async fn launch(&self) -> Result<Box<dyn AgentRuntime>> {
        if let Some(url) = &self.base_url {
            tracing::info!("Connecting to runtime at {}", url);
            return Ok(Box::new(HttpRuntime::connect(url.clone())));
        }

        let server =
            LocalServer::start(&self.command, self.port, &self.workdir, self.startup_timeout)
                .await?;
        let url = server.base_url();
        Ok(Box::new(HttpRuntime::with_server(url, Some(server))))
    }
}
