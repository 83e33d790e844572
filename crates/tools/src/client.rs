//! Authenticated client for the practice-management REST API.
//!
//! Credentials come from the per-turn [`ToolContext`], never from shared
//! state: each request carries the caller's bearer token and profile id.

use clinscribe_config::BackendConfig;
use clinscribe_core::error::ToolError;
use clinscribe_core::tool::ToolContext;
use std::time::Duration;
use tracing::{debug, warn};

/// Every endpoint lives under this prefix.
const API_PREFIX: [&str; 2] = ["api", "v1"];

pub struct PracticeApiClient {
    base_url: reqwest::Url,
    http: reqwest::Client,
    timeout: Duration,
}

impl PracticeApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ToolError> {
        let base_url = reqwest::Url::parse(base_url)
            .map_err(|e| ToolError::Transport(format!("Invalid backend URL '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ToolError::Transport(format!("Backend URL '{base_url}' cannot be a base")));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        Ok(Self {
            base_url,
            http,
            timeout,
        })
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self, ToolError> {
        Self::new(&config.api_url, Duration::from_secs(config.timeout_secs))
    }

    /// Build an endpoint URL from path segments. Segments are percent-encoded,
    /// so an argument value can never escape its segment.
    pub fn endpoint<S: AsRef<str>>(&self, segments: &[S]) -> reqwest::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(API_PREFIX);
            path.extend(segments.iter().map(|s| s.as_ref()));
        }
        url
    }

    pub async fn get(
        &self,
        ctx: &ToolContext,
        tool_name: &str,
        url: reqwest::Url,
        query: &[(String, String)],
    ) -> Result<serde_json::Value, ToolError> {
        let request = self.http.get(url).query(query);
        self.send(ctx, tool_name, request).await
    }

    pub async fn post(
        &self,
        ctx: &ToolContext,
        tool_name: &str,
        url: reqwest::Url,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let request = self.http.post(url).json(body);
        self.send(ctx, tool_name, request).await
    }

    async fn send(
        &self,
        ctx: &ToolContext,
        tool_name: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<serde_json::Value, ToolError> {
        let token = ctx
            .auth_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ToolError::Unauthorized(tool_name.to_string()))?;

        let mut request = request.header("Authorization", bearer(token));
        if let Some(profile_id) = ctx.profile_id.as_deref() {
            request = request.header("profileid", profile_id);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::Timeout {
                    tool_name: tool_name.to_string(),
                    timeout_secs: self.timeout.as_secs(),
                }
            } else {
                ToolError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        debug!(tool = tool_name, status, "Backend responded");

        if status == 401 || status == 403 {
            return Err(ToolError::Unauthorized(tool_name.to_string()));
        }

        if !(200..300).contains(&status) {
            let message = response.text().await.unwrap_or_default();
            warn!(tool = tool_name, status, "Backend request failed");
            return Err(ToolError::Upstream {
                tool_name: tool_name.to_string(),
                status,
                message,
            });
        }

        response.json().await.map_err(|e| ToolError::ExecutionFailed {
            tool_name: tool_name.to_string(),
            reason: format!("Malformed response body: {e}"),
        })
    }
}

fn bearer(token: &str) -> String {
    let token = token.trim();
    if token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bearer {token}")
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    //! One-shot HTTP server for exercising real requests.

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serve one request with `status` and `body`; resolves to the raw request text.
    pub async fn serve_once(status: u16, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if raw.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&raw).to_string());
        });

        (format!("http://{addr}"), rx)
    }
}
