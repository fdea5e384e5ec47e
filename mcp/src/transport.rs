//! Transports for talking JSON-RPC to tool servers.
//!
//! Three transports are supported, selected by the `kind` discriminator of
//! [`ServerConfig`]:
//!
//! - **stdio** — spawn the server as a child process and exchange
//!   newline-delimited JSON-RPC frames over its stdin/stdout.
//! - **sse** — open a `text/event-stream` connection, learn the POST
//!   endpoint from the server's first `endpoint` event, then POST requests
//!   and read responses off the event stream.
//! - **streamable_http** — POST each request; the server answers with
//!   either a plain JSON body or a short-lived event stream.
//!
//! Transports are deliberately single-flight: one request is in the air at
//! a time, which matches the session-per-call lifecycle used by
//! [`ToolServerClient`](crate::client::ToolServerClient).

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use crate::error::McpError;
use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Parameters for spawning a stdio tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdioServerParams {
    /// Executable to spawn.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the child process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Configuration for one tool server, discriminated by transport kind.
///
/// Deserializes from the shapes described in the configuration surface:
/// `{name, kind: "stdio", params: {command, args, env}}` or
/// `{name, kind: "sse" | "streamable_http", url}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerConfig {
    Stdio { name: String, params: StdioServerParams },
    Sse { name: String, url: String },
    StreamableHttp { name: String, url: String },
}

impl ServerConfig {
    /// The server name used for routing and prompt generation.
    pub fn name(&self) -> &str {
        match self {
            ServerConfig::Stdio { name, .. } => name,
            ServerConfig::Sse { name, .. } => name,
            ServerConfig::StreamableHttp { name, .. } => name,
        }
    }
}

/// A connected, single-flight JSON-RPC channel to one server.
#[async_trait]
pub(crate) trait Transport: Send {
    /// Send a request frame and wait for the matching response, returning
    /// its `result` member.
    async fn request(&mut self, request: JsonRpcRequest) -> Result<Value, McpError>;

    /// Send a notification frame. No response is expected.
    async fn notify(&mut self, notification: JsonRpcNotification) -> Result<(), McpError>;
}

/// Open the transport described by `config`. The returned channel is ready
/// for the `initialize` handshake but has not performed it yet.
pub(crate) async fn open(config: &ServerConfig) -> Result<Box<dyn Transport>, McpError> {
    match config {
        ServerConfig::Stdio { params, .. } => {
            Ok(Box::new(StdioTransport::spawn(params).await?))
        }
        ServerConfig::Sse { url, .. } => Ok(Box::new(SseTransport::connect(url).await?)),
        ServerConfig::StreamableHttp { url, .. } => {
            Ok(Box::new(StreamableHttpTransport::new(url)?))
        }
    }
}

fn http_client() -> Result<reqwest::Client, McpError> {
    // No global request timeout: SSE responses are long-lived streams and
    // deadlines are enforced by the caller around each operation.
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| McpError::Connect(format!("failed to build HTTP client: {}", e)))
}

// ---------------------------------------------------------------------------
// stdio
// ---------------------------------------------------------------------------

/// Child-process transport exchanging newline-delimited frames.
struct StdioTransport {
    _child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl StdioTransport {
    async fn spawn(params: &StdioServerParams) -> Result<Self, McpError> {
        let mut child = Command::new(&params.command)
            .args(&params.args)
            .envs(&params.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                McpError::Connect(format!("failed to spawn '{}': {}", params.command, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Connect("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Connect("child stdout unavailable".to_string()))?;

        Ok(Self {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn write_frame(&mut self, frame: &impl serde::Serialize) -> Result<(), McpError> {
        let mut line = serde_json::to_string(frame)
            .map_err(|e| McpError::Protocol(format!("failed to encode frame: {}", e)))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Connect(format!("failed to write to server: {}", e)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| McpError::Connect(format!("failed to flush to server: {}", e)))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&mut self, request: JsonRpcRequest) -> Result<Value, McpError> {
        let id = request.id;
        self.write_frame(&request).await?;

        let mut line = String::new();
        loop {
            line.clear();
            let n = self
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| McpError::Connect(format!("failed to read from server: {}", e)))?;
            if n == 0 {
                return Err(McpError::Protocol(
                    "server closed stdout before responding".to_string(),
                ));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            // Frames that are not the awaited response (server-side
            // notifications or requests) are skipped.
            let Ok(response) = serde_json::from_str::<JsonRpcResponse>(trimmed) else {
                continue;
            };
            if !response.matches_id(id) {
                continue;
            }
            if let Some(err) = response.error {
                return Err(McpError::Protocol(format!(
                    "server error {}: {}",
                    err.code, err.message
                )));
            }
            return Ok(response.result.unwrap_or(Value::Null));
        }
    }

    async fn notify(&mut self, notification: JsonRpcNotification) -> Result<(), McpError> {
        self.write_frame(&notification).await
    }
}

// ---------------------------------------------------------------------------
// sse
// ---------------------------------------------------------------------------

/// Event-stream transport: responses arrive on a long-lived SSE connection
/// while requests are POSTed to the endpoint the server announced.
struct SseTransport {
    http: reqwest::Client,
    post_url: String,
    events: mpsc::Receiver<eventsource_stream::Event>,
}

impl SseTransport {
    async fn connect(url: &str) -> Result<Self, McpError> {
        let http = http_client()?;
        let response = http
            .get(url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| McpError::Connect(format!("SSE connect to {} failed: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(McpError::Connect(format!(
                "SSE connect to {} returned status {}",
                url,
                response.status()
            )));
        }

        let (tx, mut rx) = mpsc::channel(64);
        let mut stream = response.bytes_stream().eventsource();
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        // The first event names the endpoint for subsequent POSTs.
        let endpoint = loop {
            match rx.recv().await {
                Some(event) if event.event == "endpoint" => break event.data,
                Some(_) => continue,
                None => {
                    return Err(McpError::Connect(
                        "SSE stream ended before announcing an endpoint".to_string(),
                    ))
                }
            }
        };

        Ok(Self {
            http,
            post_url: resolve_endpoint(url, endpoint.trim()),
            events: rx,
        })
    }

    async fn post(&self, frame: &impl serde::Serialize) -> Result<(), McpError> {
        let response = self
            .http
            .post(&self.post_url)
            .json(frame)
            .send()
            .await
            .map_err(|e| McpError::Connect(format!("POST to {} failed: {}", self.post_url, e)))?;
        if !response.status().is_success() {
            return Err(McpError::Protocol(format!(
                "POST to {} returned status {}",
                self.post_url,
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&mut self, request: JsonRpcRequest) -> Result<Value, McpError> {
        let id = request.id;
        self.post(&request).await?;

        loop {
            let event = self.events.recv().await.ok_or_else(|| {
                McpError::Protocol("SSE stream ended while awaiting response".to_string())
            })?;
            if event.event != "message" {
                continue;
            }
            let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&event.data) else {
                continue;
            };
            if !response.matches_id(id) {
                continue;
            }
            if let Some(err) = response.error {
                return Err(McpError::Protocol(format!(
                    "server error {}: {}",
                    err.code, err.message
                )));
            }
            return Ok(response.result.unwrap_or(Value::Null));
        }
    }

    async fn notify(&mut self, notification: JsonRpcNotification) -> Result<(), McpError> {
        self.post(&notification).await
    }
}

/// Resolve the endpoint announced by an SSE server against the stream URL.
/// Absolute URLs pass through; paths are joined to the stream's origin.
fn resolve_endpoint(base_url: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    let origin = match base_url.find("://") {
        Some(scheme_end) => match base_url[scheme_end + 3..].find('/') {
            Some(path_start) => &base_url[..scheme_end + 3 + path_start],
            None => base_url,
        },
        None => base_url,
    };
    format!("{}/{}", origin.trim_end_matches('/'), endpoint.trim_start_matches('/'))
}

// ---------------------------------------------------------------------------
// streamable_http
// ---------------------------------------------------------------------------

/// Request/response transport where every frame is its own POST.
struct StreamableHttpTransport {
    http: reqwest::Client,
    url: String,
}

impl StreamableHttpTransport {
    fn new(url: &str) -> Result<Self, McpError> {
        Ok(Self {
            http: http_client()?,
            url: url.to_string(),
        })
    }

    async fn post(
        &self,
        frame: &impl serde::Serialize,
    ) -> Result<reqwest::Response, McpError> {
        let response = self
            .http
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(frame)
            .send()
            .await
            .map_err(|e| McpError::Connect(format!("POST to {} failed: {}", self.url, e)))?;
        if !response.status().is_success() {
            return Err(McpError::Protocol(format!(
                "POST to {} returned status {}",
                self.url,
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn request(&mut self, request: JsonRpcRequest) -> Result<Value, McpError> {
        let id = request.id;
        let response = self.post(&request).await?;

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let parsed = if content_type.starts_with("text/event-stream") {
            // The server streams; scan events for the frame answering us.
            let mut stream = response.bytes_stream().eventsource();
            let mut found = None;
            while let Some(item) = stream.next().await {
                let event = item.map_err(|e| {
                    McpError::Protocol(format!("event stream error: {}", e))
                })?;
                if event.event != "message" {
                    continue;
                }
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&event.data) {
                    if resp.matches_id(id) {
                        found = Some(resp);
                        break;
                    }
                }
            }
            found.ok_or_else(|| {
                McpError::Protocol("event stream ended without a response".to_string())
            })?
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| McpError::Protocol(format!("failed to read body: {}", e)))?;
            serde_json::from_str::<JsonRpcResponse>(&text).map_err(|e| {
                McpError::Protocol(format!("response is not a JSON-RPC frame: {}", e))
            })?
        };

        if let Some(err) = parsed.error {
            return Err(McpError::Protocol(format!(
                "server error {}: {}",
                err.code, err.message
            )));
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }

    async fn notify(&mut self, notification: JsonRpcNotification) -> Result<(), McpError> {
        self.post(&notification).await.map(|_| ())
    }
}
