//! Tool-server client: connect, list tools, call tools.
//!
//! A [`ToolServerClient`] owns the configuration of one server and opens a
//! fresh session for every operation: connect, run the `initialize`
//! handshake, exchange one logical request, drop the session. Spawned
//! stdio servers are killed when the session drops. Holding sessions open
//! across calls is a valid alternative lifecycle but this client keeps the
//! per-call model so that a crashed or wedged server affects exactly one
//! tool call.
//!
//! # Example
//!
//! ```rust,no_run
//! use mcp::{ServerConfig, StdioServerParams, ToolServerClient};
//! use std::collections::HashMap;
//!
//! # async {
//! let client = ToolServerClient::new(ServerConfig::Stdio {
//!     name: "tool-python".to_string(),
//!     params: StdioServerParams {
//!         command: "python".to_string(),
//!         args: vec!["-m".to_string(), "my_python_server".to_string()],
//!         env: HashMap::new(),
//!     },
//! });
//!
//! let tools = client.list_tools().await.unwrap();
//! let output = client
//!     .call_tool("run_python_code", serde_json::json!({"code": "print(2+2)"}))
//!     .await
//!     .unwrap();
//! # };
//! ```

use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;

use crate::error::McpError;
use crate::transport::{self, ServerConfig, Transport};
use crate::types::{
    initialize_params, CallToolResult, JsonRpcNotification, JsonRpcRequest, ListToolsResult,
    Tool,
};

/// Deadline for establishing a session (transport + `initialize`).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for a single `tools/call` round-trip.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Client for a single tool server.
pub struct ToolServerClient {
    config: ServerConfig,
    call_timeout: Duration,
}

impl ToolServerClient {
    /// Create a client with the default 600s per-call timeout.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the per-call timeout.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// The configured server name.
    pub fn server_name(&self) -> &str {
        self.config.name()
    }

    /// Open a transport and complete the `initialize` handshake, bounded by
    /// [`CONNECT_TIMEOUT`].
    async fn open_session(&self) -> Result<Session, McpError> {
        timeout(CONNECT_TIMEOUT, Session::open(&self.config))
            .await
            .map_err(|_| {
                McpError::Timeout(format!(
                    "connecting to server '{}' exceeded {}s",
                    self.config.name(),
                    CONNECT_TIMEOUT.as_secs()
                ))
            })?
    }

    /// Fetch the server's tool schemas.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        let mut session = self.open_session().await?;
        timeout(CONNECT_TIMEOUT, session.list_tools())
            .await
            .map_err(|_| {
                McpError::Timeout(format!(
                    "tools/list on server '{}' exceeded {}s",
                    self.config.name(),
                    CONNECT_TIMEOUT.as_secs()
                ))
            })?
    }

    /// Invoke a tool and return the text of the last content block of its
    /// result (the empty string when the result has no content).
    ///
    /// A result flagged `isError` by the server is surfaced as
    /// [`McpError::Execution`] carrying that text.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<String, McpError> {
        let mut session = self.open_session().await?;
        timeout(self.call_timeout, session.call_tool(tool_name, arguments))
            .await
            .map_err(|_| {
                McpError::Timeout(format!(
                    "tools/call '{}' on server '{}' exceeded {}s",
                    tool_name,
                    self.config.name(),
                    self.call_timeout.as_secs()
                ))
            })?
    }
}

/// One initialized connection. Dropping it tears the transport down.
struct Session {
    transport: Box<dyn Transport>,
    next_id: u64,
}

impl Session {
    async fn open(config: &ServerConfig) -> Result<Self, McpError> {
        let mut session = Session {
            transport: transport::open(config).await?,
            next_id: 0,
        };

        session
            .request("initialize", initialize_params("agentflow", env!("CARGO_PKG_VERSION")))
            .await
            .map_err(|e| McpError::Connect(format!("initialize failed: {}", e)))?;
        session
            .transport
            .notify(JsonRpcNotification::new(
                "notifications/initialized",
                Value::Null,
            ))
            .await?;

        Ok(session)
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, McpError> {
        self.next_id += 1;
        self.transport
            .request(JsonRpcRequest::new(self.next_id, method, params))
            .await
    }

    async fn list_tools(&mut self) -> Result<Vec<Tool>, McpError> {
        let result = self.request("tools/list", Value::Null).await?;
        let listed: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("malformed tools/list result: {}", e)))?;
        Ok(listed.tools)
    }

    async fn call_tool(&mut self, tool_name: &str, arguments: Value) -> Result<String, McpError> {
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let result = self.request("tools/call", params).await?;
        let call_result: CallToolResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("malformed tools/call result: {}", e)))?;

        let text = call_result.last_text();
        if call_result.is_error {
            return Err(McpError::Execution(text));
        }
        Ok(text)
    }
}
