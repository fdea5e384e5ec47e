//! Error types for tool-server sessions.

use std::error::Error;
use std::fmt;

/// Errors surfaced by [`ToolServerClient`](crate::client::ToolServerClient)
/// operations.
///
/// Callers that feed tool results back into a conversation generally convert
/// these into error strings rather than propagating them: a failed tool call
/// is conversation data, not a crash.
#[derive(Debug, Clone)]
pub enum McpError {
    /// The transport could not be established (spawn failure, unreachable
    /// endpoint, failed `initialize` handshake).
    Connect(String),
    /// The server responded with something that does not conform to the
    /// protocol, or returned a JSON-RPC error object.
    Protocol(String),
    /// The tool ran but reported failure (`isError: true` in its result).
    Execution(String),
    /// A deadline expired while connecting or waiting for a response.
    Timeout(String),
}

impl fmt::Display for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpError::Connect(msg) => write!(f, "connection failed: {}", msg),
            McpError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            McpError::Execution(msg) => write!(f, "tool execution failed: {}", msg),
            McpError::Timeout(msg) => write!(f, "timed out: {}", msg),
        }
    }
}

impl Error for McpError {}
