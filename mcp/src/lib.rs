//! MCP client runtime for tool servers.
//!
//! This crate provides everything needed to talk to Model Context Protocol
//! tool servers from an agent runtime: serde types for the JSON-RPC 2.0
//! framing and the `initialize` / `tools/list` / `tools/call` methods, three
//! transports (stdio child processes, SSE, streamable HTTP), and a
//! per-server [`ToolServerClient`] with connect and call deadlines.
//!
//! Higher-level concerns — routing calls across many servers, feeding
//! results back into a conversation, prompt generation — live in the
//! `agentflow` crate; this one stays a reusable protocol layer.

pub mod client;
pub mod error;
pub mod transport;
pub mod types;

pub use client::{ToolServerClient, CONNECT_TIMEOUT, DEFAULT_CALL_TIMEOUT};
pub use error::McpError;
pub use transport::{ServerConfig, StdioServerParams};
pub use types::{CallToolResult, ContentBlock, Tool};
