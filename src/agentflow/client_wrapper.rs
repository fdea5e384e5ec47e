//! Shared primitives for provider-agnostic LLM clients.
//!
//! Applications interact with the model layer through the [`LLMClient`]
//! trait and the lightweight data types defined in this module. The trait
//! abstracts over concrete vendor implementations while the supporting
//! structs describe conversation messages, tool schemas, parsed tool calls,
//! and token accounting.
//!
//! # Dialects
//!
//! Two tool-call dialects flow through these types:
//!
//! - **Native** — the provider's built-in function calling. The raw calls
//!   appear as [`NativeToolCall`]s on the [`LlmResponse`] and tool results
//!   return to the model as [`Role::Tool`] messages correlated by
//!   `tool_call_id`.
//! - **Framed** — tool calls are embedded as `<use_mcp_tool>` blocks in the
//!   model's free-form text and tool results return as [`Role::User`]
//!   messages. Which dialect applies is a property of the provider
//!   implementation ([`LLMClient::uses_native_tool_calls`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System priming that constrains assistant behaviour.
    System,
    /// User-authored content — the initial task and, in the framed
    /// dialect, tool results fed back to the model.
    User,
    /// Model output, possibly carrying tool calls.
    Assistant,
    /// A native-dialect tool result correlated to a prior assistant tool
    /// call via [`Message::tool_call_id`].
    Tool,
}

/// Message content: either plain text or a list of typed text blocks.
///
/// The block form mirrors the Anthropic wire shape
/// `[{"type": "text", "text": "..."}]` so the tool-result retention pass
/// can rewrite block-list content in place without flattening it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<TextBlock>),
}

/// One `{type: "text", text}` content block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
}

impl TextBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            block_type: "text".to_string(),
            text: text.into(),
        }
    }
}

impl MessageContent {
    /// Flatten to plain text (blocks joined by newlines).
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Replace the content with `text`, preserving the text/blocks shape.
    pub fn replace_with(&mut self, text: &str) {
        match self {
            MessageContent::Text(slot) => *slot = text.to_string(),
            MessageContent::Blocks(blocks) => *blocks = vec![TextBlock::text(text)],
        }
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

/// An element of a conversation history. Histories are append-only during a
/// turn loop: an assistant message with tool calls is always followed by one
/// result message per call before the next assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    /// Tool calls requested by an assistant message. Empty for all other
    /// roles.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Correlation id on [`Role::Tool`] messages (native dialect only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name on [`Role::Tool`] messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: impl Into<MessageContent>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    /// A native-dialect tool-result message.
    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<MessageContent>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }

    /// Whether this message carries a tool result: every `tool` message,
    /// and every `user` message other than the initial task.
    pub fn is_tool_result_carrier(&self) -> bool {
        matches!(self.role, Role::User | Role::Tool)
    }
}

/// A parsed tool call, routed by `(server_name, tool_name)`.
///
/// `id` is present iff the call came from a provider's native
/// function-calling response; framed-dialect calls have no id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub server_name: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// The outcome of one tool call. Exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub server_name: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallResult {
    pub fn ok(server_name: &str, tool_name: &str, result: impl Into<String>) -> Self {
        Self {
            server_name: server_name.to_string(),
            tool_name: tool_name.to_string(),
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn err(server_name: &str, tool_name: &str, error: impl Into<String>) -> Self {
        Self {
            server_name: server_name.to_string(),
            tool_name: tool_name.to_string(),
            result: None,
            error: Some(error.into()),
        }
    }
}

/// One tool entry in a [`ServerToolset`]: either a loaded schema or the
/// error that prevented loading. Servers that fail `tools/list` surface as
/// a single `Failed` entry so the prompt can still describe the others.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolListing {
    Loaded {
        name: String,
        description: String,
        schema: Value,
    },
    Failed {
        error: String,
    },
}

/// The tools advertised by one server, in listing order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerToolset {
    pub name: String,
    pub tools: Vec<ToolListing>,
}

impl ServerToolset {
    /// Iterate the successfully loaded tools.
    pub fn loaded_tools(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.tools.iter().filter_map(|listing| match listing {
            ToolListing::Loaded {
                name,
                description,
                schema,
            } => Some((name.as_str(), description.as_str(), schema)),
            ToolListing::Failed { .. } => None,
        })
    }
}

/// Cumulative token accounting, unified across the OpenAI and Anthropic
/// usage reports:
///
/// - input/output tokens
/// - cache write/read input tokens (cache write is free on OpenAI-style
///   providers and reported as zero there)
///
/// Counters only ever grow; one instance accumulates over every successful
/// call made by one client.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_read_input_tokens: u64,
    pub total_cache_write_input_tokens: u64,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.total_input_tokens += other.total_input_tokens;
        self.total_output_tokens += other.total_output_tokens;
        self.total_cache_read_input_tokens += other.total_cache_read_input_tokens;
        self.total_cache_write_input_tokens += other.total_cache_write_input_tokens;
    }
}

/// A raw native-dialect tool call as returned by the provider: the joined
/// `"{server_name}-{tool_name}"` function name and the arguments as an
/// unparsed JSON string. The response parser splits and repairs these.
#[derive(Debug, Clone)]
pub struct NativeToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// A normalized provider response.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    /// The assistant's text content (may embed framed tool calls and a
    /// `<think>` block — extraction is the parser's job).
    pub content: String,
    /// Structured tool calls, present only for native-dialect providers.
    pub native_tool_calls: Vec<NativeToolCall>,
}

/// Trait-driven abstraction over a concrete model provider.
///
/// Implementations translate the unified request shape into the provider
/// wire format, enforce the per-call wall-clock timeout, apply the
/// tool-result retention pass, and accumulate token usage. Model failures
/// are data: `create_message` reports them as a `None` response rather than
/// an error, after logging a step.
#[async_trait]
pub trait LLMClient: Send + Sync + std::fmt::Debug {
    /// Call the model once.
    ///
    /// `keep_tool_result` bounds prompt growth: before sending, the content
    /// of every tool-result message *except* the initial task and the last
    /// `keep_tool_result` results is replaced with a fixed sentinel. `-1`
    /// disables the pass, `0` keeps no results.
    ///
    /// Returns the response (or `None` on timeout/provider error) together
    /// with the message history as sent onward to the caller.
    async fn create_message(
        &self,
        system_prompt: &str,
        message_history: &[Message],
        tool_definitions: &[ServerToolset],
        keep_tool_result: i64,
    ) -> (Option<LlmResponse>, Vec<Message>);

    /// Provider tag (`"anthropic"`, `"openai"`, …).
    fn provider(&self) -> &str;

    /// Model identifier sent upstream.
    fn model_name(&self) -> &str;

    /// Whether this provider emits native function calls (and therefore
    /// expects tool results as [`Role::Tool`] messages).
    fn uses_native_tool_calls(&self) -> bool;

    /// Snapshot of the accumulated token usage.
    async fn usage(&self) -> TokenUsage;

    /// Human-readable usage summary lines for the final banner, plus a
    /// single-line structured form for step logs.
    async fn format_token_usage_summary(&self) -> (Vec<String>, String) {
        let usage = self.usage().await;
        let total = usage.total_input_tokens
            + usage.total_output_tokens
            + usage.total_cache_read_input_tokens
            + usage.total_cache_write_input_tokens;
        let lines = vec![
            format!("{} Token Usage & Cost {}", "-".repeat(20), "-".repeat(20)),
            format!("Provider: {} | Model: {}", self.provider(), self.model_name()),
            format!("Input tokens: {}", usage.total_input_tokens),
            format!("Output tokens: {}", usage.total_output_tokens),
            format!(
                "Cache read input tokens: {}",
                usage.total_cache_read_input_tokens
            ),
            format!(
                "Cache write input tokens: {}",
                usage.total_cache_write_input_tokens
            ),
            format!("Total tokens: {}", total),
            "-".repeat(60),
        ];
        let log_line = format!(
            "token_usage provider={} model={} input={} output={} cache_read={} cache_write={}",
            self.provider(),
            self.model_name(),
            usage.total_input_tokens,
            usage.total_output_tokens,
            usage.total_cache_read_input_tokens,
            usage.total_cache_write_input_tokens,
        );
        (lines, log_line)
    }

    /// Release provider resources. The default implementation is a no-op;
    /// HTTP-backed clients share a pooled connection and need no teardown.
    fn close(&self) {}
}
