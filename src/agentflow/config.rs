//! Configuration structs for the runtime.
//!
//! These are plain serde types; users construct them manually or
//! deserialize them from whatever source their application uses. No config
//! file parsing lives in this crate.

use serde::{Deserialize, Serialize};

pub use mcp::{ServerConfig, StdioServerParams};

/// Model/provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider tag: `"anthropic"`, `"openai"`, or `"qwen"`.
    pub provider: String,
    /// Model identifier passed through to the provider.
    pub model_name: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u32>,
    /// Advisory context window size; recorded in env info, not enforced.
    #[serde(default)]
    pub max_context_length: Option<u64>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Tool-result retention: `-1` keeps all results, `0` keeps none,
    /// `k > 0` keeps the last `k`.
    #[serde(default = "default_keep_tool_result")]
    pub keep_tool_result: i64,
    #[serde(default)]
    pub repetition_penalty: Option<f64>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Whether to use the provider's native function calling. Defaults by
    /// provider: `true` for `openai`, `false` for `qwen` and `anthropic`
    /// (which speak the framed dialect).
    #[serde(default)]
    pub use_tool_calls: Option<bool>,
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_keep_tool_result() -> i64 {
    -1
}

/// Settings for the main agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainAgentConfig {
    /// Tool servers available to the main agent.
    #[serde(default)]
    pub tools: Vec<ServerConfig>,
    /// `(server_name, tool_name)` pairs hidden from the prompt and refused
    /// at dispatch.
    #[serde(default)]
    pub tool_blacklist: Vec<(String, String)>,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,
    /// Wall-clock budget in seconds for the whole run, sub-agent work
    /// included. `None` means unbounded.
    #[serde(default)]
    pub wall_clock_budget_secs: Option<u64>,
}

fn default_max_turns() -> u32 {
    20
}

fn default_max_tool_calls() -> u32 {
    40
}

/// Settings for one named sub-agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentConfig {
    /// Sub-agent name; doubles as the virtual tool name the main agent
    /// calls to delegate (e.g. `"agent-browsing"`).
    pub name: String,
    #[serde(default)]
    pub tools: Vec<ServerConfig>,
    #[serde(default)]
    pub tool_blacklist: Vec<(String, String)>,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,
}

/// The agent hierarchy: one main agent plus zero or more sub-agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSetConfig {
    pub main_agent: MainAgentConfig,
    #[serde(default)]
    pub sub_agents: Vec<SubAgentConfig>,
}

/// Root configuration handed to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub llm: LlmConfig,
    pub agent: AgentSetConfig,
}
