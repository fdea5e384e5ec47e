//! AgentFlow: an agent orchestration runtime.
//!
//! Drives a language-model task solver through iterative turns of
//! reason → emit tool call → execute tool → feed result back, with
//! hierarchical delegation to named sub-agents, MCP tool servers over
//! three transports, an ordered streaming event feed, and a replayable
//! task-log artifact written at task end.
//!
//! The typical host entry point is
//! [`execute_task_pipeline`](agentflow::pipeline::execute_task_pipeline);
//! the individual components (tool manager, LLM clients, parser, stream
//! bus) are public for hosts that wire their own loop.

pub mod agentflow;

// Re-exporting key items for easier external access.
pub use agentflow::client_wrapper::{
    LLMClient, LlmResponse, Message, MessageContent, Role, ServerToolset, TokenUsage, ToolCall,
    ToolCallResult, ToolListing,
};
pub use agentflow::config::{AgentSetConfig, Config, LlmConfig, MainAgentConfig, SubAgentConfig};
pub use agentflow::orchestrator::{MainAgentOutcome, Orchestrator};
pub use agentflow::pipeline::{create_pipeline_components, execute_task_pipeline, PipelineOutput};
pub use agentflow::stream::{StreamEvent, StreamHandler, StreamItem};
pub use agentflow::task_log::{InfoLevel, TaskLog, TaskLogHandle};
pub use agentflow::tool_manager::ToolManager;
