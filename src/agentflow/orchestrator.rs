//! The turn-based orchestrator: main agent loop and sub-agent delegation.
//!
//! One turn is one model call plus the zero-or-more tool executions its
//! response triggered. The loop runs until the model stops calling tools,
//! a budget (turns, tool calls, wall clock) is exhausted, the model call
//! fails, or the host cancels — then the answer generator performs one
//! final summarize call with tools disabled.
//!
//! Sub-agents are exposed to the main agent as virtual tools under the
//! reserved server name [`SUB_AGENT_SERVER_NAME`]: calling one suspends the
//! main loop, runs the delegate's own turn loop against its restricted
//! tool set, and feeds the delegate's summary report back as the tool
//! result.
//!
//! History appends are transactional per turn: the assistant message and
//! all of its tool results are pushed together, or not at all, so a
//! cancelled run never persists a half-finished turn.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::agentflow::client_wrapper::{
    LLMClient, Message, Role, ServerToolset, ToolCall, ToolListing,
};
use crate::agentflow::config::{MainAgentConfig, SubAgentConfig};
use crate::agentflow::formatter::OutputFormatter;
use crate::agentflow::parser::{extract_progress_summary, extract_response_text, ResponseParser};
use crate::agentflow::prompt::{
    generate_agent_specific_system_prompt, generate_agent_summarize_prompt,
    generate_mcp_system_prompt, AgentType, REFUSAL_MARKERS,
};
use crate::agentflow::stream::StreamHandler;
use crate::agentflow::task_log::{InfoLevel, TaskLogHandle};
use crate::agentflow::tool_manager::ToolManager;

/// Reserved server name under which sub-agent virtual tools are declared.
pub const SUB_AGENT_SERVER_NAME: &str = "agent-worker";

/// Errors that abort an orchestrator run outright. Model and tool failures
/// are handled inside the loop and never surface here.
#[derive(Debug)]
pub enum OrchestratorError {
    ExecutionFailed(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::ExecutionFailed(msg) => {
                write!(f, "orchestrator execution failed: {}", msg)
            }
        }
    }
}

impl Error for OrchestratorError {}

/// Result of a completed (or cancelled) main-agent run.
#[derive(Debug, Clone)]
pub struct MainAgentOutcome {
    /// Human-readable final banner: answer text, extracted result, usage.
    pub final_summary: String,
    /// The extracted boxed answer, or the format-error sentinel.
    pub boxed_answer: String,
    /// Single-line usage summary for step logs.
    pub usage_log: String,
    /// Set when the host cancelled the run before completion.
    pub cancelled: bool,
}

struct SubAgent {
    config: SubAgentConfig,
    manager: Arc<ToolManager>,
}

/// The top-level turn-loop driver.
pub struct Orchestrator {
    llm_client: Arc<dyn LLMClient>,
    main_tool_manager: Arc<ToolManager>,
    main_config: MainAgentConfig,
    sub_agents: Vec<SubAgent>,
    keep_tool_result: i64,
    task_log: TaskLogHandle,
    stream: StreamHandler,
    formatter: OutputFormatter,
    cancel: Option<watch::Receiver<bool>>,
}

struct TurnLoopCtx<'a> {
    agent_name: &'a str,
    is_main: bool,
    system_prompt: &'a str,
    parser: &'a ResponseParser,
    toolsets: &'a [ServerToolset],
    manager: &'a ToolManager,
    blacklist: &'a [(String, String)],
    max_turns: u32,
    max_tool_calls: u32,
    deadline: Option<Instant>,
    allow_delegation: bool,
}

struct TurnLoopOutcome {
    history: Vec<Message>,
    cancelled: bool,
}

impl Orchestrator {
    pub fn new(
        llm_client: Arc<dyn LLMClient>,
        main_tool_manager: Arc<ToolManager>,
        main_config: MainAgentConfig,
        keep_tool_result: i64,
        task_log: TaskLogHandle,
        stream: StreamHandler,
    ) -> Self {
        Self {
            llm_client,
            main_tool_manager,
            main_config,
            sub_agents: Vec::new(),
            keep_tool_result,
            task_log,
            stream,
            formatter: OutputFormatter::new(),
            cancel: None,
        }
    }

    /// Register a sub-agent with its own tool manager (builder pattern).
    pub fn with_sub_agent(mut self, config: SubAgentConfig, manager: Arc<ToolManager>) -> Self {
        self.sub_agents.push(SubAgent { config, manager });
        self
    }

    /// Attach a host cancellation signal. Flipping the sender to `true`
    /// stops the run at the next check point.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false)
    }

    /// The virtual toolset exposing one delegation tool per sub-agent.
    fn sub_agent_toolset(&self) -> Option<ServerToolset> {
        if self.sub_agents.is_empty() {
            return None;
        }
        Some(ServerToolset {
            name: SUB_AGENT_SERVER_NAME.to_string(),
            tools: self
                .sub_agents
                .iter()
                .map(|sub| ToolListing::Loaded {
                    name: sub.config.name.clone(),
                    description: format!(
                        "Delegate a self-contained subtask to the {} sub-agent. Describe the subtask completely; the sub-agent works with its own tools and returns a structured report of its findings.",
                        sub.config.name
                    ),
                    schema: serde_json::json!({
                        "type": "object",
                        "properties": {
                            "task_description": {
                                "type": "string",
                                "description": "Complete description of the subtask to delegate.",
                            },
                        },
                        "required": ["task_description"],
                    }),
                })
                .collect(),
        })
    }

    fn is_sub_agent_call(&self, call: &ToolCall) -> bool {
        self.sub_agents
            .iter()
            .any(|sub| sub.config.name == call.tool_name)
    }

    /// Run the main agent to completion and produce the final boxed answer.
    pub async fn run_main_agent(
        &self,
        task_description: &str,
    ) -> Result<MainAgentOutcome, OrchestratorError> {
        let deadline = self
            .main_config
            .wall_clock_budget_secs
            .map(|secs| Instant::now() + std::time::Duration::from_secs(secs));

        let mut toolsets = filter_blacklisted(
            self.main_tool_manager.get_all_tool_definitions().await,
            &self.main_config.tool_blacklist,
        );
        if let Some(virtual_toolset) = self.sub_agent_toolset() {
            toolsets.push(virtual_toolset);
        }

        let system_prompt = format!(
            "{}{}",
            generate_mcp_system_prompt(chrono::Utc::now().date_naive(), &toolsets),
            generate_agent_specific_system_prompt(AgentType::Main),
        );
        let parser = ResponseParser::from_system_prompt(&system_prompt);

        let agent_id = self.stream.start_agent("main", Some("Main Agent")).await;
        self.task_log.log_step(
            InfoLevel::Info,
            "Main Agent | Start",
            &format!("Starting main agent for task: {}", preview(task_description)),
        );

        let outcome = self
            .run_turn_loop(
                task_description,
                TurnLoopCtx {
                    agent_name: "main",
                    is_main: true,
                    system_prompt: &system_prompt,
                    parser: &parser,
                    toolsets: &toolsets,
                    manager: self.main_tool_manager.as_ref(),
                    blacklist: &self.main_config.tool_blacklist,
                    max_turns: self.main_config.max_turns,
                    max_tool_calls: self.main_config.max_tool_calls,
                    deadline,
                    allow_delegation: true,
                },
            )
            .await;

        let mut history = outcome.history;
        self.task_log
            .with(|t| t.main_agent_message_history = history.clone());

        if outcome.cancelled {
            self.task_log.log_step(
                InfoLevel::Warning,
                "Main Agent | Cancelled",
                "Run cancelled by host; skipping answer generation.",
            );
            self.stream.end_agent("main", &agent_id).await;
            return Ok(MainAgentOutcome {
                final_summary: "stopped".to_string(),
                boxed_answer: String::new(),
                usage_log: String::new(),
                cancelled: true,
            });
        }

        // Answer generation: one summarize call with tool calling disabled.
        history.push(Message::user(generate_agent_summarize_prompt(
            task_description,
            AgentType::Main,
        )));
        let (final_response, _) = self
            .llm_client
            .create_message(&system_prompt, &history, &[], self.keep_tool_result)
            .await;

        let final_answer_text = match &final_response {
            Some(response) => {
                let text = extract_response_text(&response.content);
                history.push(Message::assistant(response.content.clone(), Vec::new()));
                self.stream
                    .message(&Uuid::new_v4().to_string(), &text)
                    .await;
                text
            }
            None => {
                self.task_log.log_step(
                    InfoLevel::Error,
                    "Main Agent | Answer Generation Error",
                    "Final summarize call failed; no boxed answer will be produced.",
                );
                String::new()
            }
        };

        self.task_log
            .with(|t| t.main_agent_message_history = history.clone());

        let usage_summary = self.llm_client.format_token_usage_summary().await;
        let (final_summary, boxed_answer, usage_log) = self
            .formatter
            .format_final_summary_and_log(&final_answer_text, Some(usage_summary));

        self.task_log.log_step(
            InfoLevel::Info,
            "Main Agent | Final Answer",
            &format!("Extracted boxed answer: {}", boxed_answer),
        );
        self.task_log
            .log_step(InfoLevel::Info, "Main Agent | Token Usage", &usage_log);
        self.stream.end_agent("main", &agent_id).await;

        Ok(MainAgentOutcome {
            final_summary,
            boxed_answer,
            usage_log,
            cancelled: false,
        })
    }

    /// Run one delegated sub-agent session and return its summary report.
    ///
    /// Boxed to break the async recursion through the main turn loop.
    fn run_sub_agent<'a>(
        &'a self,
        sub_agent_name: &'a str,
        task_description: &'a str,
        deadline: Option<Instant>,
    ) -> Pin<Box<dyn Future<Output = String> + Send + 'a>> {
        Box::pin(async move {
            let Some(sub) = self
                .sub_agents
                .iter()
                .find(|sub| sub.config.name == sub_agent_name)
            else {
                return format!("Sub-agent '{}' is not configured.", sub_agent_name);
            };

            let session_id = self
                .task_log
                .with(|t| t.start_sub_agent_session(sub_agent_name, task_description));
            let agent_id = self.stream.start_agent(sub_agent_name, None).await;

            let toolsets = filter_blacklisted(
                sub.manager.get_all_tool_definitions().await,
                &sub.config.tool_blacklist,
            );
            let system_prompt = format!(
                "{}{}",
                generate_mcp_system_prompt(chrono::Utc::now().date_naive(), &toolsets),
                generate_agent_specific_system_prompt(AgentType::Browsing),
            );
            let parser = ResponseParser::from_system_prompt(&system_prompt);

            let outcome = self
                .run_turn_loop(
                    task_description,
                    TurnLoopCtx {
                        agent_name: sub_agent_name,
                        is_main: false,
                        system_prompt: &system_prompt,
                        parser: &parser,
                        toolsets: &toolsets,
                        manager: sub.manager.as_ref(),
                        blacklist: &sub.config.tool_blacklist,
                        max_turns: sub.config.max_turns,
                        max_tool_calls: sub.config.max_tool_calls,
                        deadline,
                        allow_delegation: false,
                    },
                )
                .await;

            let mut history = outcome.history;
            let summary = if outcome.cancelled {
                "Sub-agent session was cancelled before producing a report.".to_string()
            } else {
                history.push(Message::user(generate_agent_summarize_prompt(
                    task_description,
                    AgentType::Browsing,
                )));
                let (response, _) = self
                    .llm_client
                    .create_message(&system_prompt, &history, &[], self.keep_tool_result)
                    .await;
                match response {
                    Some(response) => {
                        let text = extract_response_text(&response.content);
                        history.push(Message::assistant(response.content, Vec::new()));
                        self.stream
                            .message(&Uuid::new_v4().to_string(), &text)
                            .await;
                        text
                    }
                    None => {
                        self.task_log.log_step(
                            InfoLevel::Error,
                            &format!("{} | Summary Error", sub_agent_name),
                            "Summarize call failed; returning empty report.",
                        );
                        String::new()
                    }
                }
            };

            self.task_log.with(|t| {
                t.sub_agent_message_history_sessions
                    .insert(session_id, history);
                t.end_sub_agent_session(sub_agent_name);
            });
            self.stream.end_agent(sub_agent_name, &agent_id).await;

            summary
        })
    }

    async fn run_turn_loop(
        &self,
        task_description: &str,
        ctx: TurnLoopCtx<'_>,
    ) -> TurnLoopOutcome {
        let mut history = vec![Message::user(task_description)];
        let mut turn: u32 = 0;
        let mut tool_calls_used: u32 = 0;
        let mut cancelled = false;
        let native = self.llm_client.uses_native_tool_calls();

        loop {
            if self.is_cancelled() {
                cancelled = true;
                self.task_log.log_step(
                    InfoLevel::Warning,
                    &format!("{} | Cancelled", agent_label(ctx.agent_name, ctx.is_main)),
                    "Cancellation requested; stopping before next turn.",
                );
                break;
            }

            turn += 1;
            self.task_log.with(|t| {
                if ctx.is_main {
                    t.current_main_turn_id = turn;
                } else {
                    t.current_sub_agent_turn_id = turn;
                }
            });

            self.stream.start_llm(ctx.agent_name).await;
            let (response, returned_history) = self
                .llm_client
                .create_message(
                    ctx.system_prompt,
                    &history,
                    ctx.toolsets,
                    self.keep_tool_result,
                )
                .await;
            history = returned_history;

            let Some(response) = response else {
                self.stream.end_llm(ctx.agent_name).await;
                // Keep the last usable assistant text in the step log so a
                // post-mortem can see how far the agent got.
                let progress = history
                    .iter()
                    .rev()
                    .find(|msg| msg.role == Role::Assistant)
                    .map(|msg| extract_progress_summary(&msg.content.as_text()))
                    .unwrap_or_default();
                self.task_log.log_step(
                    InfoLevel::Error,
                    &format!(
                        "{} | LLM Call Failed",
                        agent_label(ctx.agent_name, ctx.is_main)
                    ),
                    &format!(
                        "Model call failed on turn {}; proceeding to answer generation. Last progress: {}",
                        turn,
                        preview(&progress)
                    ),
                );
                break;
            };

            let parsed = ctx.parser.parse(&response);
            if !parsed.text.is_empty() {
                self.stream
                    .message(&Uuid::new_v4().to_string(), &parsed.text)
                    .await;
            }
            self.stream.end_llm(ctx.agent_name).await;

            if ctx.is_main {
                if let Some(marker) = REFUSAL_MARKERS
                    .iter()
                    .find(|marker| parsed.text.contains(*marker))
                {
                    self.task_log.log_step(
                        InfoLevel::Warning,
                        "Main Agent | Refusal Detected",
                        &format!("Response contains refusal marker: {:?}", marker),
                    );
                }
            }

            if parsed.tool_calls.is_empty() {
                history.push(Message::assistant(response.content.clone(), Vec::new()));
                self.task_log.log_step(
                    InfoLevel::Info,
                    &format!(
                        "{} | Terminal Turn",
                        agent_label(ctx.agent_name, ctx.is_main)
                    ),
                    &format!("Turn {} produced no tool calls; loop complete.", turn),
                );
                break;
            }

            let assistant_message =
                Message::assistant(response.content.clone(), parsed.tool_calls.clone());
            let mut result_messages = Vec::with_capacity(parsed.tool_calls.len());

            for call in &parsed.tool_calls {
                if self.is_cancelled() {
                    cancelled = true;
                    break;
                }
                tool_calls_used += 1;

                let content = if ctx.allow_delegation && self.is_sub_agent_call(call) {
                    let subtask = call
                        .arguments
                        .get("task_description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    self.stream
                        .tool_call(&call.tool_name, call.arguments.clone(), false, None)
                        .await;
                    if subtask.is_empty() {
                        format!(
                            "Tool call to {} on {} failed. Error: missing required argument 'task_description'",
                            call.tool_name, SUB_AGENT_SERVER_NAME
                        )
                    } else {
                        self.run_sub_agent(&call.tool_name, &subtask, ctx.deadline)
                            .await
                    }
                } else if is_blacklisted(ctx.blacklist, call) {
                    self.task_log.log_step(
                        InfoLevel::Warning,
                        "ToolManager | Blacklisted Tool",
                        &format!(
                            "Refusing blacklisted tool '{}' on server '{}'",
                            call.tool_name, call.server_name
                        ),
                    );
                    format!(
                        "Tool call to {} on {} failed. Error: tool is not available",
                        call.tool_name, call.server_name
                    )
                } else {
                    self.stream
                        .tool_call(&call.tool_name, call.arguments.clone(), false, None)
                        .await;
                    let result = ctx.manager.execute_tool_call(call).await;
                    self.formatter.format_tool_result_for_user(&result)
                };

                result_messages.push(make_result_message(native, call, content));
            }

            if cancelled && result_messages.len() != parsed.tool_calls.len() {
                // Incomplete turn: append nothing so the persisted history
                // stays well-formed.
                break;
            }

            history.push(assistant_message);
            history.append(&mut result_messages);

            if ctx.is_main {
                self.task_log
                    .with(|t| t.main_agent_message_history = history.clone());
            }

            if turn >= ctx.max_turns {
                self.task_log.log_step(
                    InfoLevel::Warning,
                    &format!(
                        "{} | Budget Exhausted",
                        agent_label(ctx.agent_name, ctx.is_main)
                    ),
                    &format!("Reached max_turns ({}); ending loop.", ctx.max_turns),
                );
                break;
            }
            if tool_calls_used >= ctx.max_tool_calls {
                self.task_log.log_step(
                    InfoLevel::Warning,
                    &format!(
                        "{} | Budget Exhausted",
                        agent_label(ctx.agent_name, ctx.is_main)
                    ),
                    &format!(
                        "Reached max_tool_calls ({}); ending loop.",
                        ctx.max_tool_calls
                    ),
                );
                break;
            }
            if let Some(deadline) = ctx.deadline {
                if Instant::now() >= deadline {
                    self.task_log.log_step(
                        InfoLevel::Warning,
                        &format!(
                            "{} | Budget Exhausted",
                            agent_label(ctx.agent_name, ctx.is_main)
                        ),
                        "Wall-clock budget exhausted; ending loop.",
                    );
                    break;
                }
            }
        }

        TurnLoopOutcome { history, cancelled }
    }
}

fn agent_label(agent_name: &str, is_main: bool) -> String {
    if is_main {
        "Main Agent".to_string()
    } else {
        agent_name.to_string()
    }
}

fn preview(text: &str) -> String {
    let short: String = text.chars().take(120).collect();
    if text.chars().count() > 120 {
        format!("{}...", short)
    } else {
        short
    }
}

/// Bridge a tool result into the dialect-appropriate history message.
fn make_result_message(native: bool, call: &ToolCall, content: String) -> Message {
    match (&call.id, native) {
        (Some(id), true) => Message::tool(id.clone(), call.tool_name.clone(), content),
        _ => Message::user(content),
    }
}

/// Drop blacklisted `(server_name, tool_name)` pairs from the toolsets.
fn filter_blacklisted(
    toolsets: Vec<ServerToolset>,
    blacklist: &[(String, String)],
) -> Vec<ServerToolset> {
    if blacklist.is_empty() {
        return toolsets;
    }
    toolsets
        .into_iter()
        .map(|mut toolset| {
            toolset.tools.retain(|listing| match listing {
                ToolListing::Loaded { name, .. } => !blacklist
                    .iter()
                    .any(|(server, tool)| *server == toolset.name && tool == name),
                ToolListing::Failed { .. } => true,
            });
            toolset
        })
        .collect()
}

fn is_blacklisted(blacklist: &[(String, String)], call: &ToolCall) -> bool {
    blacklist
        .iter()
        .any(|(server, tool)| *server == call.server_name && *tool == call.tool_name)
}
