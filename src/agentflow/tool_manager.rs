//! Tool manager: multiplexes a set of named tool servers.
//!
//! Routes invocations by `(server_name, tool_name)` and aggregates tool
//! schemas across servers for prompt generation. Tool failures of every
//! kind — unknown server, transport trouble, execution errors, malformed
//! arguments — are returned as error-carrying [`ToolCallResult`]s, never
//! raised: a failed tool call is expected conversation data.

use serde_json::Value;

use mcp::{McpError, ServerConfig, ToolServerClient};

use crate::agentflow::client_wrapper::{ServerToolset, ToolCall, ToolCallResult, ToolListing};
use crate::agentflow::task_log::{utc_plus_8_now, InfoLevel, TaskLogHandle, ToolCallLog};

/// Owns one [`ToolServerClient`] per configured server, in configuration
/// order (which fixes the server order in the system prompt).
pub struct ToolManager {
    servers: Vec<ToolServerClient>,
    task_log: TaskLogHandle,
}

impl ToolManager {
    pub fn new(configs: Vec<ServerConfig>, task_log: TaskLogHandle) -> Self {
        Self {
            servers: configs.into_iter().map(ToolServerClient::new).collect(),
            task_log,
        }
    }

    fn find_server(&self, server_name: &str) -> Option<&ToolServerClient> {
        self.servers
            .iter()
            .find(|client| client.server_name() == server_name)
    }

    /// Connect to every configured server and collect its tool schemas.
    ///
    /// A server that cannot be reached or refuses to list is reported as a
    /// single error entry so the prompt can still surface the others.
    pub async fn get_all_tool_definitions(&self) -> Vec<ServerToolset> {
        let mut toolsets = Vec::with_capacity(self.servers.len());

        for client in &self.servers {
            let name = client.server_name().to_string();
            self.task_log.log_step(
                InfoLevel::Info,
                "ToolManager | Get Tool Definitions",
                &format!("Getting tool definitions for server '{}'...", name),
            );

            let tools = match client.list_tools().await {
                Ok(tools) => tools
                    .into_iter()
                    .map(|tool| ToolListing::Loaded {
                        name: tool.name,
                        description: tool.description.unwrap_or_default(),
                        schema: tool.input_schema,
                    })
                    .collect(),
                Err(error) => {
                    self.task_log.log_step(
                        InfoLevel::Error,
                        "ToolManager | List Tools Error",
                        &format!(
                            "Unable to connect or get tools from server '{}': {}",
                            name, error
                        ),
                    );
                    vec![ToolListing::Failed {
                        error: format!("Unable to fetch tools: {}", error),
                    }]
                }
            };

            toolsets.push(ServerToolset { name, tools });
        }

        toolsets
    }

    /// Execute one tool call, returning a result that carries either the
    /// tool's text output or an error description.
    pub async fn execute_tool_call(&self, call: &ToolCall) -> ToolCallResult {
        // Arguments the parser could not repair are bounced straight back
        // as a tool error so the model sees its own malformed output.
        if let Some(parse_error) = argument_parse_error(&call.arguments) {
            self.task_log.log_step(
                InfoLevel::Error,
                "ToolManager | Tool Call Error",
                &format!(
                    "Rejecting call to '{}' on '{}': {}",
                    call.tool_name, call.server_name, parse_error
                ),
            );
            return self.finish(call, Err(parse_error));
        }

        let Some(client) = self.find_server(&call.server_name) else {
            self.task_log.log_step(
                InfoLevel::Error,
                "ToolManager | Server Not Found",
                &format!("Attempting to call server '{}' not found", call.server_name),
            );
            return self.finish(call, Err(format!("Server '{}' not found.", call.server_name)));
        };

        self.task_log.log_step(
            InfoLevel::Info,
            "ToolManager | Tool Call Start",
            &format!(
                "Connecting to server '{}' to call tool '{}'",
                call.server_name, call.tool_name
            ),
        );

        let outcome = match client
            .call_tool(&call.tool_name, call.arguments.clone())
            .await
        {
            Ok(result) => {
                self.task_log.log_step(
                    InfoLevel::Info,
                    "ToolManager | Tool Call Success",
                    &format!(
                        "Tool '{}' on server '{}' returned {} chars",
                        call.tool_name,
                        call.server_name,
                        result.chars().count()
                    ),
                );
                Ok(result)
            }
            Err(McpError::Execution(message)) => {
                self.task_log.log_step(
                    InfoLevel::Error,
                    "ToolManager | Tool Execution Error",
                    &format!("Tool execution error: {}", message),
                );
                Err(format!("Tool execution failed: {}", message))
            }
            Err(error) => {
                self.task_log.log_step(
                    InfoLevel::Error,
                    "ToolManager | MCP Session Error",
                    &format!("MCP session error: {}", error),
                );
                Err(format!("MCP session error: {}", error))
            }
        };

        self.finish(call, outcome)
    }

    fn finish(&self, call: &ToolCall, outcome: Result<String, String>) -> ToolCallResult {
        let record = ToolCallLog {
            server_name: call.server_name.clone(),
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
            result: outcome.as_ref().ok().cloned(),
            error: outcome.as_ref().err().cloned(),
            call_time: Some(utc_plus_8_now()),
        };
        self.task_log.with(|t| t.record_tool_call(record));

        match outcome {
            Ok(result) => ToolCallResult::ok(&call.server_name, &call.tool_name, result),
            Err(error) => ToolCallResult::err(&call.server_name, &call.tool_name, error),
        }
    }
}

/// Detect the `{error, raw}` object the parser emits when argument repair
/// failed.
fn argument_parse_error(arguments: &Value) -> Option<String> {
    let error = arguments.get("error")?.as_str()?;
    let raw = arguments.get("raw")?.as_str()?;
    Some(format!("{}. Raw arguments: {}", error, raw))
}
