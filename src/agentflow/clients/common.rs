//! Shared utilities for provider client implementations.
//!
//! Provides the tuned process-wide [`reqwest`] client, the tool-result
//! retention pass applied before every send, and the OpenAI-format wire
//! serialization helpers used by OpenAI-compatible endpoints.

use std::collections::HashSet;
use std::time::Duration;

use lazy_static::lazy_static;
use serde_json::Value;

use crate::agentflow::client_wrapper::{Message, Role, ServerToolset};
use crate::agentflow::task_log::{InfoLevel, TaskLogHandle};

/// Hard wall-clock ceiling for one model call.
pub const LLM_CALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Sentinel written over retired tool results by the retention pass.
pub const TOOL_RESULT_OMITTED: &str = "Tool result is omitted to save tokens.";

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// A single instance keeps TLS sessions and DNS lookups warm across
    /// providers. No global request timeout is set: per-call deadlines are
    /// enforced by the clients themselves.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Apply the tool-result retention policy to a history before sending.
///
/// Tool results are the `tool` messages and every `user` message other
/// than the first (the initial task). With `keep_tool_result >= 0`, all but
/// the last `keep_tool_result` of them have their content replaced by
/// [`TOOL_RESULT_OMITTED`]; the message structure (role, ids, text/blocks
/// shape) is preserved. `-1` disables the pass entirely.
pub fn remove_tool_result_from_messages(
    messages: &[Message],
    keep_tool_result: i64,
    task_log: &TaskLogHandle,
) -> Vec<Message> {
    let mut messages: Vec<Message> = messages.to_vec();

    if keep_tool_result == -1 {
        return messages;
    }

    let carrier_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, msg)| msg.is_tool_result_carrier())
        .map(|(index, _)| index)
        .collect();

    if carrier_indices.is_empty() {
        task_log.log_step(
            InfoLevel::Info,
            "LLM | Message Retention",
            "No user/tool messages found in the history.",
        );
        return messages;
    }

    if carrier_indices.len() == 1 {
        task_log.log_step(
            InfoLevel::Info,
            "LLM | Message Retention",
            "Only 1 user message found (initial task). Keeping it as is.",
        );
        return messages;
    }

    // The first user message is the initial task, never a tool result.
    let first_user_idx = carrier_indices[0];
    let tool_result_indices = &carrier_indices[1..];

    let num_to_keep = if keep_tool_result == 0 {
        0
    } else {
        (keep_tool_result as usize).min(tool_result_indices.len())
    };
    let kept: HashSet<usize> = tool_result_indices[tool_result_indices.len() - num_to_keep..]
        .iter()
        .copied()
        .collect();

    task_log.log_step(
        InfoLevel::Info,
        "LLM | Message Retention",
        &format!(
            "Message retention summary: Total user/tool messages: {}, Initial task at index: {}, Keeping last {} tool results, Total messages to keep: {}",
            carrier_indices.len(),
            first_user_idx,
            num_to_keep,
            num_to_keep + 1,
        ),
    );

    for (index, msg) in messages.iter_mut().enumerate() {
        if msg.is_tool_result_carrier() && index != first_user_idx && !kept.contains(&index) {
            msg.content.replace_with(TOOL_RESULT_OMITTED);
        }
    }

    messages
}

/// Serialize a history to the OpenAI chat wire format, prepending the
/// system prompt.
///
/// | [`Role`] | Wire representation |
/// |---|---|
/// | `System` | `{"role":"system","content":"..."}` |
/// | `User` | `{"role":"user","content":"..."}` |
/// | `Assistant` with tool_calls | `{"role":"assistant","content":null,"tool_calls":[...]}` |
/// | `Assistant` without tool_calls | `{"role":"assistant","content":"..."}` |
/// | `Tool` | `{"role":"tool","tool_call_id":"<id>","content":"..."}` |
pub fn openai_wire_messages(system_prompt: &str, messages: &[Message]) -> Vec<Value> {
    let mut wire = vec![serde_json::json!({
        "role": "system",
        "content": system_prompt,
    })];

    for msg in messages {
        let content = msg.content.as_text();
        let value = match msg.role {
            Role::System => serde_json::json!({
                "role": "system",
                "content": content,
            }),
            Role::User => serde_json::json!({
                "role": "user",
                "content": content,
            }),
            Role::Assistant => {
                if msg.tool_calls.is_empty() {
                    serde_json::json!({
                        "role": "assistant",
                        "content": content,
                    })
                } else {
                    let tool_calls: Vec<Value> = msg
                        .tool_calls
                        .iter()
                        .map(|call| {
                            serde_json::json!({
                                "id": call.id.clone().unwrap_or_default(),
                                "type": "function",
                                "function": {
                                    "name": format!("{}-{}", call.server_name, call.tool_name),
                                    "arguments": serde_json::to_string(&call.arguments)
                                        .unwrap_or_else(|_| "{}".to_string()),
                                },
                            })
                        })
                        .collect();
                    serde_json::json!({
                        "role": "assistant",
                        "content": if content.is_empty() { Value::Null } else { Value::String(content) },
                        "tool_calls": tool_calls,
                    })
                }
            }
            Role::Tool => serde_json::json!({
                "role": "tool",
                "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
                "content": content,
            }),
        };
        wire.push(value);
    }

    wire
}

/// Build the native `tools` array from the aggregated toolsets. Function
/// names are joined as `"{server_name}-{tool_name}"`; the parser splits
/// them back on the last dash.
pub fn native_tools_from_toolsets(toolsets: &[ServerToolset]) -> Vec<Value> {
    let mut tools = Vec::new();
    for server in toolsets {
        for (name, description, schema) in server.loaded_tools() {
            tools.push(serde_json::json!({
                "type": "function",
                "function": {
                    "name": format!("{}-{}", server.name, name),
                    "description": description,
                    "parameters": schema,
                },
            }));
        }
    }
    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentflow::client_wrapper::ToolCall;
    use crate::agentflow::task_log::TaskLog;

    fn handle() -> TaskLogHandle {
        TaskLogHandle::new(TaskLog::new("t", Value::Null, "logs"))
    }

    fn history_with_tool_results(count: usize) -> Vec<Message> {
        let mut history = vec![Message::user("initial task")];
        for i in 0..count {
            history.push(Message::assistant(
                format!("turn {}", i),
                vec![ToolCall {
                    id: None,
                    server_name: "s".to_string(),
                    tool_name: "t".to_string(),
                    arguments: Value::Null,
                }],
            ));
            history.push(Message::user(format!("tool result {}", i)));
        }
        history
    }

    fn non_sentinel_results(messages: &[Message]) -> usize {
        messages
            .iter()
            .skip(1)
            .filter(|m| m.is_tool_result_carrier() && m.content.as_text() != TOOL_RESULT_OMITTED)
            .count()
    }

    #[test]
    fn retention_disabled_keeps_everything() {
        let history = history_with_tool_results(3);
        let retained = remove_tool_result_from_messages(&history, -1, &handle());
        assert_eq!(non_sentinel_results(&retained), 3);
    }

    #[test]
    fn retention_zero_keeps_only_initial_task() {
        let history = history_with_tool_results(3);
        let retained = remove_tool_result_from_messages(&history, 0, &handle());
        assert_eq!(non_sentinel_results(&retained), 0);
        assert_eq!(retained[0].content.as_text(), "initial task");
    }

    #[test]
    fn retention_keeps_last_k_results() {
        let history = history_with_tool_results(5);
        let retained = remove_tool_result_from_messages(&history, 2, &handle());
        assert_eq!(non_sentinel_results(&retained), 2);
        // The survivors are the most recent two.
        assert_eq!(
            retained.last().unwrap().content.as_text(),
            "tool result 4"
        );
        assert_eq!(
            retained[retained.len() - 3].content.as_text(),
            "tool result 3"
        );
    }

    #[test]
    fn retention_never_rewrites_the_initial_task() {
        for k in [0, 1, 3, 100] {
            let history = history_with_tool_results(3);
            let retained = remove_tool_result_from_messages(&history, k, &handle());
            assert_eq!(retained[0].content.as_text(), "initial task");
        }
    }

    #[test]
    fn retention_k_larger_than_results_keeps_all() {
        let history = history_with_tool_results(2);
        let retained = remove_tool_result_from_messages(&history, 10, &handle());
        assert_eq!(non_sentinel_results(&retained), 2);
    }

    #[test]
    fn wire_format_round_trips_assistant_tool_calls() {
        let messages = vec![
            Message::user("question"),
            Message::assistant(
                "",
                vec![ToolCall {
                    id: Some("call_1".to_string()),
                    server_name: "tool-python".to_string(),
                    tool_name: "run_python_code".to_string(),
                    arguments: serde_json::json!({"code": "print(1)"}),
                }],
            ),
            Message::tool("call_1", "run_python_code", "1"),
        ];
        let wire = openai_wire_messages("system", &messages);
        assert_eq!(wire.len(), 4);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[2]["role"], "assistant");
        assert!(wire[2]["content"].is_null());
        assert_eq!(
            wire[2]["tool_calls"][0]["function"]["name"],
            "tool-python-run_python_code"
        );
        assert_eq!(wire[3]["role"], "tool");
        assert_eq!(wire[3]["tool_call_id"], "call_1");
    }

    #[test]
    fn native_tools_join_server_and_tool_names() {
        use crate::agentflow::client_wrapper::ToolListing;
        let toolsets = vec![ServerToolset {
            name: "tool-python".to_string(),
            tools: vec![
                ToolListing::Loaded {
                    name: "run_python_code".to_string(),
                    description: "Run code".to_string(),
                    schema: serde_json::json!({"type": "object"}),
                },
                ToolListing::Failed {
                    error: "nope".to_string(),
                },
            ],
        }];
        let tools = native_tools_from_toolsets(&toolsets);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["function"]["name"], "tool-python-run_python_code");
    }
}
