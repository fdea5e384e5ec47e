use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use agentflow::agentflow::client_wrapper::{
    LLMClient, LlmResponse, Message, NativeToolCall, Role, ServerToolset, TokenUsage,
};
use agentflow::agentflow::orchestrator::Orchestrator;
use agentflow::agentflow::stream::{StreamEvent, StreamHandler, StreamItem};
use agentflow::agentflow::task_log::{TaskLog, TaskLogHandle};
use agentflow::agentflow::tool_manager::ToolManager;
use agentflow::{MainAgentConfig, SubAgentConfig};
use mcp::{ServerConfig, StdioServerParams};

/// Scripted LLM client: returns queued responses in order, then `None`.
#[derive(Debug)]
struct MockClient {
    responses: std::sync::Mutex<VecDeque<LlmResponse>>,
    calls: AtomicUsize,
    native: bool,
}

impl MockClient {
    fn new(responses: Vec<LlmResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: std::sync::Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
            native: false,
        })
    }

    fn new_native(responses: Vec<LlmResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: std::sync::Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
            native: true,
        })
    }

    fn calls_made(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn text_response(content: &str) -> LlmResponse {
    LlmResponse {
        content: content.to_string(),
        native_tool_calls: Vec::new(),
    }
}

fn framed_call(prefix: &str, server: &str, tool: &str, arguments: &str) -> LlmResponse {
    text_response(&format!(
        "{}\n\n<use_mcp_tool>\n<server_name>{}</server_name>\n<tool_name>{}</tool_name>\n<arguments>\n{}\n</arguments>\n</use_mcp_tool>",
        prefix, server, tool, arguments
    ))
}

#[async_trait]
impl LLMClient for MockClient {
    async fn create_message(
        &self,
        _system_prompt: &str,
        message_history: &[Message],
        _tool_definitions: &[ServerToolset],
        _keep_tool_result: i64,
    ) -> (Option<LlmResponse>, Vec<Message>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = self.responses.lock().unwrap().pop_front();
        (response, message_history.to_vec())
    }

    fn provider(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    fn uses_native_tool_calls(&self) -> bool {
        self.native
    }

    async fn usage(&self) -> TokenUsage {
        TokenUsage::default()
    }
}

/// Fake stdio MCP server: answers `initialize`, `tools/list`, and
/// `tools/call` with canned newline-delimited JSON-RPC frames. Request ids
/// are always 1 (initialize) then 2 within one session, which matches the
/// client's per-session id allocation.
const PYTHON_SERVER_SCRIPT: &str = r#"while IFS= read -r line; do
  case "$line" in
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"run_python_code","description":"Run Python code in a sandbox.","inputSchema":{"type":"object","properties":{"code":{"type":"string"}},"required":["code"]}}]}}\n';;
    *'"tools/call"'*) printf '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"4"}]}}\n';;
    *'"initialize"'*) printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0.0.1"}}}\n';;
  esac
done"#;

const SEARCH_SERVER_SCRIPT: &str = r#"while IFS= read -r line; do
  case "$line" in
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"google_search","description":"Search the web.","inputSchema":{"type":"object","properties":{"q":{"type":"string"}},"required":["q"]}}]}}\n';;
    *'"tools/call"'*) printf '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"The current president of X is Y."}]}}\n';;
    *'"initialize"'*) printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0.0.1"}}}\n';;
  esac
done"#;

fn stdio_server(name: &str, script: &str) -> ServerConfig {
    ServerConfig::Stdio {
        name: name.to_string(),
        params: StdioServerParams {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: Default::default(),
        },
    }
}

fn task_log_handle() -> TaskLogHandle {
    let _ = env_logger::builder().is_test(true).try_init();
    TaskLogHandle::new(TaskLog::new("test-task", Value::Null, "target/test-logs"))
}

fn main_config(max_turns: u32) -> MainAgentConfig {
    serde_json::from_value(serde_json::json!({
        "tools": [],
        "max_turns": max_turns,
        "max_tool_calls": 40,
    }))
    .unwrap()
}

async fn drain_events(rx: &mut mpsc::Receiver<StreamItem>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(item) = rx.recv().await {
        match item {
            Some(event) => events.push(event),
            None => break,
        }
    }
    events
}

/// Every assistant message with tool calls must be followed by exactly one
/// result message per call before the next assistant message.
fn assert_history_well_formed(history: &[Message]) {
    let mut index = 0;
    while index < history.len() {
        let msg = &history[index];
        if msg.role == Role::Assistant && !msg.tool_calls.is_empty() {
            let expected = msg.tool_calls.len();
            for offset in 1..=expected {
                let result = history
                    .get(index + offset)
                    .unwrap_or_else(|| panic!("missing tool result at {}", index + offset));
                assert!(
                    matches!(result.role, Role::User | Role::Tool),
                    "expected tool result after assistant tool calls, got {:?}",
                    result.role
                );
            }
            index += expected + 1;
        } else {
            index += 1;
        }
    }
}

// --- S1: no tools, one turn, boxed answer -------------------------------

#[tokio::test]
async fn s1_no_tools_single_turn() {
    let client = MockClient::new(vec![
        text_response("Hi! \\boxed{hi}"),
        text_response("Hi! \\boxed{hi}"),
    ]);
    let (tx, mut rx) = mpsc::channel(256);
    let task_log = task_log_handle();
    let manager = Arc::new(ToolManager::new(Vec::new(), task_log.clone()));
    let orchestrator = Orchestrator::new(
        client.clone(),
        manager,
        main_config(5),
        -1,
        task_log.clone(),
        StreamHandler::new(tx),
    );

    let outcome = orchestrator.run_main_agent("Say hi").await.unwrap();
    assert_eq!(outcome.boxed_answer, "hi");
    assert!(!outcome.cancelled);
    // One loop turn plus the answer-generation call.
    assert_eq!(client.calls_made(), 2);

    let history = task_log.with(|t| t.main_agent_message_history.clone());
    assert_history_well_formed(&history);
    assert_eq!(history[0].content.as_text(), "Say hi");

    drop(orchestrator);
    let events = drain_events(&mut rx).await;
    let llm_starts = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::StartOfLlm { .. }))
        .count();
    let llm_ends = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::EndOfLlm { .. }))
        .count();
    assert_eq!(llm_starts, 1);
    assert_eq!(llm_ends, 1);

    // start_of_agent precedes the llm pair which precedes end_of_agent.
    let agent_start = events
        .iter()
        .position(|e| matches!(e, StreamEvent::StartOfAgent { .. }))
        .unwrap();
    let llm_start = events
        .iter()
        .position(|e| matches!(e, StreamEvent::StartOfLlm { .. }))
        .unwrap();
    let agent_end = events
        .iter()
        .position(|e| matches!(e, StreamEvent::EndOfAgent { .. }))
        .unwrap();
    assert!(agent_start < llm_start && llm_start < agent_end);
}

// --- S2: one framed tool call through a real stdio server ---------------

#[tokio::test]
async fn s2_framed_tool_call_round_trip() {
    let client = MockClient::new(vec![
        framed_call(
            "Let me compute that.",
            "tool-python",
            "run_python_code",
            r#"{"code": "print(2+2)"}"#,
        ),
        text_response("The result is 4."),
        text_response("\\boxed{4}"),
    ]);
    let (tx, mut rx) = mpsc::channel(256);
    let task_log = task_log_handle();
    let manager = Arc::new(ToolManager::new(
        vec![stdio_server("tool-python", PYTHON_SERVER_SCRIPT)],
        task_log.clone(),
    ));
    let orchestrator = Orchestrator::new(
        client.clone(),
        manager,
        main_config(5),
        -1,
        task_log.clone(),
        StreamHandler::new(tx),
    );

    let outcome = orchestrator
        .run_main_agent("What is 2+2 in Python?")
        .await
        .unwrap();
    assert_eq!(outcome.boxed_answer, "4");
    assert_eq!(client.calls_made(), 3);

    let history = task_log.with(|t| t.main_agent_message_history.clone());
    assert_history_well_formed(&history);
    // user task, assistant(call), user "4", assistant terminal, user
    // summarize, assistant final.
    assert_eq!(history.len(), 6);
    assert_eq!(history[2].role, Role::User);
    assert_eq!(history[2].content.as_text(), "4");

    drop(orchestrator);
    let events = drain_events(&mut rx).await;

    // Per-turn ordering: start_of_llm -> end_of_llm -> tool_call -> next
    // start_of_llm; tool_call ids unique.
    let mut tool_call_ids = Vec::new();
    for event in &events {
        if let StreamEvent::ToolCall { tool_call_id, .. } = event {
            tool_call_ids.push(tool_call_id.clone());
        }
    }
    assert_eq!(tool_call_ids.len(), 1);
    let llm_end = events
        .iter()
        .position(|e| matches!(e, StreamEvent::EndOfLlm { .. }))
        .unwrap();
    let tool_call = events
        .iter()
        .position(|e| matches!(e, StreamEvent::ToolCall { .. }))
        .unwrap();
    let second_llm_start = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, StreamEvent::StartOfLlm { .. }))
        .map(|(i, _)| i)
        .nth(1)
        .unwrap();
    assert!(llm_end < tool_call && tool_call < second_llm_start);
}

// --- S3: name correction repairs a misnamed call ------------------------

#[tokio::test]
async fn s3_name_correction_repairs_misnamed_call() {
    let client = MockClient::new(vec![
        framed_call(
            "Running the code.",
            "wrong",
            "python",
            r#"{"code": "print(2+2)"}"#,
        ),
        text_response("The result is 4."),
        text_response("\\boxed{4}"),
    ]);
    let task_log = task_log_handle();
    let manager = Arc::new(ToolManager::new(
        vec![stdio_server("tool-python", PYTHON_SERVER_SCRIPT)],
        task_log.clone(),
    ));
    let orchestrator = Orchestrator::new(
        client,
        manager,
        main_config(5),
        -1,
        task_log.clone(),
        StreamHandler::disabled(),
    );

    let outcome = orchestrator
        .run_main_agent("What is 2+2 in Python?")
        .await
        .unwrap();
    assert_eq!(outcome.boxed_answer, "4");

    // The corrected call is what lands in history.
    let history = task_log.with(|t| t.main_agent_message_history.clone());
    let call = &history[1].tool_calls[0];
    assert_eq!(call.server_name, "tool-python");
    assert_eq!(call.tool_name, "run_python_code");
    // And the dispatch actually succeeded: the result message carries "4".
    assert_eq!(history[2].content.as_text(), "4");
}

// --- S4: sub-agent delegation -------------------------------------------

#[tokio::test]
async fn s4_sub_agent_delegation() {
    let client = MockClient::new(vec![
        // Main turn 1: delegate.
        framed_call(
            "I need to look that up.",
            "agent-worker",
            "agent-browsing",
            r#"{"task_description": "find current president of X"}"#,
        ),
        // Sub turn 1: search.
        framed_call(
            "Searching.",
            "tool-google-search",
            "google_search",
            r#"{"q": "current president of X"}"#,
        ),
        // Sub turn 2: terminal.
        text_response("I found that the president is Y."),
        // Sub summarize: structured report.
        text_response("# Findings\nThe current president of X is Y."),
        // Main turn 2: terminal.
        text_response("Based on the report, the president is Y."),
        // Main answer generation.
        text_response("\\boxed{Y}"),
    ]);
    let task_log = task_log_handle();
    let main_manager = Arc::new(ToolManager::new(Vec::new(), task_log.clone()));
    let sub_manager = Arc::new(ToolManager::new(
        vec![stdio_server("tool-google-search", SEARCH_SERVER_SCRIPT)],
        task_log.clone(),
    ));
    let sub_config: SubAgentConfig = serde_json::from_value(serde_json::json!({
        "name": "agent-browsing",
        "max_turns": 5,
        "max_tool_calls": 10,
    }))
    .unwrap();

    let orchestrator = Orchestrator::new(
        client.clone(),
        main_manager,
        main_config(5),
        -1,
        task_log.clone(),
        StreamHandler::disabled(),
    )
    .with_sub_agent(sub_config, sub_manager);

    let outcome = orchestrator
        .run_main_agent("Who is the current president of X?")
        .await
        .unwrap();
    assert_eq!(outcome.boxed_answer, "Y");
    assert_eq!(client.calls_made(), 6);

    // The sub-agent session is recorded with two loop turns plus the
    // summarize exchange.
    let sessions = task_log.with(|t| t.sub_agent_message_history_sessions.clone());
    assert_eq!(sessions.len(), 1);
    let session = sessions.get("agent-browsing_1").unwrap();
    assert_history_well_formed(session);
    assert_eq!(session[0].content.as_text(), "find current president of X");
    let search_result = session[2].content.as_text();
    assert!(search_result.contains("The current president of X is Y."));

    // The main agent received the sub-agent's report as a tool result.
    let history = task_log.with(|t| t.main_agent_message_history.clone());
    assert_history_well_formed(&history);
    assert!(history[2].content.as_text().contains("# Findings"));
}

// --- S5: tool failure does not terminate the run ------------------------

#[tokio::test]
async fn s5_tool_failure_is_conversation_data() {
    let client = MockClient::new(vec![
        framed_call("Trying a tool.", "tool-missing", "foo", r#"{"x": 1}"#),
        text_response("That tool is unavailable; answering directly."),
        text_response("\\boxed{none}"),
    ]);
    let task_log = task_log_handle();
    let manager = Arc::new(ToolManager::new(Vec::new(), task_log.clone()));
    let orchestrator = Orchestrator::new(
        client.clone(),
        manager,
        main_config(5),
        -1,
        task_log.clone(),
        StreamHandler::disabled(),
    );

    let outcome = orchestrator.run_main_agent("Use a broken tool").await.unwrap();
    assert_eq!(outcome.boxed_answer, "none");
    // Turn 1 (failed tool), turn 2 (terminal), answer generation.
    assert_eq!(client.calls_made(), 3);

    let history = task_log.with(|t| t.main_agent_message_history.clone());
    assert_history_well_formed(&history);
    let failure = history[2].content.as_text();
    assert!(
        failure.contains("Tool call to foo on tool-missing failed. Error:"),
        "unexpected failure message: {}",
        failure
    );
    assert!(failure.contains("Server 'tool-missing' not found."));
}

// --- S6: budget exhaustion still produces an answer ---------------------

#[tokio::test]
async fn s6_max_turns_budget_enforced() {
    let looping_call = || {
        framed_call(
            "Still working.",
            "tool-missing",
            "foo",
            r#"{"x": 1}"#,
        )
    };
    let client = MockClient::new(vec![
        looping_call(),
        looping_call(),
        looping_call(),
        // This one must never be consumed by the loop; it is the answer
        // generation response.
        text_response("I ran out of budget. \\boxed{incomplete}"),
    ]);
    let task_log = task_log_handle();
    let manager = Arc::new(ToolManager::new(Vec::new(), task_log.clone()));
    let orchestrator = Orchestrator::new(
        client.clone(),
        manager,
        main_config(3),
        -1,
        task_log.clone(),
        StreamHandler::disabled(),
    );

    let outcome = orchestrator.run_main_agent("Loop forever").await.unwrap();
    // At most max_turns model calls in the loop, plus the final call.
    assert_eq!(client.calls_made(), 4);
    assert_eq!(outcome.boxed_answer, "incomplete");

    let steps = task_log.with(|t| {
        t.step_logs
            .iter()
            .filter(|s| s.step_name.contains("Budget Exhausted"))
            .count()
    });
    assert!(steps >= 1);
}

// --- Model failure mid-run proceeds to answer generation ----------------

#[tokio::test]
async fn model_failure_is_terminal_but_answer_generation_runs() {
    // Only one scripted response: the second loop call returns None, then
    // the answer-generation call also returns None.
    let client = MockClient::new(vec![framed_call(
        "Trying.",
        "tool-missing",
        "foo",
        r#"{"x": 1}"#,
    )]);
    let task_log = task_log_handle();
    let manager = Arc::new(ToolManager::new(Vec::new(), task_log.clone()));
    let orchestrator = Orchestrator::new(
        client.clone(),
        manager,
        main_config(5),
        -1,
        task_log.clone(),
        StreamHandler::disabled(),
    );

    let outcome = orchestrator.run_main_agent("Fragile model").await.unwrap();
    assert_eq!(outcome.boxed_answer, "");
    assert!(!outcome.cancelled);
    // Turn 1, failed turn 2, failed answer generation.
    assert_eq!(client.calls_made(), 3);

    let history = task_log.with(|t| t.main_agent_message_history.clone());
    assert_history_well_formed(&history);
}

// --- Native dialect: id correspondence ----------------------------------

#[tokio::test]
async fn native_tool_call_ids_round_trip() {
    let client = MockClient::new_native(vec![
        LlmResponse {
            content: String::new(),
            native_tool_calls: vec![NativeToolCall {
                id: "call_abc".to_string(),
                name: "tool-python-run_python_code".to_string(),
                arguments: r#"{"code": "print(2+2)"}"#.to_string(),
            }],
        },
        text_response("The result is 4."),
        text_response("\\boxed{4}"),
    ]);
    let task_log = task_log_handle();
    let manager = Arc::new(ToolManager::new(
        vec![stdio_server("tool-python", PYTHON_SERVER_SCRIPT)],
        task_log.clone(),
    ));
    let orchestrator = Orchestrator::new(
        client,
        manager,
        main_config(5),
        -1,
        task_log.clone(),
        StreamHandler::disabled(),
    );

    let outcome = orchestrator.run_main_agent("2+2?").await.unwrap();
    assert_eq!(outcome.boxed_answer, "4");

    let history = task_log.with(|t| t.main_agent_message_history.clone());
    assert_history_well_formed(&history);
    let assistant = &history[1];
    assert_eq!(assistant.tool_calls[0].id.as_deref(), Some("call_abc"));
    let result = &history[2];
    assert_eq!(result.role, Role::Tool);
    assert_eq!(result.tool_call_id.as_deref(), Some("call_abc"));
    assert_eq!(result.content.as_text(), "4");
}

// --- Cancellation stops the loop and skips answer generation ------------

#[tokio::test]
async fn cancellation_skips_remaining_turns() {
    let client = MockClient::new(vec![
        framed_call("Working.", "tool-missing", "foo", r#"{"x": 1}"#),
        framed_call("Working more.", "tool-missing", "foo", r#"{"x": 2}"#),
    ]);
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let task_log = task_log_handle();
    let manager = Arc::new(ToolManager::new(Vec::new(), task_log.clone()));
    let orchestrator = Orchestrator::new(
        client.clone(),
        manager,
        main_config(10),
        -1,
        task_log.clone(),
        StreamHandler::disabled(),
    )
    .with_cancellation(cancel_rx);

    // Cancel before the run starts: the loop must not make any model call.
    cancel_tx.send(true).unwrap();
    let outcome = orchestrator.run_main_agent("Never mind").await.unwrap();
    assert!(outcome.cancelled);
    assert_eq!(outcome.final_summary, "stopped");
    assert_eq!(client.calls_made(), 0);
}

// --- Multiple tool calls in one turn execute in emitted order -----------

#[tokio::test]
async fn multiple_tool_calls_preserve_order() {
    let two_calls = text_response(
        "Two at once.\n\n\
         <use_mcp_tool><server_name>a</server_name><tool_name>first</tool_name><arguments>{\"n\": 1}</arguments></use_mcp_tool>\n\
         <use_mcp_tool><server_name>b</server_name><tool_name>second</tool_name><arguments>{\"n\": 2}</arguments></use_mcp_tool>",
    );
    let client = MockClient::new(vec![
        two_calls,
        text_response("Done."),
        text_response("\\boxed{done}"),
    ]);
    let task_log = task_log_handle();
    let manager = Arc::new(ToolManager::new(Vec::new(), task_log.clone()));
    let orchestrator = Orchestrator::new(
        client,
        manager,
        main_config(5),
        -1,
        task_log.clone(),
        StreamHandler::disabled(),
    );

    orchestrator.run_main_agent("Do two things").await.unwrap();

    let history = task_log.with(|t| t.main_agent_message_history.clone());
    assert_history_well_formed(&history);
    assert_eq!(history[1].tool_calls.len(), 2);
    // Result messages appear in emitted order.
    assert!(history[2].content.as_text().contains("first"));
    assert!(history[3].content.as_text().contains("second"));
}
