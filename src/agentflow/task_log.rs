//! Structured task logging.
//!
//! A [`TaskLog`] is the replayable record of one task execution: the full
//! main-agent history, every sub-agent session history, a step log of every
//! significant decision, and trace records for LLM and tool calls. It is
//! created at pipeline start, mutated by every component through a shared
//! [`TaskLogHandle`], and serialized to disk exactly once at pipeline end.
//!
//! Step records are mirrored to the [`log`] facade as they are appended, so
//! live console output and the persisted artifact always agree.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agentflow::client_wrapper::Message;

/// Severity of a step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfoLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One recorded execution step — the primary post-mortem artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLog {
    pub step_name: String,
    pub message: String,
    pub timestamp: String,
    pub info_level: InfoLevel,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Technical details of one LLM call, kept under `trace_data.llm_calls`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallLog {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Details of one tool call, kept under `trace_data.tool_calls`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallLog {
    pub server_name: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_time: Option<String>,
}

/// The root task record. See the module docs for the lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub status: String,
    pub start_time: String,
    pub end_time: String,

    pub task_id: String,
    pub input: Value,
    #[serde(default)]
    pub ground_truth: String,
    #[serde(default)]
    pub final_boxed_answer: String,
    #[serde(default)]
    pub error: String,

    // Turn bookkeeping, updated by the orchestrator as it loops.
    #[serde(default)]
    pub current_main_turn_id: u32,
    #[serde(default)]
    pub current_sub_agent_turn_id: u32,
    #[serde(default)]
    pub sub_agent_counter: u32,
    #[serde(default)]
    pub current_sub_agent_session_id: Option<String>,

    #[serde(default)]
    pub env_info: BTreeMap<String, Value>,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default)]
    pub main_agent_message_history: Vec<Message>,
    #[serde(default)]
    pub sub_agent_message_history_sessions: BTreeMap<String, Vec<Message>>,

    #[serde(default)]
    pub step_logs: Vec<StepLog>,
    #[serde(default)]
    pub trace_data: BTreeMap<String, Value>,
}

fn default_log_dir() -> String {
    "logs".to_string()
}

/// Current time at UTC+8 formatted `%Y-%m-%d %H:%M:%S`.
pub fn utc_plus_8_now() -> String {
    let offset = FixedOffset::east_opt(8 * 3600).expect("valid fixed offset");
    Utc::now()
        .with_timezone(&offset)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Icon prefix for a step name, keyed on its content.
fn icon_for_step(step_name: &str, level: InfoLevel) -> &'static str {
    let lowered = step_name.to_lowercase();
    if step_name.contains("Tool Call Start") {
        "\u{25b6}\u{fe0f} "
    } else if step_name.contains("Tool Call Success") {
        "\u{2705} "
    } else if step_name.contains("Tool Call Error")
        || (level == InfoLevel::Error && lowered.contains("tool"))
    {
        "\u{274c} "
    } else if step_name.contains("agent-") {
        "\u{1f916} "
    } else if step_name.contains("Main Agent") {
        "\u{1f451} "
    } else if step_name.contains("LLM") {
        "\u{1f9e0} "
    } else if step_name.contains("ToolManager") || step_name.contains("Tool Call") {
        "\u{1f527} "
    } else if lowered.contains("tool-python") {
        "\u{1f40d} "
    } else if lowered.contains("tool-google-search") {
        "\u{1f50d} "
    } else if lowered.contains("tool-browser") || lowered.contains("playwright") {
        "\u{1f310} "
    } else {
        ""
    }
}

impl TaskLog {
    /// Create a running task log stamped with the current start time.
    pub fn new(task_id: impl Into<String>, input: Value, log_dir: impl Into<String>) -> Self {
        Self {
            status: "running".to_string(),
            start_time: utc_plus_8_now(),
            end_time: String::new(),
            task_id: task_id.into(),
            input,
            ground_truth: String::new(),
            final_boxed_answer: String::new(),
            error: String::new(),
            current_main_turn_id: 0,
            current_sub_agent_turn_id: 0,
            sub_agent_counter: 0,
            current_sub_agent_session_id: None,
            env_info: BTreeMap::new(),
            log_dir: log_dir.into(),
            main_agent_message_history: Vec::new(),
            sub_agent_message_history_sessions: BTreeMap::new(),
            step_logs: Vec::new(),
            trace_data: BTreeMap::new(),
        }
    }

    /// Append a step record and mirror it to the `log` facade.
    pub fn log_step(&mut self, level: InfoLevel, step_name: &str, message: &str) {
        self.log_step_with_metadata(level, step_name, message, BTreeMap::new());
    }

    /// [`log_step`](TaskLog::log_step) with attached metadata.
    pub fn log_step_with_metadata(
        &mut self,
        level: InfoLevel,
        step_name: &str,
        message: &str,
        metadata: BTreeMap<String, Value>,
    ) {
        let step_name_with_icon = format!("{}{}", icon_for_step(step_name, level), step_name);
        let log_message = format!("{}: {}", step_name_with_icon, message);
        match level {
            InfoLevel::Error => log::error!("{}", log_message),
            InfoLevel::Warning => log::warn!("{}", log_message),
            InfoLevel::Debug => log::debug!("{}", log_message),
            InfoLevel::Info => log::info!("{}", log_message),
        }

        self.step_logs.push(StepLog {
            step_name: step_name_with_icon,
            message: message.to_string(),
            timestamp: utc_plus_8_now(),
            info_level: level,
            metadata,
        });
    }

    /// Open a sub-agent session and return its generated session id
    /// (`"{name}_{counter}"`).
    pub fn start_sub_agent_session(
        &mut self,
        sub_agent_name: &str,
        subtask_description: &str,
    ) -> String {
        self.sub_agent_counter += 1;
        let session_id = format!("{}_{}", sub_agent_name, self.sub_agent_counter);
        self.current_sub_agent_session_id = Some(session_id.clone());

        let preview: String = subtask_description.chars().take(100).collect();
        let suffix = if subtask_description.chars().count() > 100 {
            "..."
        } else {
            ""
        };
        let mut metadata = BTreeMap::new();
        metadata.insert("session_id".to_string(), Value::String(session_id.clone()));
        metadata.insert(
            "subtask".to_string(),
            Value::String(subtask_description.to_string()),
        );
        self.log_step_with_metadata(
            InfoLevel::Info,
            &format!("{} | Session Start", sub_agent_name),
            &format!("Starting {} for subtask: {}{}", session_id, preview, suffix),
            metadata,
        );

        session_id
    }

    /// Close the current sub-agent session.
    pub fn end_sub_agent_session(&mut self, sub_agent_name: &str) {
        let session_id = self.current_sub_agent_session_id.clone();
        let mut metadata = BTreeMap::new();
        if let Some(id) = &session_id {
            metadata.insert("session_id".to_string(), Value::String(id.clone()));
        }
        self.log_step_with_metadata(
            InfoLevel::Info,
            &format!("{} | Session End", sub_agent_name),
            &format!("Ending {}", session_id.as_deref().unwrap_or("<none>")),
            metadata,
        );
        self.current_sub_agent_session_id = None;
    }

    /// Append an LLM call record under `trace_data.llm_calls`.
    pub fn record_llm_call(&mut self, record: LlmCallLog) {
        let entry = self
            .trace_data
            .entry("llm_calls".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(array) = entry {
            if let Ok(value) = serde_json::to_value(&record) {
                array.push(value);
            }
        }
    }

    /// Append a tool call record under `trace_data.tool_calls`.
    pub fn record_tool_call(&mut self, record: ToolCallLog) {
        let entry = self
            .trace_data
            .entry("tool_calls".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(array) = entry {
            if let Ok(value) = serde_json::to_value(&record) {
                array.push(value);
            }
        }
    }

    /// Serialize the whole record as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write the artifact to
    /// `{log_dir}/task_{task_id}_{start_time}.json`, creating the directory
    /// if needed. Colons, dots, and spaces in the start time are replaced
    /// with dashes for filesystem safety.
    pub fn save(&self) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.log_dir)?;
        let timestamp = self
            .start_time
            .replace(':', "-")
            .replace('.', "-")
            .replace(' ', "-");
        let filename = PathBuf::from(&self.log_dir)
            .join(format!("task_{}_{}.json", self.task_id, timestamp));
        let json = self
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&filename, json)?;
        Ok(filename)
    }
}

/// Cloneable shared handle over a [`TaskLog`].
///
/// Every component receives a handle instead of a global logger; the mutex
/// is held only for the duration of each synchronous mutation.
#[derive(Clone, Debug)]
pub struct TaskLogHandle {
    inner: Arc<Mutex<TaskLog>>,
}

impl TaskLogHandle {
    pub fn new(task_log: TaskLog) -> Self {
        Self {
            inner: Arc::new(Mutex::new(task_log)),
        }
    }

    /// Run `f` against the locked task log.
    pub fn with<R>(&self, f: impl FnOnce(&mut TaskLog) -> R) -> R {
        let mut guard = self.inner.lock().expect("task log mutex poisoned");
        f(&mut guard)
    }

    pub fn log_step(&self, level: InfoLevel, step_name: &str, message: &str) {
        self.with(|t| t.log_step(level, step_name, message));
    }

    pub fn save(&self) -> io::Result<PathBuf> {
        self.with(|t| t.save())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_log_gets_icon_and_timestamp() {
        let mut task_log = TaskLog::new("t1", Value::String("input".to_string()), "logs");
        task_log.log_step(InfoLevel::Info, "LLM | Call Start", "calling the model");
        assert_eq!(task_log.step_logs.len(), 1);
        let step = &task_log.step_logs[0];
        assert!(step.step_name.starts_with('\u{1f9e0}'));
        assert!(!step.timestamp.is_empty());
    }

    #[test]
    fn sub_agent_sessions_get_sequential_ids() {
        let mut task_log = TaskLog::new("t1", Value::Null, "logs");
        let first = task_log.start_sub_agent_session("agent-browsing", "find facts");
        assert_eq!(first, "agent-browsing_1");
        task_log.end_sub_agent_session("agent-browsing");
        assert!(task_log.current_sub_agent_session_id.is_none());

        let second = task_log.start_sub_agent_session("agent-browsing", "find more facts");
        assert_eq!(second, "agent-browsing_2");
    }

    #[test]
    fn trace_records_accumulate_in_arrays() {
        let mut task_log = TaskLog::new("t1", Value::Null, "logs");
        task_log.record_llm_call(LlmCallLog {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-0".to_string(),
            input_tokens: 100,
            output_tokens: 20,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            error: None,
        });
        task_log.record_tool_call(ToolCallLog {
            server_name: "tool-python".to_string(),
            tool_name: "run_python_code".to_string(),
            arguments: serde_json::json!({"code": "print(2+2)"}),
            result: Some("4".to_string()),
            error: None,
            call_time: Some(utc_plus_8_now()),
        });
        assert_eq!(task_log.trace_data["llm_calls"].as_array().unwrap().len(), 1);
        assert_eq!(task_log.trace_data["tool_calls"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn save_writes_single_json_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut task_log = TaskLog::new(
            "abc",
            Value::String("what is 2+2".to_string()),
            dir.path().to_str().unwrap(),
        );
        task_log.status = "success".to_string();
        task_log.final_boxed_answer = "4".to_string();
        let path = task_log.save().unwrap();
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("task_abc_"));

        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: TaskLog = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.status, "success");
        assert_eq!(parsed.final_boxed_answer, "4");
    }
}
