//! Response parsing: text, reasoning, and tool calls in both dialects.
//!
//! A model response arrives either with structured native tool calls
//! (function calling) or as free-form text carrying `<use_mcp_tool>` blocks
//! in the framed dialect. This module extracts the visible text, the
//! optional `<think>` reasoning block, and the ordered tool-call list, with
//! two layers of tolerance:
//!
//! 1. **Argument repair** — [`safe_json_loads`] first parses strictly, then
//!    fixes the common violations models produce (single quotes, Python
//!    literals, unescaped backslashes). A call whose arguments cannot be
//!    repaired is still emitted, carrying an `{error, raw}` object, so the
//!    model gets to see its own malformed output as a tool error.
//! 2. **Name correction** — a `tool_name → server_name` table scraped from
//!    the system-prompt headings fixes wrong server names for known tools
//!    and rewrites an enumerated allow-list of commonly-misnamed tools.
//!    Names outside the allow-list pass through untouched.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::agentflow::client_wrapper::{LlmResponse, ToolCall};

lazy_static! {
    static ref TOOL_CALL_RE: Regex = Regex::new(
        r"(?s)<use_mcp_tool>\s*<server_name>(.*?)</server_name>\s*<tool_name>(.*?)</tool_name>\s*<arguments>\s*(.*?)\s*</arguments>\s*</use_mcp_tool>"
    )
    .expect("valid tool call regex");
    static ref THINK_RE: Regex =
        Regex::new(r"(?s)<think>(.*?)</think>").expect("valid think regex");
    static ref SERVER_HEADING_RE: Regex =
        Regex::new(r"(?m)^## Server name:[ \t]*(.+?)[ \t]*\r?$").expect("valid server heading regex");
    static ref TOOL_HEADING_RE: Regex =
        Regex::new(r"(?m)^### Tool name:[ \t]*(.+?)[ \t]*\r?$").expect("valid tool heading regex");
}

/// Aliases the correction pass is allowed to rewrite, mapped to their
/// canonical tool names. Rewrites only apply when the canonical name is
/// actually declared in the active system prompt.
const TOOL_NAME_ALIASES: &[(&str, &str)] = &[
    ("python", "run_python_code"),
    ("python_code", "run_python_code"),
    ("execute_python", "run_python_code"),
    ("run_python", "run_python_code"),
    ("search", "google_search"),
    ("web_search", "google_search"),
];

/// The three things extracted from one model response.
#[derive(Debug, Clone, Default)]
pub struct ParsedResponse {
    /// Visible text: everything before the first `<use_mcp_tool>`.
    pub text: String,
    /// Content of the first `<think>…</think>` block, if any.
    pub reasoning: Option<String>,
    /// Tool calls in emission order.
    pub tool_calls: Vec<ToolCall>,
}

/// Parser instance bound to one agent's tool declarations.
///
/// The correction table is rebuilt whenever a new system prompt is
/// produced; main and sub-agents have different tool sets and therefore
/// different parser instances.
#[derive(Debug, Clone, Default)]
pub struct ResponseParser {
    tool_server_map: HashMap<String, String>,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a parser whose correction table is scraped from `system_prompt`.
    pub fn from_system_prompt(system_prompt: &str) -> Self {
        let mut parser = Self::new();
        parser.set_tool_server_mapping(system_prompt);
        parser
    }

    /// Rebuild the `tool_name → server_name` table from the prompt's
    /// `## Server name:` / `### Tool name:` headings.
    pub fn set_tool_server_mapping(&mut self, system_prompt: &str) {
        self.tool_server_map.clear();

        let server_matches: Vec<(usize, usize, String)> = SERVER_HEADING_RE
            .captures_iter(system_prompt)
            .filter_map(|cap| {
                let whole = cap.get(0)?;
                let name = cap.get(1)?.as_str().trim().to_string();
                Some((whole.start(), whole.end(), name))
            })
            .collect();

        for (index, (_, section_start, server_name)) in server_matches.iter().enumerate() {
            let section_end = server_matches
                .get(index + 1)
                .map(|(start, _, _)| *start)
                .unwrap_or(system_prompt.len());
            let section = &system_prompt[*section_start..section_end];
            for cap in TOOL_HEADING_RE.captures_iter(section) {
                if let Some(tool_name) = cap.get(1) {
                    self.tool_server_map
                        .insert(tool_name.as_str().trim().to_string(), server_name.clone());
                }
            }
        }
    }

    /// Known `tool_name → server_name` pairs (for diagnostics/tests).
    pub fn tool_server_map(&self) -> &HashMap<String, String> {
        &self.tool_server_map
    }

    /// Parse a provider response into text, reasoning, and tool calls.
    ///
    /// The dialect is chosen by response shape: structured native calls
    /// take precedence; otherwise the framed blocks in the text are
    /// extracted in order.
    pub fn parse(&self, response: &LlmResponse) -> ParsedResponse {
        let text = extract_response_text(&response.content);
        let reasoning = extract_reasoning(&response.content);

        let mut tool_calls: Vec<ToolCall> = if !response.native_tool_calls.is_empty() {
            response
                .native_tool_calls
                .iter()
                .map(|native| {
                    // Native names are "{server_name}-{tool_name}" joined;
                    // split on the last dash since server names carry dashes.
                    let (server_name, tool_name) = match native.name.rsplit_once('-') {
                        Some((server, tool)) => (server.to_string(), tool.to_string()),
                        None => (String::new(), native.name.clone()),
                    };
                    ToolCall {
                        id: Some(native.id.clone()),
                        server_name,
                        tool_name,
                        arguments: filter_none_values(safe_json_loads(&native.arguments)),
                    }
                })
                .collect()
        } else {
            TOOL_CALL_RE
                .captures_iter(&response.content)
                .map(|cap| ToolCall {
                    id: None,
                    server_name: cap[1].trim().to_string(),
                    tool_name: cap[2].trim().to_string(),
                    arguments: filter_none_values(safe_json_loads(cap[3].trim())),
                })
                .collect()
        };

        for call in &mut tool_calls {
            self.correct_names(call);
        }

        ParsedResponse {
            text,
            reasoning,
            tool_calls,
        }
    }

    fn correct_names(&self, call: &mut ToolCall) {
        if let Some(server_name) = self.tool_server_map.get(&call.tool_name) {
            if &call.server_name != server_name {
                call.server_name = server_name.clone();
            }
            return;
        }
        let alias = TOOL_NAME_ALIASES
            .iter()
            .find(|(alias, _)| *alias == call.tool_name);
        if let Some((_, canonical)) = alias {
            if let Some(server_name) = self.tool_server_map.get(*canonical) {
                call.tool_name = (*canonical).to_string();
                call.server_name = server_name.clone();
            }
        }
    }
}

/// Visible text of a response: everything before the first
/// `<use_mcp_tool>`, trimmed.
pub fn extract_response_text(content: &str) -> String {
    match content.find("<use_mcp_tool>") {
        Some(start) => content[..start].trim().to_string(),
        None => content.trim().to_string(),
    }
}

/// Content of the first `<think>…</think>` block, trimmed.
pub fn extract_reasoning(content: &str) -> Option<String> {
    THINK_RE
        .captures(content)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Best-effort progress text for a response: the main content after
/// `</think>` and before any tool block when non-empty, otherwise the
/// think content itself.
pub fn extract_progress_summary(content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }

    let (think_content, after_think) = match THINK_RE.captures(content) {
        Some(cap) => {
            let think = cap.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            let end = cap.get(0).map(|m| m.end()).unwrap_or(0);
            (think.to_string(), &content[end..])
        }
        None => (String::new(), content),
    };

    let main_content = match after_think.find("<use_mcp_tool>") {
        Some(start) => after_think[..start].trim(),
        None => after_think.trim(),
    };

    if !main_content.is_empty() {
        main_content.to_string()
    } else {
        think_content
    }
}

/// Parse a JSON argument string with repair fallbacks.
///
/// 1. Strict `serde_json` parse.
/// 2. Quote/literal repair: single quotes to double quotes and the Python
///    literals `None`/`True`/`False` to their JSON forms.
/// 3. Backslash repair on top: backslashes that do not begin a valid JSON
///    escape sequence are doubled (Windows paths, `\1` references).
///
/// When every attempt fails the raw string is wrapped in an
/// `{"error": "Failed to parse arguments", "raw": …}` object instead of
/// being discarded.
pub fn safe_json_loads(arguments_str: &str) -> Value {
    if let Ok(value) = serde_json::from_str(arguments_str) {
        return value;
    }

    let repaired = fix_python_literals(&arguments_str.replace('\'', "\""));
    if let Ok(value) = serde_json::from_str(&repaired) {
        return value;
    }

    if let Ok(value) = serde_json::from_str(&fix_backslash_escapes(&repaired)) {
        return value;
    }

    if let Ok(value) = serde_json::from_str(&fix_backslash_escapes(arguments_str)) {
        return value;
    }

    log::warn!("Unable to parse JSON: {}", arguments_str);
    serde_json::json!({
        "error": "Failed to parse arguments",
        "raw": arguments_str,
    })
}

/// Drop top-level `null` values from an argument object so optional
/// parameters the model nulled out are not forwarded to the tool.
pub fn filter_none_values(arguments: Value) -> Value {
    match arguments {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, value)| !value.is_null())
                .collect(),
        ),
        other => other,
    }
}

fn fix_python_literals(json_str: &str) -> String {
    json_str
        .replace("None", "null")
        .replace("True", "true")
        .replace("False", "false")
}

/// Double every backslash that does not begin a valid JSON escape sequence
/// (`\\`, `\"`, `\/`, `\b`, `\f`, `\n`, `\r`, `\t`, `\u`). Valid sequences
/// are consumed as pairs so an already-escaped backslash is never touched.
fn fix_backslash_escapes(json_str: &str) -> String {
    let chars: Vec<char> = json_str.chars().collect();
    let mut fixed = String::with_capacity(json_str.len());
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if ch != '\\' {
            fixed.push(ch);
            i += 1;
            continue;
        }
        match chars.get(i + 1) {
            Some(&next) if matches!(next, '\\' | '"' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
                fixed.push('\\');
                fixed.push(next);
                i += 2;
            }
            Some(&next) => {
                fixed.push('\\');
                fixed.push('\\');
                fixed.push(next);
                i += 2;
            }
            None => {
                fixed.push('\\');
                fixed.push('\\');
                i += 1;
            }
        }
    }
    fixed
}
