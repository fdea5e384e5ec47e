//! Output formatting: boxed-answer extraction and tool-result shaping.

use crate::agentflow::client_wrapper::ToolCallResult;
use crate::agentflow::prompt::FORMAT_ERROR_MESSAGE;

/// Ceiling applied to tool results before they re-enter the conversation.
/// 100k characters is roughly 25k tokens.
pub const MAX_TOOL_RESULT_LEN: usize = 100_000;

const BOXED_BLACKLIST: &[&str] = &[
    "?", "??", "???", "\u{ff1f}", "\u{2026}\u{2026}", "\u{2026}", "...", "unknown",
];

/// Formats model output and tool results for the conversation and the final
/// summary.
#[derive(Debug, Clone, Default)]
pub struct OutputFormatter;

impl OutputFormatter {
    pub fn new() -> Self {
        Self
    }

    /// Extract the content of the **last** `\boxed{...}` occurrence.
    ///
    /// Supports arbitrary brace nesting, escaped braces (`\{`, `\}`),
    /// whitespace between `\boxed` and the opening brace, empty content,
    /// and an unterminated final `\boxed{` (extracts to end of string).
    /// Returns the empty string when nothing matches or the extracted value
    /// is blacklisted (`?`, `unknown`, ellipses, empty).
    pub fn extract_boxed_content(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }

        let chars: Vec<char> = text.chars().collect();
        let n = chars.len();
        let mut last_result: Option<String> = None;
        let mut i = 0;

        while let Some(found) = find_boxed(&chars, i) {
            let mut j = found + "\\boxed".len();

            while j < n && chars[j].is_whitespace() {
                j += 1;
            }
            if j >= n || chars[j] != '{' {
                i = j;
                continue;
            }

            // Scan the brace content manually to honor nesting and escapes.
            let mut depth = 0usize;
            let mut k = j;
            let mut escaped = false;
            let mut found_closing = false;
            while k < n {
                let ch = chars[k];
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '{' {
                    depth += 1;
                } else if ch == '}' {
                    depth -= 1;
                    if depth == 0 {
                        last_result = Some(chars[j + 1..k].iter().collect());
                        i = k + 1;
                        found_closing = true;
                        break;
                    }
                }
                k += 1;
            }

            if !found_closing {
                if depth > 0 {
                    // Unterminated boxed: take everything to end of string.
                    last_result = Some(chars[j + 1..n].iter().collect());
                }
                i = k.max(j + 1);
            }
        }

        match last_result {
            Some(result) => {
                let trimmed = result.trim().to_string();
                if trimmed.is_empty() || BOXED_BLACKLIST.contains(&trimmed.as_str()) {
                    String::new()
                } else {
                    trimmed
                }
            }
            None => String::new(),
        }
    }

    /// Shape a tool execution result for re-attachment to the conversation.
    ///
    /// Errors become a concise `"Tool call to T on S failed. Error: …"`
    /// line; successful results pass through, truncated at
    /// [`MAX_TOOL_RESULT_LEN`] characters.
    pub fn format_tool_result_for_user(&self, result: &ToolCallResult) -> String {
        if let Some(error) = &result.error {
            return format!(
                "Tool call to {} on {} failed. Error: {}",
                result.tool_name, result.server_name, error
            );
        }
        match &result.result {
            Some(content) => {
                if content.chars().count() > MAX_TOOL_RESULT_LEN {
                    let truncated: String = content.chars().take(MAX_TOOL_RESULT_LEN).collect();
                    format!("{}\n... [Result truncated]", truncated)
                } else {
                    content.clone()
                }
            }
            None => format!(
                "Tool call to {} on {} completed, but produced no specific output or result.",
                result.tool_name, result.server_name
            ),
        }
    }

    /// Build the final summary banner and extract the boxed result.
    ///
    /// Returns `(summary_text, boxed_result, usage_log_line)`. When the
    /// answer text contains no usable `\boxed{}` content, `boxed_result` is
    /// the reserved [`FORMAT_ERROR_MESSAGE`] sentinel.
    pub fn format_final_summary_and_log(
        &self,
        final_answer_text: &str,
        usage_summary: Option<(Vec<String>, String)>,
    ) -> (String, String, String) {
        let mut summary_lines = Vec::new();
        summary_lines.push(format!(
            "\n{} Final Answer {}",
            "=".repeat(30),
            "=".repeat(30)
        ));
        summary_lines.push(final_answer_text.to_string());

        let mut boxed_result = self.extract_boxed_content(final_answer_text);

        summary_lines.push(format!(
            "\n{} Extracted Result {}",
            "-".repeat(20),
            "-".repeat(20)
        ));
        if !boxed_result.is_empty() {
            summary_lines.push(boxed_result.clone());
        } else if !final_answer_text.is_empty() {
            summary_lines.push("No \\boxed{} content found.".to_string());
            boxed_result = FORMAT_ERROR_MESSAGE.to_string();
        }

        let log_string = match usage_summary {
            Some((lines, log_string)) => {
                summary_lines.extend(lines);
                log_string
            }
            None => {
                summary_lines.push(format!(
                    "\n{} Token Usage & Cost {}",
                    "-".repeat(20),
                    "-".repeat(20)
                ));
                summary_lines.push("Token usage information not available.".to_string());
                "Token usage information not available.".to_string()
            }
        };

        (summary_lines.join("\n"), boxed_result, log_string)
    }
}

fn find_boxed(chars: &[char], from: usize) -> Option<usize> {
    let needle = ['\\', 'b', 'o', 'x', 'e', 'd'];
    if chars.len() < needle.len() {
        return None;
    }
    (from..=chars.len() - needle.len()).find(|&start| chars[start..start + needle.len()] == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(text: &str) -> String {
        OutputFormatter::new().extract_boxed_content(text)
    }

    #[test]
    fn last_boxed_occurrence_wins() {
        assert_eq!(extract("pre \\boxed{X} mid \\boxed{Y} post"), "Y");
    }

    #[test]
    fn nested_braces_are_preserved() {
        assert_eq!(extract("answer: \\boxed{a {nested} b}"), "a {nested} b");
    }

    #[test]
    fn unterminated_boxed_extracts_to_end() {
        assert_eq!(extract("thinking... \\boxed{unterm"), "unterm");
    }

    #[test]
    fn escaped_braces_do_not_close() {
        assert_eq!(extract("\\boxed{a \\{ b \\} c}"), "a \\{ b \\} c");
    }

    #[test]
    fn whitespace_after_boxed_is_allowed() {
        assert_eq!(extract("\\boxed {42}"), "42");
    }

    #[test]
    fn blacklisted_values_yield_empty() {
        assert_eq!(extract("\\boxed{?}"), "");
        assert_eq!(extract("\\boxed{???}"), "");
        assert_eq!(extract("\\boxed{unknown}"), "");
        assert_eq!(extract("\\boxed{}"), "");
        assert_eq!(extract("no box at all"), "");
    }

    #[test]
    fn tool_error_is_formatted_concisely() {
        let formatter = OutputFormatter::new();
        let result = ToolCallResult::err("tool-python", "run_python_code", "kernel died");
        assert_eq!(
            formatter.format_tool_result_for_user(&result),
            "Tool call to run_python_code on tool-python failed. Error: kernel died"
        );
    }

    #[test]
    fn long_results_are_truncated() {
        let formatter = OutputFormatter::new();
        let long = "x".repeat(MAX_TOOL_RESULT_LEN + 10);
        let result = ToolCallResult::ok("tool-python", "run_python_code", long);
        let formatted = formatter.format_tool_result_for_user(&result);
        assert!(formatted.ends_with("... [Result truncated]"));
        assert!(formatted.chars().count() < MAX_TOOL_RESULT_LEN + 50);
    }

    #[test]
    fn empty_result_gets_placeholder_text() {
        let formatter = OutputFormatter::new();
        let result = ToolCallResult {
            server_name: "tool-python".to_string(),
            tool_name: "run_python_code".to_string(),
            result: None,
            error: None,
        };
        let formatted = formatter.format_tool_result_for_user(&result);
        assert!(formatted.contains("produced no specific output"));
    }

    #[test]
    fn missing_boxed_answer_becomes_sentinel() {
        let formatter = OutputFormatter::new();
        let (summary, boxed, _) =
            formatter.format_final_summary_and_log("I could not find the answer.", None);
        assert_eq!(boxed, FORMAT_ERROR_MESSAGE);
        assert!(summary.contains("No \\boxed{} content found."));
    }

    #[test]
    fn present_boxed_answer_is_extracted() {
        let formatter = OutputFormatter::new();
        let (summary, boxed, _) =
            formatter.format_final_summary_and_log("The total is \\boxed{4}", None);
        assert_eq!(boxed, "4");
        assert!(summary.contains("Final Answer"));
    }
}
