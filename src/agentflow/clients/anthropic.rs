//! Anthropic Messages API client.
//!
//! Speaks the framed tool dialect: tool schemas are declared in the system
//! prompt rather than sent natively, the model emits `<use_mcp_tool>`
//! blocks in its text, and tool results return as `user` messages. Token
//! accounting unifies Anthropic's cache counters into the shared
//! [`TokenUsage`] shape.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::agentflow::client_wrapper::{
    LLMClient, LlmResponse, Message, MessageContent, Role, ServerToolset, TokenUsage,
};
use crate::agentflow::clients::common::{
    get_shared_http_client, remove_tool_result_from_messages, LLM_CALL_TIMEOUT,
};
use crate::agentflow::config::LlmConfig;
use crate::agentflow::task_log::{InfoLevel, LlmCallLog, TaskLogHandle};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Client for Anthropic's `/v1/messages` endpoint.
#[derive(Debug)]
pub struct AnthropicClient {
    cfg: LlmConfig,
    http: reqwest::Client,
    usage: Mutex<TokenUsage>,
    task_log: TaskLogHandle,
}

impl AnthropicClient {
    pub fn new(cfg: LlmConfig, task_log: TaskLogHandle) -> Self {
        task_log.log_step(
            InfoLevel::Info,
            "LLM | Initialization",
            &format!(
                "LLMClient {} {} initialization completed.",
                cfg.provider, cfg.model_name
            ),
        );
        Self {
            cfg,
            http: get_shared_http_client().clone(),
            usage: Mutex::new(TokenUsage::default()),
            task_log,
        }
    }

    fn messages_url(&self) -> String {
        let base = self
            .cfg
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        format!("{}/v1/messages", base)
    }

    fn wire_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::Assistant => "assistant",
                    // System content never appears inside history here and
                    // tool results travel as user messages in this dialect.
                    _ => "user",
                };
                let content = match &msg.content {
                    MessageContent::Text(text) => Value::String(text.clone()),
                    MessageContent::Blocks(blocks) => {
                        serde_json::to_value(blocks).unwrap_or(Value::Null)
                    }
                };
                serde_json::json!({ "role": role, "content": content })
            })
            .collect()
    }

    async fn send(&self, body: Value) -> Result<(String, TokenUsage), String> {
        let url = self.messages_url();
        let response = self
            .http
            .post(&url)
            .header("x-api-key", self.cfg.api_key.as_deref().unwrap_or_default())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {}", url, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| format!("failed to read response body: {}", e))?;
        if !status.is_success() {
            return Err(format!("HTTP {} from {}: {}", status, url, text));
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| format!("malformed response JSON: {}", e))?;

        let content = parsed
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|block| block.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let usage = parsed.get("usage").cloned().unwrap_or(Value::Null);
        let delta = TokenUsage {
            total_input_tokens: usage
                .get("input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            total_output_tokens: usage
                .get("output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            total_cache_read_input_tokens: usage
                .get("cache_read_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            total_cache_write_input_tokens: usage
                .get("cache_creation_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        };

        Ok((content, delta))
    }
}

#[async_trait]
impl LLMClient for AnthropicClient {
    async fn create_message(
        &self,
        system_prompt: &str,
        message_history: &[Message],
        _tool_definitions: &[ServerToolset],
        keep_tool_result: i64,
    ) -> (Option<LlmResponse>, Vec<Message>) {
        let retained =
            remove_tool_result_from_messages(message_history, keep_tool_result, &self.task_log);

        let mut body = serde_json::json!({
            "model": self.cfg.model_name,
            "max_tokens": self.cfg.max_tokens,
            "system": system_prompt,
            "messages": Self::wire_messages(&retained),
        });
        if let Some(temperature) = self.cfg.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(top_p) = self.cfg.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if let Some(top_k) = self.cfg.top_k {
            body["top_k"] = serde_json::json!(top_k);
        }

        let outcome = match timeout(LLM_CALL_TIMEOUT, self.send(body)).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "LLM call exceeded {}s wall-clock timeout",
                LLM_CALL_TIMEOUT.as_secs()
            )),
        };

        match outcome {
            Ok((content, delta)) => {
                self.usage.lock().await.accumulate(&delta);
                self.task_log.with(|t| {
                    t.record_llm_call(LlmCallLog {
                        provider: self.cfg.provider.clone(),
                        model: self.cfg.model_name.clone(),
                        input_tokens: delta.total_input_tokens,
                        output_tokens: delta.total_output_tokens,
                        cache_creation_tokens: delta.total_cache_write_input_tokens,
                        cache_read_tokens: delta.total_cache_read_input_tokens,
                        error: None,
                    });
                });
                (
                    Some(LlmResponse {
                        content,
                        native_tool_calls: Vec::new(),
                    }),
                    message_history.to_vec(),
                )
            }
            Err(error) => {
                if log::log_enabled!(log::Level::Error) {
                    log::error!("AnthropicClient::create_message error: {}", error);
                }
                self.task_log.with(|t| {
                    t.log_step(
                        InfoLevel::Error,
                        "FATAL ERROR | LLM Call ERROR",
                        &format!("LLM call failed: {}", error),
                    );
                    t.record_llm_call(LlmCallLog {
                        provider: self.cfg.provider.clone(),
                        model: self.cfg.model_name.clone(),
                        input_tokens: 0,
                        output_tokens: 0,
                        cache_creation_tokens: 0,
                        cache_read_tokens: 0,
                        error: Some(error),
                    });
                });
                (None, message_history.to_vec())
            }
        }
    }

    fn provider(&self) -> &str {
        &self.cfg.provider
    }

    fn model_name(&self) -> &str {
        &self.cfg.model_name
    }

    fn uses_native_tool_calls(&self) -> bool {
        false
    }

    async fn usage(&self) -> TokenUsage {
        *self.usage.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_map_tool_results_to_user_role() {
        let messages = vec![
            Message::user("task"),
            Message::assistant("calling a tool", Vec::new()),
            Message::user("tool result"),
        ];
        let wire = AnthropicClient::wire_messages(&messages);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[1]["role"], "assistant");
        assert_eq!(wire[2]["role"], "user");
    }

    #[test]
    fn block_content_is_preserved_on_the_wire() {
        use crate::agentflow::client_wrapper::TextBlock;
        let messages = vec![Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![TextBlock::text("block text")]),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }];
        let wire = AnthropicClient::wire_messages(&messages);
        assert_eq!(wire[0]["content"][0]["type"], "text");
        assert_eq!(wire[0]["content"][0]["text"], "block text");
    }
}
