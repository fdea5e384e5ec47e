//! OpenAI-compatible Chat Completions client.
//!
//! Serves both the `openai` and `qwen` provider tags. Native function
//! calling is optional: when enabled, tool definitions are forwarded as a
//! `tools` array and the model's structured `tool_calls` are surfaced as
//! [`NativeToolCall`]s; when disabled the endpoint is used as a plain chat
//! surface and the framed dialect applies.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::agentflow::client_wrapper::{
    LLMClient, LlmResponse, Message, NativeToolCall, ServerToolset, TokenUsage,
};
use crate::agentflow::clients::common::{
    get_shared_http_client, native_tools_from_toolsets, openai_wire_messages,
    remove_tool_result_from_messages, LLM_CALL_TIMEOUT,
};
use crate::agentflow::config::LlmConfig;
use crate::agentflow::task_log::{InfoLevel, LlmCallLog, TaskLogHandle};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Client for `/chat/completions`-shaped endpoints.
#[derive(Debug)]
pub struct OpenAICompatClient {
    cfg: LlmConfig,
    http: reqwest::Client,
    usage: Mutex<TokenUsage>,
    task_log: TaskLogHandle,
    use_native_tool_calls: bool,
}

impl OpenAICompatClient {
    pub fn new(cfg: LlmConfig, task_log: TaskLogHandle, use_native_tool_calls: bool) -> Self {
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
            use_native_tool_calls,
        }
    }

    fn completions_url(&self) -> String {
        let base = self
            .cfg
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        format!("{}/chat/completions", base)
    }

    async fn send(&self, body: Value) -> Result<(LlmResponse, TokenUsage), String> {
        let url = self.completions_url();
        let response = self
            .http
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.cfg.api_key.as_deref().unwrap_or_default()),
            )
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

        let message = parsed
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .ok_or_else(|| "no choices in response".to_string())?;

        let content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let native_tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        let id = call.get("id")?.as_str()?.to_string();
                        let function = call.get("function")?;
                        let name = function.get("name")?.as_str()?.to_string();
                        let arguments = function
                            .get("arguments")
                            .and_then(Value::as_str)
                            .unwrap_or("{}")
                            .to_string();
                        Some(NativeToolCall {
                            id,
                            name,
                            arguments,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let usage = parsed.get("usage").cloned().unwrap_or(Value::Null);
        let delta = TokenUsage {
            total_input_tokens: usage
                .get("prompt_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            total_output_tokens: usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            total_cache_read_input_tokens: usage
                .get("prompt_tokens_details")
                .and_then(|details| details.get("cached_tokens"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
            // Cache writes are free and unreported on this surface.
            total_cache_write_input_tokens: 0,
        };

        Ok((
            LlmResponse {
                content,
                native_tool_calls,
            },
            delta,
        ))
    }
}

#[async_trait]
impl LLMClient for OpenAICompatClient {
    async fn create_message(
        &self,
        system_prompt: &str,
        message_history: &[Message],
        tool_definitions: &[ServerToolset],
        keep_tool_result: i64,
    ) -> (Option<LlmResponse>, Vec<Message>) {
        let retained =
            remove_tool_result_from_messages(message_history, keep_tool_result, &self.task_log);

        let mut body = serde_json::json!({
            "model": self.cfg.model_name,
            "messages": openai_wire_messages(system_prompt, &retained),
            "max_tokens": self.cfg.max_tokens,
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
        if let Some(repetition_penalty) = self.cfg.repetition_penalty {
            body["repetition_penalty"] = serde_json::json!(repetition_penalty);
        }
        if self.use_native_tool_calls && !tool_definitions.is_empty() {
            let tools = native_tools_from_toolsets(tool_definitions);
            if !tools.is_empty() {
                body["tools"] = Value::Array(tools);
            }
        }

        let outcome = match timeout(LLM_CALL_TIMEOUT, self.send(body)).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "LLM call exceeded {}s wall-clock timeout",
                LLM_CALL_TIMEOUT.as_secs()
            )),
        };

        match outcome {
            Ok((response, delta)) => {
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
                (Some(response), message_history.to_vec())
            }
            Err(error) => {
                if log::log_enabled!(log::Level::Error) {
                    log::error!("OpenAICompatClient::create_message error: {}", error);
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
        self.use_native_tool_calls
    }

    async fn usage(&self) -> TokenUsage {
        *self.usage.lock().await
    }
}
