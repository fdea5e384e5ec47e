//! Provider client implementations and the selection factory.

pub mod anthropic;
pub mod common;
pub mod openai_compat;

use std::error::Error;
use std::sync::Arc;

use crate::agentflow::client_wrapper::LLMClient;
use crate::agentflow::config::LlmConfig;
use crate::agentflow::task_log::TaskLogHandle;

pub use common::{get_shared_http_client, TOOL_RESULT_OMITTED};

/// Select and construct the provider client for `cfg.provider`.
///
/// `anthropic` speaks the framed dialect; `openai` defaults to native
/// function calling and `qwen` to the framed dialect, both overridable via
/// `cfg.use_tool_calls`. An unknown provider is a fatal configuration
/// error.
pub fn create_llm_client(
    cfg: &LlmConfig,
    task_log: TaskLogHandle,
) -> Result<Arc<dyn LLMClient>, Box<dyn Error + Send + Sync>> {
    match cfg.provider.as_str() {
        "anthropic" => Ok(Arc::new(anthropic::AnthropicClient::new(
            cfg.clone(),
            task_log,
        ))),
        "openai" => Ok(Arc::new(openai_compat::OpenAICompatClient::new(
            cfg.clone(),
            task_log,
            cfg.use_tool_calls.unwrap_or(true),
        ))),
        "qwen" => Ok(Arc::new(openai_compat::OpenAICompatClient::new(
            cfg.clone(),
            task_log,
            cfg.use_tool_calls.unwrap_or(false),
        ))),
        other => Err(format!("Unsupported provider: {}", other).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentflow::task_log::TaskLog;

    fn config(provider: &str) -> LlmConfig {
        serde_json::from_value(serde_json::json!({
            "provider": provider,
            "model_name": "test-model",
        }))
        .unwrap()
    }

    fn handle() -> TaskLogHandle {
        TaskLogHandle::new(TaskLog::new("t", serde_json::Value::Null, "logs"))
    }

    #[test]
    fn known_providers_construct_with_expected_dialects() {
        let anthropic = create_llm_client(&config("anthropic"), handle()).unwrap();
        assert!(!anthropic.uses_native_tool_calls());

        let openai = create_llm_client(&config("openai"), handle()).unwrap();
        assert!(openai.uses_native_tool_calls());

        let qwen = create_llm_client(&config("qwen"), handle()).unwrap();
        assert!(!qwen.uses_native_tool_calls());
    }

    #[test]
    fn unknown_provider_is_a_fatal_config_error() {
        let error = create_llm_client(&config("mystery"), handle()).unwrap_err();
        assert!(error.to_string().contains("Unsupported provider"));
    }
}
