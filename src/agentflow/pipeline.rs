//! Pipeline entry point: wire components, run, finalize.
//!
//! [`execute_task_pipeline`] is the one-call surface for hosts: it builds
//! the task log, stream handler, tool managers, and LLM client, brackets
//! the run with workflow events, and saves the task-log artifact exactly
//! once on every path that got past construction. Configuration errors
//! (unknown provider) abort before any artifact exists.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::agentflow::clients::create_llm_client;
use crate::agentflow::config::Config;
use crate::agentflow::orchestrator::Orchestrator;
use crate::agentflow::stream::{StreamHandler, StreamItem};
use crate::agentflow::task_log::{utc_plus_8_now, InfoLevel, TaskLog, TaskLogHandle};
use crate::agentflow::tool_manager::ToolManager;

/// What a completed pipeline hands back to the host.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Final banner: answer text, extracted result, token usage.
    pub final_summary: String,
    /// Extracted boxed answer (or the format-error sentinel).
    pub boxed_answer: String,
    /// Single-line usage summary.
    pub usage_log: String,
    /// Where the task-log artifact was written.
    pub log_path: Option<PathBuf>,
}

/// Build the task log, stream handler, and fully wired orchestrator.
///
/// Fails only on configuration errors; in that case no task log is saved.
pub fn create_pipeline_components(
    cfg: &Config,
    task_id: &str,
    task_description: &str,
    log_dir: &str,
    stream_queue: Option<mpsc::Sender<StreamItem>>,
) -> Result<(TaskLogHandle, StreamHandler, Orchestrator), Box<dyn Error + Send + Sync>> {
    let mut task_log = TaskLog::new(
        task_id,
        Value::String(task_description.to_string()),
        log_dir,
    );
    task_log.env_info.insert(
        "provider".to_string(),
        Value::String(cfg.llm.provider.clone()),
    );
    task_log.env_info.insert(
        "model_name".to_string(),
        Value::String(cfg.llm.model_name.clone()),
    );
    task_log.env_info.insert(
        "keep_tool_result".to_string(),
        Value::from(cfg.llm.keep_tool_result),
    );
    task_log.env_info.insert(
        "max_turns".to_string(),
        Value::from(cfg.agent.main_agent.max_turns),
    );
    task_log.env_info.insert(
        "max_tool_calls".to_string(),
        Value::from(cfg.agent.main_agent.max_tool_calls),
    );
    task_log.env_info.insert(
        "sub_agents".to_string(),
        Value::Array(
            cfg.agent
                .sub_agents
                .iter()
                .map(|sub| Value::String(sub.name.clone()))
                .collect(),
        ),
    );
    let task_log = TaskLogHandle::new(task_log);

    let stream = match stream_queue {
        Some(queue) => StreamHandler::new(queue),
        None => StreamHandler::disabled(),
    };

    let llm_client = create_llm_client(&cfg.llm, task_log.clone())?;

    let main_manager = Arc::new(ToolManager::new(
        cfg.agent.main_agent.tools.clone(),
        task_log.clone(),
    ));
    let mut orchestrator = Orchestrator::new(
        llm_client,
        main_manager,
        cfg.agent.main_agent.clone(),
        cfg.llm.keep_tool_result,
        task_log.clone(),
        stream.clone(),
    );
    for sub in &cfg.agent.sub_agents {
        let manager = Arc::new(ToolManager::new(sub.tools.clone(), task_log.clone()));
        orchestrator = orchestrator.with_sub_agent(sub.clone(), manager);
    }

    Ok((task_log, stream, orchestrator))
}

/// Run one task end to end.
///
/// On success (including budget exhaustion, tool failures, and a missing
/// boxed answer — those are all data) the task log is saved with status
/// `"success"`, or `"cancelled"` when the host stopped the run. A hard
/// orchestrator failure saves the log with status `"error"` and propagates.
pub async fn execute_task_pipeline(
    cfg: &Config,
    task_id: &str,
    task_description: &str,
    log_dir: &str,
    stream_queue: Option<mpsc::Sender<StreamItem>>,
    cancel: Option<watch::Receiver<bool>>,
) -> Result<PipelineOutput, Box<dyn Error + Send + Sync>> {
    let (task_log, stream, orchestrator) =
        create_pipeline_components(cfg, task_id, task_description, log_dir, stream_queue)?;
    let orchestrator = match cancel {
        Some(cancel) => orchestrator.with_cancellation(cancel),
        None => orchestrator,
    };

    let workflow_id = stream.start_workflow(task_description).await;

    match orchestrator.run_main_agent(task_description).await {
        Ok(outcome) => {
            task_log.with(|t| {
                t.status = if outcome.cancelled {
                    "cancelled".to_string()
                } else {
                    "success".to_string()
                };
                t.final_boxed_answer = outcome.boxed_answer.clone();
                t.end_time = utc_plus_8_now();
            });
            stream.end_workflow(&workflow_id).await;
            stream.close().await;

            let log_path = match task_log.save() {
                Ok(path) => {
                    task_log.log_step(
                        InfoLevel::Info,
                        "Pipeline | Task Log Saved",
                        &format!("Task log written to {}", path.display()),
                    );
                    Some(path)
                }
                Err(error) => {
                    task_log.log_step(
                        InfoLevel::Error,
                        "Pipeline | Task Log Save Error",
                        &format!("Failed to write task log: {}", error),
                    );
                    None
                }
            };

            Ok(PipelineOutput {
                final_summary: outcome.final_summary,
                boxed_answer: outcome.boxed_answer,
                usage_log: outcome.usage_log,
                log_path,
            })
        }
        Err(error) => {
            task_log.with(|t| {
                t.status = "error".to_string();
                t.error = error.to_string();
                t.end_time = utc_plus_8_now();
            });
            stream.show_error(&error.to_string()).await;
            if let Err(save_error) = task_log.save() {
                log::error!("Failed to save task log after error: {}", save_error);
            }
            Err(Box::new(error))
        }
    }
}
