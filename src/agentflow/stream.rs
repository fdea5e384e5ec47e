//! Streaming event bus.
//!
//! A single ordered stream of typed events describes the whole hierarchical
//! execution: workflow and agent lifecycles, LLM round-trips, message
//! deltas, and tool calls. Consumers read from the paired receiver; a
//! `None` item on the queue signals end-of-stream.
//!
//! Streaming is pure observability. Every send failure is logged and
//! swallowed — a slow or dropped consumer never stalls or fails the run.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One bus event, serialized as `{"event": <type>, "data": {…}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    StartOfWorkflow {
        workflow_id: String,
        input: Value,
    },
    EndOfWorkflow {
        workflow_id: String,
    },
    StartOfAgent {
        agent_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        agent_id: String,
    },
    EndOfAgent {
        agent_name: String,
        agent_id: String,
    },
    StartOfLlm {
        agent_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    EndOfLlm {
        agent_name: String,
    },
    Message {
        message_id: String,
        delta: MessageDelta,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        delta_input: Option<Value>,
    },
}

/// Incremental message content.
#[derive(Debug, Clone, Serialize)]
pub struct MessageDelta {
    pub content: String,
}

/// Queue item type: `None` is the end-of-stream marker.
pub type StreamItem = Option<StreamEvent>;

/// Handle for publishing events. Cheap to clone; a handler built without a
/// queue discards everything.
#[derive(Clone)]
pub struct StreamHandler {
    queue: Option<mpsc::Sender<StreamItem>>,
}

impl StreamHandler {
    pub fn new(queue: mpsc::Sender<StreamItem>) -> Self {
        Self { queue: Some(queue) }
    }

    /// A handler with streaming disabled.
    pub fn disabled() -> Self {
        Self { queue: None }
    }

    async fn update(&self, event: StreamEvent) {
        if let Some(queue) = &self.queue {
            if let Err(e) = queue.send(Some(event)).await {
                log::warn!("Failed to send stream update: {}", e);
            }
        }
    }

    /// Emit `start_of_workflow` and return the generated workflow id.
    pub async fn start_workflow(&self, user_input: &str) -> String {
        let workflow_id = Uuid::new_v4().to_string();
        self.update(StreamEvent::StartOfWorkflow {
            workflow_id: workflow_id.clone(),
            input: serde_json::json!([{ "role": "user", "content": user_input }]),
        })
        .await;
        workflow_id
    }

    pub async fn end_workflow(&self, workflow_id: &str) {
        self.update(StreamEvent::EndOfWorkflow {
            workflow_id: workflow_id.to_string(),
        })
        .await;
    }

    /// Emit `start_of_agent` and return the generated agent id.
    pub async fn start_agent(&self, agent_name: &str, display_name: Option<&str>) -> String {
        let agent_id = Uuid::new_v4().to_string();
        self.update(StreamEvent::StartOfAgent {
            agent_name: agent_name.to_string(),
            display_name: display_name.map(str::to_string),
            agent_id: agent_id.clone(),
        })
        .await;
        agent_id
    }

    pub async fn end_agent(&self, agent_name: &str, agent_id: &str) {
        self.update(StreamEvent::EndOfAgent {
            agent_name: agent_name.to_string(),
            agent_id: agent_id.to_string(),
        })
        .await;
    }

    pub async fn start_llm(&self, agent_name: &str) {
        self.update(StreamEvent::StartOfLlm {
            agent_name: agent_name.to_string(),
            display_name: None,
        })
        .await;
    }

    pub async fn end_llm(&self, agent_name: &str) {
        self.update(StreamEvent::EndOfLlm {
            agent_name: agent_name.to_string(),
        })
        .await;
    }

    pub async fn message(&self, message_id: &str, delta_content: &str) {
        self.update(StreamEvent::Message {
            message_id: message_id.to_string(),
            delta: MessageDelta {
                content: delta_content.to_string(),
            },
        })
        .await;
    }

    /// Emit a `tool_call` event and return its id (generated when the
    /// caller passes `None`).
    ///
    /// With `streaming` set, the payload is sent one key at a time as
    /// `delta_input` events; otherwise a single complete `tool_input`
    /// event is sent.
    pub async fn tool_call(
        &self,
        tool_name: &str,
        payload: Value,
        streaming: bool,
        tool_call_id: Option<String>,
    ) -> String {
        let tool_call_id = tool_call_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if streaming {
            if let Value::Object(map) = payload {
                for (key, value) in map {
                    self.update(StreamEvent::ToolCall {
                        tool_call_id: tool_call_id.clone(),
                        tool_name: tool_name.to_string(),
                        tool_input: None,
                        delta_input: Some(serde_json::json!({ key: value })),
                    })
                    .await;
                }
            }
        } else {
            self.update(StreamEvent::ToolCall {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.to_string(),
                tool_input: Some(payload),
                delta_input: None,
            })
            .await;
        }

        tool_call_id
    }

    /// Synthesize an error as a `tool_call` named `show_error`, then close
    /// the stream.
    pub async fn show_error(&self, error: &str) {
        self.tool_call(
            "show_error",
            serde_json::json!({ "error": error }),
            false,
            None,
        )
        .await;
        self.close().await;
    }

    /// Send the end-of-stream marker.
    pub async fn close(&self) {
        if let Some(queue) = &self.queue {
            if let Err(e) = queue.send(None).await {
                log::warn!("Failed to close stream: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn workflow_events_carry_matching_ids() {
        let (tx, mut rx) = mpsc::channel(16);
        let handler = StreamHandler::new(tx);

        let workflow_id = handler.start_workflow("Say hi").await;
        handler.end_workflow(&workflow_id).await;
        handler.close().await;

        match rx.recv().await.flatten() {
            Some(StreamEvent::StartOfWorkflow { workflow_id: id, input }) => {
                assert_eq!(id, workflow_id);
                assert_eq!(input[0]["content"], "Say hi");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.flatten() {
            Some(StreamEvent::EndOfWorkflow { workflow_id: id }) => assert_eq!(id, workflow_id),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn streaming_tool_call_sends_one_delta_per_key() {
        let (tx, mut rx) = mpsc::channel(16);
        let handler = StreamHandler::new(tx);

        let id = handler
            .tool_call(
                "run_python_code",
                serde_json::json!({"a": 1, "b": 2}),
                true,
                None,
            )
            .await;

        let mut deltas = 0;
        while let Ok(Some(Some(event))) =
            tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await
        {
            match event {
                StreamEvent::ToolCall {
                    tool_call_id,
                    delta_input,
                    tool_input,
                    ..
                } => {
                    assert_eq!(tool_call_id, id);
                    assert!(tool_input.is_none());
                    assert!(delta_input.is_some());
                    deltas += 1;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(deltas, 2);
    }

    #[tokio::test]
    async fn show_error_synthesizes_tool_call_then_closes() {
        let (tx, mut rx) = mpsc::channel(16);
        let handler = StreamHandler::new(tx);
        handler.show_error("boom").await;

        match rx.recv().await.flatten() {
            Some(StreamEvent::ToolCall {
                tool_name,
                tool_input,
                ..
            }) => {
                assert_eq!(tool_name, "show_error");
                assert_eq!(tool_input.unwrap()["error"], "boom");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[test]
    fn events_serialize_with_event_and_data_envelope() {
        let event = StreamEvent::Message {
            message_id: "m1".to_string(),
            delta: MessageDelta {
                content: "hello".to_string(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "message");
        assert_eq!(json["data"]["message_id"], "m1");
        assert_eq!(json["data"]["delta"]["content"], "hello");
    }

    #[tokio::test]
    async fn disabled_handler_discards_everything() {
        let handler = StreamHandler::disabled();
        // Must not panic or block.
        handler.start_workflow("x").await;
        handler.show_error("y").await;
    }
}
