//! HTTP client for an OpenAI-Assistants-compatible provider.

use crate::traits::{ConversationProvider, ProviderError, ProviderEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoke_core::{
    Citation, ContentPart, Message, RequiredAction, ResourceBindings, Role, RunCapability,
    RunError, RunSnapshot, RunState, TokenUsage, ToolCall, ToolOutput,
};
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "assistants=v2");
const STREAM_CHANNEL_CAPACITY: usize = 64;

pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, ProviderError> {
        let response = request
            .bearer_auth(&self.api_key)
            .header(BETA_HEADER.0, BETA_HEADER.1)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))
    }
}

#[async_trait]
impl ConversationProvider for OpenAiCompatibleProvider {
    async fn create_thread(&self, bindings: &ResourceBindings) -> Result<String, ProviderError> {
        let mut body = json!({});
        if !bindings.is_empty() {
            body["tool_resources"] = bindings_body(bindings);
        }
        let value = self.send(self.client.post(self.url("/threads")).json(&body)).await?;
        value["id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ProviderError::Parse("thread response missing id".to_string()))
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), ProviderError> {
        let path = format!("/threads/{thread_id}");
        self.send(self.client.delete(self.url(&path))).await?;
        Ok(())
    }

    async fn update_thread_bindings(
        &self,
        thread_id: &str,
        bindings: &ResourceBindings,
    ) -> Result<(), ProviderError> {
        let path = format!("/threads/{thread_id}");
        let body = json!({ "tool_resources": bindings_body(bindings) });
        self.send(self.client.post(self.url(&path)).json(&body)).await?;
        Ok(())
    }

    async fn append_message(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
        attachments: &[String],
    ) -> Result<Message, ProviderError> {
        let path = format!("/threads/{thread_id}/messages");
        let mut body = json!({
            "role": match role {
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            "content": content,
        });
        if !attachments.is_empty() {
            body["attachments"] = Value::Array(
                attachments
                    .iter()
                    .map(|file_id| json!({ "file_id": file_id, "tools": [{"type": "file_search"}] }))
                    .collect(),
            );
        }
        let value = self.send(self.client.post(self.url(&path)).json(&body)).await?;
        parse_message(&value)
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, ProviderError> {
        let path = format!("/threads/{thread_id}/messages?order=desc&limit={limit}");
        let value = self.send(self.client.get(self.url(&path))).await?;
        value["data"]
            .as_array()
            .ok_or_else(|| ProviderError::Parse("message list missing data".to_string()))?
            .iter()
            .map(parse_message)
            .collect()
    }

    async fn create_run(
        &self,
        thread_id: &str,
        capability: &RunCapability,
    ) -> Result<RunSnapshot, ProviderError> {
        let path = format!("/threads/{thread_id}/runs");
        let mut body = json!({ "model": capability.model });
        if let Some(instructions) = &capability.instructions {
            body["instructions"] = json!(instructions);
        }
        if !capability.tool_names.is_empty() {
            body["tools"] = Value::Array(
                capability
                    .tool_names
                    .iter()
                    .map(|name| json!({ "type": "function", "function": { "name": name } }))
                    .collect(),
            );
        }
        debug!("Creating run on thread {}", thread_id);
        let value = self.send(self.client.post(self.url(&path)).json(&body)).await?;
        parse_run(&value)
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<RunSnapshot, ProviderError> {
        let path = format!("/threads/{thread_id}/runs/{run_id}");
        let value = self.send(self.client.get(self.url(&path))).await?;
        parse_run(&value)
    }

    async fn cancel_run(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> Result<RunSnapshot, ProviderError> {
        let path = format!("/threads/{thread_id}/runs/{run_id}/cancel");
        let value = self.send(self.client.post(self.url(&path))).await?;
        parse_run(&value)
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<RunSnapshot, ProviderError> {
        let path = format!("/threads/{thread_id}/runs/{run_id}/submit_tool_outputs");
        let body = json!({
            "tool_outputs": outputs
                .iter()
                .map(|o| json!({ "tool_call_id": o.tool_call_id, "output": o.output }))
                .collect::<Vec<_>>(),
        });
        let value = self.send(self.client.post(self.url(&path)).json(&body)).await?;
        parse_run(&value)
    }

    async fn stream_run(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError> {
        let path = format!("/threads/{thread_id}/runs/{run_id}/stream");
        let response = self
            .client
            .post(self.url(&path))
            .bearer_auth(&self.api_key)
            .header(BETA_HEADER.0, BETA_HEADER.1)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            if let Err(e) = pump_sse(response, &tx).await {
                warn!("Provider stream broke: {}", e);
                let _ = tx
                    .send(ProviderEvent::StreamError {
                        message: e.to_string(),
                    })
                    .await;
            }
        });
        Ok(rx)
    }
}

/// Forward SSE frames from the wire to the event channel until `[DONE]`,
/// connection close, or the subscriber hangs up.
async fn pump_sse(
    response: reqwest::Response,
    tx: &mpsc::Sender<ProviderEvent>,
) -> Result<(), ProviderError> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(frame_end) = buffer.find("\n\n") {
            let frame = buffer[..frame_end].to_string();
            buffer = buffer[frame_end + 2..].to_string();

            let mut event_name = "";
            let mut data = "";
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("event: ") {
                    event_name = rest.trim();
                } else if let Some(rest) = line.strip_prefix("data: ") {
                    data = rest;
                }
            }

            if data == "[DONE]" {
                let _ = tx.send(ProviderEvent::StreamEnd).await;
                return Ok(());
            }

            if let Some(event) = decode_frame(event_name, data) {
                if tx.send(event).await.is_err() {
                    // Subscriber dropped; stop reading the wire.
                    return Ok(());
                }
            }
        }
    }

    let _ = tx.send(ProviderEvent::StreamEnd).await;
    Ok(())
}

/// Decode one SSE frame into a provider event. Unknown event types
/// (e.g. run-step frames) are skipped.
fn decode_frame(event_name: &str, data: &str) -> Option<ProviderEvent> {
    let value: Value = serde_json::from_str(data).ok()?;
    match event_name {
        "thread.message.delta" => {
            let message_id = value["id"].as_str()?.to_string();
            let text = value["delta"]["content"]
                .as_array()
                .map(|parts| {
                    parts
                        .iter()
                        .filter(|p| p["type"] == "text")
                        .filter_map(|p| p["text"]["value"].as_str())
                        .collect::<String>()
                })
                .unwrap_or_default();
            Some(ProviderEvent::MessageDelta { message_id, text })
        }
        "thread.message.completed" => parse_message(&value)
            .ok()
            .map(|message| ProviderEvent::MessageCompleted { message }),
        name if name.starts_with("thread.run.") && !name.starts_with("thread.run.step") => {
            parse_run(&value).ok().map(|run| ProviderEvent::RunStatus { run })
        }
        _ => None,
    }
}

fn map_status(status: StatusCode, body: &str) -> ProviderError {
    let detail = format!("{status}: {body}");
    match status.as_u16() {
        401 | 403 => ProviderError::Auth(detail),
        404 => ProviderError::NotFound(detail),
        409 => ProviderError::Conflict(detail),
        400 | 422 => ProviderError::Invalid(detail),
        429 => ProviderError::RateLimited(detail),
        s if s >= 500 => ProviderError::Unavailable(detail),
        _ => ProviderError::Api(detail),
    }
}

fn bindings_body(bindings: &ResourceBindings) -> Value {
    json!({ "file_search": { "vector_store_ids": bindings.retrieval_indexes } })
}

fn parse_state(status: &str) -> Result<RunState, ProviderError> {
    match status {
        "queued" => Ok(RunState::Queued),
        "in_progress" => Ok(RunState::InProgress),
        "requires_action" => Ok(RunState::RequiresAction),
        "cancelling" => Ok(RunState::Cancelling),
        "completed" => Ok(RunState::Completed),
        "failed" => Ok(RunState::Failed),
        "cancelled" => Ok(RunState::Cancelled),
        "expired" => Ok(RunState::Expired),
        other => Err(ProviderError::Parse(format!("unknown run status: {other}"))),
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0))
}

fn parse_run(value: &Value) -> Result<RunSnapshot, ProviderError> {
    let id = value["id"]
        .as_str()
        .ok_or_else(|| ProviderError::Parse("run missing id".to_string()))?
        .to_string();
    let thread_id = value["thread_id"]
        .as_str()
        .ok_or_else(|| ProviderError::Parse("run missing thread_id".to_string()))?
        .to_string();
    let state = parse_state(
        value["status"]
            .as_str()
            .ok_or_else(|| ProviderError::Parse("run missing status".to_string()))?,
    )?;

    let tool_names = value["tools"]
        .as_array()
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| t["function"]["name"].as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    let capability = RunCapability {
        model: value["model"].as_str().unwrap_or_default().to_string(),
        tool_names,
        instructions: value["instructions"].as_str().map(|s| s.to_string()),
    };

    let required_action = value["required_action"]["submit_tool_outputs"]["tool_calls"]
        .as_array()
        .map(|calls| RequiredAction {
            tool_calls: calls
                .iter()
                .filter_map(|call| {
                    let call_id = call["id"].as_str()?.to_string();
                    let name = call["function"]["name"].as_str()?.to_string();
                    let raw = call["function"]["arguments"].as_str().unwrap_or_default();
                    // Malformed argument JSON is kept verbatim so schema
                    // validation can reject it with the original payload.
                    let arguments = serde_json::from_str(raw)
                        .unwrap_or_else(|_| Value::String(raw.to_string()));
                    Some(ToolCall {
                        id: call_id,
                        run_id: id.clone(),
                        name,
                        arguments,
                    })
                })
                .collect(),
        });

    let usage = value["usage"].as_object().map(|u| TokenUsage {
        prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        completion_tokens: u
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        total_tokens: u.get("total_tokens").and_then(Value::as_u64).unwrap_or(0),
    });

    let last_error = value["last_error"].as_object().map(|e| RunError {
        code: e
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        message: e
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    });

    Ok(RunSnapshot {
        id,
        thread_id,
        capability,
        state,
        required_action,
        usage,
        last_error,
        created_at: parse_timestamp(&value["created_at"]).unwrap_or_else(Utc::now),
        started_at: parse_timestamp(&value["started_at"]),
        completed_at: parse_timestamp(&value["completed_at"]),
    })
}

fn parse_message(value: &Value) -> Result<Message, ProviderError> {
    let id = value["id"]
        .as_str()
        .ok_or_else(|| ProviderError::Parse("message missing id".to_string()))?
        .to_string();
    let thread_id = value["thread_id"]
        .as_str()
        .ok_or_else(|| ProviderError::Parse("message missing thread_id".to_string()))?
        .to_string();
    let role = match value["role"].as_str() {
        Some("assistant") => Role::Assistant,
        Some("user") => Role::User,
        other => {
            return Err(ProviderError::Parse(format!(
                "unknown message role: {other:?}"
            )))
        }
    };

    let content = value["content"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| match part["type"].as_str() {
                    Some("text") => {
                        let text = part["text"]["value"].as_str().unwrap_or_default().to_string();
                        let citations = part["text"]["annotations"]
                            .as_array()
                            .map(|anns| {
                                anns.iter()
                                    .filter_map(|a| {
                                        let cite = &a["file_citation"];
                                        Some(Citation {
                                            source_id: cite["file_id"].as_str()?.to_string(),
                                            excerpt: cite["quote"]
                                                .as_str()
                                                .map(|s| s.to_string()),
                                        })
                                    })
                                    .collect()
                            })
                            .unwrap_or_default();
                        Some(ContentPart::Text { text, citations })
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let attachments = value["attachments"]
        .as_array()
        .map(|atts| {
            atts.iter()
                .filter_map(|a| a["file_id"].as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    Ok(Message {
        id,
        thread_id,
        role,
        content,
        created_at: parse_timestamp(&value["created_at"]).unwrap_or_else(Utc::now),
        attachments,
    })
}
