//! Core type definitions for the convoke orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message role in conversation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A citation attached to assistant text, pointing at a retrieval source.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Citation {
    pub source_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

/// One part of a message body.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        citations: Vec<Citation>,
    },
    ToolResult {
        tool_call_id: String,
        output: serde_json::Value,
    },
}

/// A single message in a thread. Immutable once created.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub role: Role,
    pub content: Vec<ContentPart>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

impl Message {
    pub fn new(thread_id: impl Into<String>, role: Role, content: Vec<ContentPart>) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            thread_id: thread_id.into(),
            role,
            content,
            created_at: Utc::now(),
            attachments: Vec::new(),
        }
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text, .. } => Some(text.as_str()),
                ContentPart::ToolResult { .. } => None,
            })
            .collect()
    }
}

/// Resource bindings attached to a thread (e.g. retrieval index ids).
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ResourceBindings {
    #[serde(default)]
    pub retrieval_indexes: Vec<String>,
}

impl ResourceBindings {
    pub fn is_empty(&self) -> bool {
        self.retrieval_indexes.is_empty()
    }
}

/// A conversation thread.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Thread {
    pub id: String,
    pub owner_id: String,
    pub bindings: ResourceBindings,
    pub created_at: DateTime<Utc>,
}

/// Capability set requested for a run.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunCapability {
    pub model: String,
    #[serde(default)]
    pub tool_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Run lifecycle state.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl RunState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled | RunState::Expired
        )
    }

    /// A run counts against the one-active-run-per-thread invariant
    /// until it reaches a terminal state.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// A tool invocation requested by the model. Arguments are untrusted
/// model output and must be schema-validated before execution.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub run_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// The result (or error) returned to the provider for one tool call.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

impl ToolOutput {
    pub fn new(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            output: output.into(),
        }
    }
}

/// Pending tool calls a paused run is waiting on.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct RequiredAction {
    pub tool_calls: Vec<ToolCall>,
}

/// Token accounting reported by the provider on terminal states.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Terminal error detail recorded on a failed or expired run.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RunError {
    pub code: String,
    pub message: String,
}

/// Point-in-time view of a run.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunSnapshot {
    pub id: String,
    pub thread_id: String,
    pub capability: RunCapability,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_action: Option<RequiredAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunError>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), r#""user""#);
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            r#""assistant""#
        );
    }

    #[test]
    fn test_content_part_text_json_format() {
        let part = ContentPart::Text {
            text: "hello".into(),
            citations: vec![Citation {
                source_id: "idx_1".into(),
                excerpt: None,
            }],
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hello");
        assert_eq!(json["citations"][0]["source_id"], "idx_1");
    }

    #[test]
    fn test_content_part_tool_result_round_trip() {
        let part = ContentPart::ToolResult {
            tool_call_id: "call_1".into(),
            output: json!({"ok": true}),
        };
        let serialized = serde_json::to_string(&part).unwrap();
        let deserialized: ContentPart = serde_json::from_str(&serialized).unwrap();
        assert_eq!(part, deserialized);
    }

    #[test]
    fn test_message_text_skips_tool_results() {
        let msg = Message::new(
            "thread_1",
            Role::Assistant,
            vec![
                ContentPart::Text {
                    text: "a".into(),
                    citations: vec![],
                },
                ContentPart::ToolResult {
                    tool_call_id: "call_1".into(),
                    output: json!("ignored"),
                },
                ContentPart::Text {
                    text: "b".into(),
                    citations: vec![],
                },
            ],
        );
        assert_eq!(msg.text(), "ab");
    }

    #[test]
    fn test_run_state_terminal() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(RunState::Expired.is_terminal());
        assert!(!RunState::Queued.is_terminal());
        assert!(!RunState::RequiresAction.is_terminal());
        assert!(!RunState::Cancelling.is_terminal());
    }

    #[test]
    fn test_run_state_serialization() {
        assert_eq!(
            serde_json::to_string(&RunState::RequiresAction).unwrap(),
            r#""requires_action""#
        );
        let state: RunState = serde_json::from_str(r#""in_progress""#).unwrap();
        assert_eq!(state, RunState::InProgress);
    }

    #[test]
    fn test_message_ids_unique() {
        let a = Message::new("t", Role::User, vec![]);
        let b = Message::new("t", Role::User, vec![]);
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("msg_"));
    }
}
