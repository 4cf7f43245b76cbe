//! Client-facing stream events.
//!
//! Provider-native delta shapes are decoded once at the StreamRelay boundary
//! into this closed union; nothing downstream depends on provider formats.

use crate::types::{Message, RunSnapshot, ToolCall};
use serde::{Deserialize, Serialize};

/// A normalized unit of progress information for an in-flight run.
///
/// Carries enough of the underlying entities (or deltas thereof) to
/// reconstruct the client view without additional calls. Clients must treat
/// unknown event types as ignorable for forward compatibility.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "created")]
    Created { run: RunSnapshot },
    #[serde(rename = "run.in_progress")]
    RunInProgress { run_id: String },
    #[serde(rename = "run.requires_action")]
    RunRequiresAction {
        run_id: String,
        tool_calls: Vec<ToolCall>,
    },
    #[serde(rename = "message.delta")]
    MessageDelta { message_id: String, delta: String },
    #[serde(rename = "message.completed")]
    MessageCompleted { message: Message },
    #[serde(rename = "run.completed")]
    RunCompleted { run: RunSnapshot },
    #[serde(rename = "run.failed")]
    RunFailed { run: RunSnapshot },
    #[serde(rename = "run.cancelled")]
    RunCancelled { run: RunSnapshot },
    #[serde(rename = "error")]
    Error { code: String, message: String },
    #[serde(rename = "done")]
    Done,
}

impl StreamEvent {
    /// Wire name used in the SSE `event:` field.
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::Created { .. } => "created",
            StreamEvent::RunInProgress { .. } => "run.in_progress",
            StreamEvent::RunRequiresAction { .. } => "run.requires_action",
            StreamEvent::MessageDelta { .. } => "message.delta",
            StreamEvent::MessageCompleted { .. } => "message.completed",
            StreamEvent::RunCompleted { .. } => "run.completed",
            StreamEvent::RunFailed { .. } => "run.failed",
            StreamEvent::RunCancelled { .. } => "run.cancelled",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done => "done",
        }
    }

    /// Whether this event ends the run from the client's point of view.
    /// `Done` always follows one of these on a well-formed stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::RunCompleted { .. }
                | StreamEvent::RunFailed { .. }
                | StreamEvent::RunCancelled { .. }
                | StreamEvent::Error { .. }
        )
    }
}
