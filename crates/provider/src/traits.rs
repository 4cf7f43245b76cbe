//! AI conversation provider contract.

use async_trait::async_trait;
use convoke_core::{
    Message, OrchestratorError, ResourceBindings, Role, RunCapability, RunSnapshot, ToolOutput,
};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("streaming not supported by this provider")]
    StreamingUnsupported,
}

impl From<ProviderError> for OrchestratorError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Auth(_) => OrchestratorError::AuthRequired,
            ProviderError::NotFound(msg) => OrchestratorError::NotFound(msg),
            ProviderError::Conflict(msg) => OrchestratorError::ConflictActiveRun(msg),
            ProviderError::Invalid(msg) => OrchestratorError::ValidationFailed(msg),
            ProviderError::RateLimited(msg) => OrchestratorError::ProviderRateLimited(msg),
            ProviderError::Unavailable(msg) => OrchestratorError::ProviderUnavailable(msg),
            ProviderError::Api(msg) | ProviderError::Parse(msg) => {
                OrchestratorError::Provider(msg)
            }
            ProviderError::StreamingUnsupported => {
                OrchestratorError::Provider("streaming not supported".to_string())
            }
        }
    }
}

/// Provider-native stream items, decoded from the wire by the provider
/// implementation and normalized into `StreamEvent` by the relay.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Any run status change, including a pause carrying pending tool calls.
    RunStatus { run: RunSnapshot },
    /// Incremental assistant text.
    MessageDelta { message_id: String, text: String },
    /// A message finished materializing.
    MessageCompleted { message: Message },
    /// The provider stream broke mid-run.
    StreamError { message: String },
    /// End of provider stream.
    StreamEnd,
}

/// The external AI conversation provider.
///
/// The orchestrator is the only caller; it maps `ProviderError` into the
/// orchestrator taxonomy and owns all retry policy.
#[async_trait]
pub trait ConversationProvider: Send + Sync {
    async fn create_thread(&self, bindings: &ResourceBindings) -> Result<String, ProviderError>;

    async fn delete_thread(&self, thread_id: &str) -> Result<(), ProviderError>;

    async fn update_thread_bindings(
        &self,
        thread_id: &str,
        bindings: &ResourceBindings,
    ) -> Result<(), ProviderError>;

    /// Append a user-authored message; the provider assigns the message id.
    async fn append_message(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
        attachments: &[String],
    ) -> Result<Message, ProviderError>;

    /// Most recent messages first.
    async fn list_messages(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, ProviderError>;

    async fn create_run(
        &self,
        thread_id: &str,
        capability: &RunCapability,
    ) -> Result<RunSnapshot, ProviderError>;

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<RunSnapshot, ProviderError>;

    async fn cancel_run(&self, thread_id: &str, run_id: &str)
        -> Result<RunSnapshot, ProviderError>;

    /// Submit one output per pending tool call. The provider rejects partial
    /// batches; the orchestrator additionally enforces completeness locally.
    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<RunSnapshot, ProviderError>;

    /// Open an event stream for a run. Providers without streaming return
    /// `StreamingUnsupported` and callers fall back to polling `get_run`.
    async fn stream_run(
        &self,
        _thread_id: &str,
        _run_id: &str,
    ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError> {
        Err(ProviderError::StreamingUnsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping_to_taxonomy() {
        let err: OrchestratorError = ProviderError::RateLimited("429".into()).into();
        assert!(err.is_retryable());

        let err: OrchestratorError = ProviderError::Auth("401".into()).into();
        assert!(matches!(err, OrchestratorError::AuthRequired));

        let err: OrchestratorError = ProviderError::Api("boom".into()).into();
        assert!(matches!(err, OrchestratorError::Provider(_)));
        assert!(!err.is_retryable());
    }
}
