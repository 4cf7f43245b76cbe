//! Orchestrator error taxonomy.

use thiserror::Error;

/// Errors surfaced by the orchestrator.
///
/// Request-time validation errors surface synchronously with no run created.
/// Mid-run errors surface as `run.failed`/`error` stream events plus a
/// terminal run state, never through the response that started the run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("authentication required")]
    AuthRequired,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("thread {0} already has an active run")]
    ConflictActiveRun(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("provider rate limited: {0}")]
    ProviderRateLimited(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Not a failure. A normal terminal state reached via explicit cancel.
    #[error("cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Transient provider errors are retried with bounded backoff inside
    /// `RunController::advance`; everything else fails fast.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ProviderRateLimited(_) | OrchestratorError::ProviderUnavailable(_)
        )
    }

    /// Stable code for wire use (`error` stream events, run `last_error`).
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::AuthRequired => "auth_required",
            OrchestratorError::Forbidden(_) => "forbidden",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::ConflictActiveRun(_) => "conflict_active_run",
            OrchestratorError::ValidationFailed(_) => "validation_failed",
            OrchestratorError::ProviderRateLimited(_) => "provider_rate_limited",
            OrchestratorError::ProviderUnavailable(_) => "provider_unavailable",
            OrchestratorError::Provider(_) => "provider_error",
            OrchestratorError::ToolExecutionFailed(_) => "tool_execution_failed",
            OrchestratorError::Timeout(_) => "timeout",
            OrchestratorError::Cancelled => "cancelled",
            OrchestratorError::Serialization(_) => "serialization_error",
        }
    }
}
