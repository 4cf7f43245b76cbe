use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("cancelled")]
    Cancelled,
}

/// A registered tool implementation.
///
/// Handlers receive schema-conformant arguments; validation happens in the
/// dispatcher before `execute` is invoked. Cancellation is cooperative:
/// handlers observe the token at natural checkpoints.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;

    /// JSON Schema for the argument object.
    fn schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ToolError>;
}
