use crate::traits::{ToolError, ToolHandler};
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Echoes its arguments back. Used by tests and demos.
pub struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn description(&self) -> &'static str {
        "Echoes input back"
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "message": {"type": "string"}
            },
            "required": ["message"]
        })
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> Result<serde_json::Value, ToolError> {
        Ok(arguments["message"].clone())
    }
}
