//! Tool-call dispatch: validation, bounded-parallel execution, and
//! per-call outcome collection.
//!
//! Every dispatched call settles to exactly one outcome. Unknown tools,
//! invalid arguments, handler failures, panics, and deadline hits all become
//! encoded error outputs rather than dropped calls, so the run never waits
//! on an output that will not arrive.

use crate::registry::ToolRegistry;
use crate::traits::{ToolError, ToolHandler};
use convoke_core::{ToolCall, ToolOutput};
use futures_util::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Upper bound on concurrently executing handlers per dispatch.
    pub max_parallel: usize,
    /// Local safety net, strictly shorter than the provider's run expiry.
    pub deadline: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            deadline: Duration::from_secs(30),
        }
    }
}

/// How a call settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDisposition {
    Completed,
    /// Typed handler failure, unknown tool, or rejected arguments. The run
    /// continues; the model sees the encoded error.
    HandlerError,
    TimedOut,
    Panicked,
    Cancelled,
}

impl CallDisposition {
    /// Timeouts and panics mean the dispatch itself misbehaved; the
    /// controller fails the run after submitting the synthesized outputs.
    pub fn is_unexpected(&self) -> bool {
        matches!(self, CallDisposition::TimedOut | CallDisposition::Panicked)
    }
}

#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub output: ToolOutput,
    pub disposition: CallDisposition,
}

pub struct ToolCallDispatcher {
    registry: Arc<ToolRegistry>,
    config: DispatcherConfig,
}

impl ToolCallDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self::with_config(registry, DispatcherConfig::default())
    }

    pub fn with_config(registry: Arc<ToolRegistry>, config: DispatcherConfig) -> Self {
        Self { registry, config }
    }

    /// Execute a `requires_action` batch. Returns one outcome per call, in
    /// input order, only once every call has settled.
    pub async fn dispatch(
        &self,
        calls: &[ToolCall],
        cancel: CancellationToken,
    ) -> Vec<CallOutcome> {
        info!("Dispatching {} tool call(s)", calls.len());
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel));

        let tasks = calls.iter().map(|call| {
            let call = call.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let handler = self.registry.resolve(&call.name);
            let deadline = self.config.deadline;

            async move {
                // The deadline covers queue wait too, so the batch as a
                // whole settles within one deadline window.
                match timeout(deadline, async {
                    // The semaphore is never closed; `ok()` keeps the
                    // permit alive for the duration of the call.
                    let _permit = semaphore.acquire().await.ok();
                    execute_call(handler, &call, cancel).await
                })
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!("Tool call {} timed out", call.id);
                        CallOutcome {
                            output: error_output(&call.id, "timeout", "tool call timed out"),
                            disposition: CallDisposition::TimedOut,
                        }
                    }
                }
            }
        });

        join_all(tasks).await
    }
}

async fn execute_call(
    handler: Option<Arc<dyn ToolHandler>>,
    call: &ToolCall,
    cancel: CancellationToken,
) -> CallOutcome {
    let Some(handler) = handler else {
        warn!("Unsupported function requested: {}", call.name);
        return CallOutcome {
            output: error_output(
                &call.id,
                "unsupported_function",
                &format!("unsupported function: {}", call.name),
            ),
            disposition: CallDisposition::HandlerError,
        };
    };

    if let Err(e) = validate_arguments(&handler.schema(), &call.arguments) {
        warn!("Rejecting {} call {}: {}", call.name, call.id, e);
        return CallOutcome {
            output: error_output(&call.id, "invalid_arguments", &e.to_string()),
            disposition: CallDisposition::HandlerError,
        };
    }

    let arguments = call.arguments.clone();
    let handler_cancel = cancel.clone();
    // Spawn to isolate handler panics from sibling calls.
    let handle = tokio::spawn(async move { handler.execute(arguments, handler_cancel).await });

    let joined = tokio::select! {
        joined = handle => joined,
        _ = cancel.cancelled() => {
            return CallOutcome {
                output: error_output(&call.id, "cancelled", "run cancelled"),
                disposition: CallDisposition::Cancelled,
            };
        }
    };

    match joined {
        Ok(Ok(value)) => CallOutcome {
            output: ToolOutput::new(&call.id, encode_success(value)),
            disposition: CallDisposition::Completed,
        },
        Ok(Err(ToolError::Cancelled)) => CallOutcome {
            output: error_output(&call.id, "cancelled", "run cancelled"),
            disposition: CallDisposition::Cancelled,
        },
        Ok(Err(e)) => CallOutcome {
            output: error_output(&call.id, "tool_execution_failed", &e.to_string()),
            disposition: CallDisposition::HandlerError,
        },
        Err(join_err) if join_err.is_panic() => CallOutcome {
            output: error_output(&call.id, "internal", "tool handler panicked"),
            disposition: CallDisposition::Panicked,
        },
        Err(_) => CallOutcome {
            output: error_output(&call.id, "cancelled", "tool task aborted"),
            disposition: CallDisposition::Cancelled,
        },
    }
}

/// Strict argument check against the handler's JSON Schema: the payload must
/// be an object and every `required` property must be present. Rejection
/// happens before the handler runs, so malformed model output cannot leave
/// partially-applied side effects.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), ToolError> {
    let Some(args) = arguments.as_object() else {
        return Err(ToolError::InvalidArguments(
            "arguments must be a JSON object".to_string(),
        ));
    };

    if let Some(required) = schema["required"].as_array() {
        for key in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(key) {
                return Err(ToolError::InvalidArguments(format!(
                    "missing required field: {key}"
                )));
            }
        }
    }

    Ok(())
}

fn encode_success(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn error_output(call_id: &str, code: &str, message: &str) -> ToolOutput {
    ToolOutput::new(
        call_id,
        json!({ "error": { "code": code, "message": message } }).to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::EchoTool;
    use crate::traits::ToolHandler;
    use async_trait::async_trait;

    struct FailingTool;

    #[async_trait]
    impl ToolHandler for FailingTool {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn description(&self) -> &'static str {
            "Always fails"
        }
        fn schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(
            &self,
            _arguments: Value,
            _cancel: CancellationToken,
        ) -> Result<Value, ToolError> {
            Err(ToolError::ExecutionFailed("deliberate failure".to_string()))
        }
    }

    struct StuckTool;

    #[async_trait]
    impl ToolHandler for StuckTool {
        fn name(&self) -> &'static str {
            "stuck"
        }
        fn description(&self) -> &'static str {
            "Never returns"
        }
        fn schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(
            &self,
            _arguments: Value,
            _cancel: CancellationToken,
        ) -> Result<Value, ToolError> {
            std::future::pending().await
        }
    }

    struct PanickingTool;

    #[async_trait]
    impl ToolHandler for PanickingTool {
        fn name(&self) -> &'static str {
            "panicking"
        }
        fn description(&self) -> &'static str {
            "Panics"
        }
        fn schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(
            &self,
            _arguments: Value,
            _cancel: CancellationToken,
        ) -> Result<Value, ToolError> {
            panic!("boom");
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(EchoTool))
            .register(Arc::new(FailingTool))
            .register(Arc::new(StuckTool))
            .register(Arc::new(PanickingTool));
        Arc::new(registry)
    }

    fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            run_id: "run_1".to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    #[tokio::test]
    async fn test_every_call_settles() {
        let dispatcher = ToolCallDispatcher::new(registry());
        let calls = vec![
            call("call_1", "echo", json!({"message": "a"})),
            call("call_2", "failing", json!({})),
            call("call_3", "no_such_tool", json!({})),
        ];

        let outcomes = dispatcher.dispatch(&calls, CancellationToken::new()).await;
        assert_eq!(outcomes.len(), calls.len());
        assert_eq!(outcomes[0].disposition, CallDisposition::Completed);
        assert_eq!(outcomes[0].output.output, "a");
        assert_eq!(outcomes[1].disposition, CallDisposition::HandlerError);
        assert_eq!(outcomes[2].disposition, CallDisposition::HandlerError);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_output_not_error() {
        let dispatcher = ToolCallDispatcher::new(registry());
        let calls = vec![call("call_1", "no_such_tool", json!({}))];

        let outcomes = dispatcher.dispatch(&calls, CancellationToken::new()).await;
        let parsed: Value = serde_json::from_str(&outcomes[0].output.output).unwrap();
        assert_eq!(parsed["error"]["code"], "unsupported_function");
        assert!(!outcomes[0].disposition.is_unexpected());
    }

    #[tokio::test]
    async fn test_failure_does_not_cancel_siblings() {
        let dispatcher = ToolCallDispatcher::new(registry());
        let calls = vec![
            call("call_1", "panicking", json!({})),
            call("call_2", "echo", json!({"message": "survives"})),
        ];

        let outcomes = dispatcher.dispatch(&calls, CancellationToken::new()).await;
        assert_eq!(outcomes[0].disposition, CallDisposition::Panicked);
        assert!(outcomes[0].disposition.is_unexpected());
        assert_eq!(outcomes[1].disposition, CallDisposition::Completed);
        assert_eq!(outcomes[1].output.output, "survives");
    }

    #[tokio::test]
    async fn test_deadline_resolves_stuck_calls() {
        let dispatcher = ToolCallDispatcher::with_config(
            registry(),
            DispatcherConfig {
                max_parallel: 4,
                deadline: Duration::from_millis(50),
            },
        );
        let calls = vec![
            call("call_1", "stuck", json!({})),
            call("call_2", "echo", json!({"message": "fast"})),
        ];

        let outcomes = dispatcher.dispatch(&calls, CancellationToken::new()).await;
        assert_eq!(outcomes[0].disposition, CallDisposition::TimedOut);
        assert_eq!(outcomes[1].disposition, CallDisposition::Completed);
    }

    #[tokio::test]
    async fn test_missing_required_field_rejected_before_execution() {
        let dispatcher = ToolCallDispatcher::new(registry());
        let calls = vec![call("call_1", "echo", json!({"wrong": "field"}))];

        let outcomes = dispatcher.dispatch(&calls, CancellationToken::new()).await;
        assert_eq!(outcomes[0].disposition, CallDisposition::HandlerError);
        let parsed: Value = serde_json::from_str(&outcomes[0].output.output).unwrap();
        assert_eq!(parsed["error"]["code"], "invalid_arguments");
    }

    #[tokio::test]
    async fn test_cancellation_settles_pending_calls() {
        let dispatcher = ToolCallDispatcher::new(registry());
        let cancel = CancellationToken::new();
        let calls = vec![call("call_1", "stuck", json!({}))];

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let outcomes = dispatcher.dispatch(&calls, cancel).await;
        assert_eq!(outcomes[0].disposition, CallDisposition::Cancelled);
    }

    #[test]
    fn test_validate_arguments_non_object() {
        let schema = json!({"type": "object", "required": []});
        assert!(validate_arguments(&schema, &json!("not an object")).is_err());
        assert!(validate_arguments(&schema, &json!({})).is_ok());
    }
}
