use crate::traits::ToolHandler;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps tool names to handlers.
///
/// Registration happens at process startup; after that the registry is
/// read-only and safe for concurrent `resolve` from any number of dispatches.
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> &mut Self {
        self.handlers.insert(handler.name().to_string(), handler);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.handlers.len()
    }

    /// Tool schemas in OpenAI function format, for run capability wiring.
    pub fn schemas(&self) -> Vec<serde_json::Value> {
        self.handlers
            .values()
            .map(|handler| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": handler.name(),
                        "description": handler.description(),
                        "parameters": handler.schema()
                    }
                })
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::EchoTool;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        assert!(registry.resolve("echo").is_some());
        assert!(registry.resolve("nonexistent").is_none());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_schemas_function_format() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let schemas = registry.schemas();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0]["type"], "function");
        assert_eq!(schemas[0]["function"]["name"], "echo");
    }
}
