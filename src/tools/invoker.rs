//! Capability registry and invoker contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::ToolError;
use crate::llm::ToolCallRequest;

/// External collaborator: executes one named tool call.
///
/// The engine performs no retries; a failure aborts the whole turn.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, call: &ToolCallRequest) -> Result<String, ToolError>;
}

/// A typed invocation handle for one capability.
#[async_trait]
pub trait ToolFunction: Send + Sync {
    async fn call(&self, arguments: serde_json::Value) -> Result<String, ToolError>;
}

/// Explicit map from `(plugin, function)` to an invocation handle.
///
/// Unknown names fail at lookup with [`ToolError::NotFound`] rather than at
/// dispatch time inside a string match.
#[derive(Default)]
pub struct CapabilityRegistry {
    handles: RwLock<HashMap<(String, String), Arc<dyn ToolFunction>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle. Replaces any previous registration for the pair.
    pub async fn register(
        &self,
        plugin: impl Into<String>,
        function: impl Into<String>,
        handle: Arc<dyn ToolFunction>,
    ) {
        let key = (plugin.into(), function.into());
        tracing::debug!(plugin = %key.0, function = %key.1, "Registering capability");
        self.handles.write().await.insert(key, handle);
    }

    pub async fn get(&self, plugin: &str, function: &str) -> Option<Arc<dyn ToolFunction>> {
        self.handles
            .read()
            .await
            .get(&(plugin.to_string(), function.to_string()))
            .cloned()
    }

    /// Registered capability names as `plugin.function`, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handles
            .read()
            .await
            .keys()
            .map(|(p, f)| format!("{}.{}", p, f))
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ToolInvoker for CapabilityRegistry {
    async fn invoke(&self, call: &ToolCallRequest) -> Result<String, ToolError> {
        let handle = self.get(&call.plugin, &call.function).await.ok_or_else(|| {
            ToolError::NotFound {
                plugin: call.plugin.clone(),
                function: call.function.clone(),
            }
        })?;

        tracing::debug!(
            call_id = %call.call_id,
            tool = %call.qualified_name(),
            "Tool call started"
        );
        let result = handle.call(call.arguments.clone()).await;
        match &result {
            Ok(_) => {
                tracing::debug!(call_id = %call.call_id, tool = %call.qualified_name(), "Tool call succeeded");
            }
            Err(e) => {
                tracing::debug!(call_id = %call.call_id, tool = %call.qualified_name(), error = %e, "Tool call failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoFunction;

    #[async_trait]
    impl ToolFunction for EchoFunction {
        async fn call(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
            arguments
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| ToolError::InvalidArguments {
                    name: "test.echo".into(),
                    reason: "missing 'message'".into(),
                })
        }
    }

    fn call(plugin: &str, function: &str, arguments: serde_json::Value) -> ToolCallRequest {
        ToolCallRequest {
            call_id: "c1".into(),
            plugin: plugin.into(),
            function: function.into(),
            arguments,
        }
    }

    #[tokio::test]
    async fn test_registered_capability_invokes() {
        let registry = CapabilityRegistry::new();
        registry.register("test", "echo", Arc::new(EchoFunction)).await;

        let result = registry
            .invoke(&call("test", "echo", serde_json::json!({"message": "hello"})))
            .await
            .expect("invoke");
        assert_eq!(result, "hello");
    }

    #[tokio::test]
    async fn test_unknown_capability_is_not_found() {
        let registry = CapabilityRegistry::new();
        let err = registry
            .invoke(&call("nope", "missing", serde_json::json!({})))
            .await
            .expect_err("should fail");
        assert!(matches!(err, ToolError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_names_sorted() {
        let registry = CapabilityRegistry::new();
        registry.register("b", "two", Arc::new(EchoFunction)).await;
        registry.register("a", "one", Arc::new(EchoFunction)).await;
        assert_eq!(registry.names().await, vec!["a.one", "b.two"]);
    }
}
