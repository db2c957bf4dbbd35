use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use stepwise_core::domain::tool::{codes, ToolArgs, ToolResult, ToolSpec};
use tracing::warn;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn spec(&self) -> ToolSpec;

    /// Per-tool timeout; the registry default applies when `None`.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn invoke(&self, args: ToolArgs) -> Result<ToolResult>;
}

/// Read-mostly mapping from tool name to implementation, shared by every
/// thread.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    default_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ToolRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self { tools: BTreeMap::new(), default_timeout }
    }

    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.register_shared(Arc::new(tool));
    }

    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Capability set exposing every registered tool.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|tool| tool.spec()).collect()
    }

    /// Capability set restricted to `names`; unknown names are ignored.
    pub fn specs_for(&self, names: &[&str]) -> Vec<ToolSpec> {
        names.iter().filter_map(|name| self.tools.get(*name)).map(|tool| tool.spec()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Invokes a tool. Never fails: unknown tools, timeouts, and errors or
    /// panics raised by the tool itself become failure envelopes.
    pub async fn invoke(&self, name: &str, args: ToolArgs) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            return ToolResult::failure(codes::UNKNOWN_TOOL, format!("no tool named `{name}`"));
        };
        let timeout = tool.timeout().unwrap_or(self.default_timeout);

        // Spawned so a panicking tool surfaces as a join error instead of
        // unwinding through the turn.
        let call = Arc::clone(tool);
        let mut handle = tokio::spawn(async move { call.invoke(args).await });
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(error))) => {
                warn!(
                    event_name = "tools.invoke_exception",
                    tool = name,
                    error = %error,
                    "tool raised an error"
                );
                ToolResult::failure(codes::EXECUTION_EXCEPTION, "the tool raised an unexpected error")
            }
            Ok(Err(join_error)) => {
                warn!(
                    event_name = "tools.invoke_exception",
                    tool = name,
                    panicked = join_error.is_panic(),
                    "tool task did not complete"
                );
                ToolResult::failure(codes::EXECUTION_EXCEPTION, "the tool raised an unexpected error")
            }
            Err(_) => {
                handle.abort();
                ToolResult::failure(
                    codes::TIMEOUT,
                    format!("`{name}` did not finish within {}s", timeout.as_secs_f32()),
                )
                .with_meta("timeout_ms", timeout.as_millis() as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use stepwise_core::domain::tool::{codes, ToolArgs, ToolResult, ToolSpec};

    use super::{Tool, ToolRegistry};
    use crate::test_support::{args, ScriptedTool};

    fn error_code(result: &ToolResult) -> Option<&str> {
        match result {
            ToolResult::Failure { error, .. } => Some(error.code.as_str()),
            ToolResult::Success { .. } => None,
        }
    }

    #[tokio::test]
    async fn unknown_tool_maps_to_retryable_code() {
        let registry = ToolRegistry::default();
        let result = registry.invoke("missing", args(json!({}))).await;
        assert_eq!(error_code(&result), Some(codes::UNKNOWN_TOOL));
    }

    #[tokio::test]
    async fn raised_error_maps_to_execution_exception() {
        let mut registry = ToolRegistry::default();
        registry.register(ScriptedTool::new("sql_query").raising("driver panicked"));

        let result = registry.invoke("sql_query", args(json!({"query": "select 1"}))).await;
        assert_eq!(error_code(&result), Some(codes::EXECUTION_EXCEPTION));
        if let ToolResult::Failure { error, .. } = result {
            assert!(!error.message.contains("driver panicked"));
        }
    }

    struct PanickingTool;

    #[async_trait]
    impl Tool for PanickingTool {
        fn name(&self) -> &str {
            "report"
        }

        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "report".to_string(),
                description: "renders a report".to_string(),
                parameters: json!({"type": "object"}),
            }
        }

        async fn invoke(&self, _args: ToolArgs) -> anyhow::Result<ToolResult> {
            let sections: Vec<ToolResult> = Vec::new();
            Ok(sections[0].clone())
        }
    }

    #[tokio::test]
    async fn panicking_tool_maps_to_execution_exception() {
        let mut registry = ToolRegistry::default();
        registry.register(PanickingTool);

        let result = registry.invoke("report", args(json!({}))).await;
        assert_eq!(error_code(&result), Some(codes::EXECUTION_EXCEPTION));
    }

    #[tokio::test]
    async fn slow_tool_times_out() {
        let mut registry = ToolRegistry::default();
        registry.register(
            ScriptedTool::new("web_search")
                .slow(Duration::from_millis(200), Duration::from_millis(10)),
        );

        let result = registry.invoke("web_search", args(json!({}))).await;
        assert_eq!(error_code(&result), Some(codes::TIMEOUT));
        assert!(result.meta().contains_key("timeout_ms"));
    }

    #[tokio::test]
    async fn capability_sets_are_per_call() {
        let mut registry = ToolRegistry::default();
        let query = Arc::new(ScriptedTool::new("sql_query"));
        registry.register_shared(query.clone());
        registry.register(ScriptedTool::new("analyze_target"));

        assert_eq!(registry.specs().len(), 2);
        let only_query = registry.specs_for(&["sql_query", "nope"]);
        assert_eq!(only_query.len(), 1);
        assert_eq!(only_query[0].name, "sql_query");

        registry.invoke("sql_query", args(json!({"query": "select 1"}))).await;
        assert_eq!(query.calls().len(), 1);
    }
}
