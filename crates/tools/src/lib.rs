//! The tool interface the agent orchestrator dispatches against, and the
//! registry that holds whatever tools a given deployment wires up. No tool
//! implementations live here — only the seam.
//!
//! A trait-object registry holding a raw JSON arguments string rather than a
//! typed `HashMap<String, String>` argument map (tool-call arguments arrive
//! from the model as opaque JSON text; parsing is each tool's job, not the
//! registry's), and registration rejects duplicate names instead of
//! silently shadowing them.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Outcome of a tool execution that completed (as opposed to an
/// infrastructure failure, which propagates as `anyhow::Error`).
///
/// `is_error` carries tool-level failures (bad arguments, a 404 from some
/// downstream API) back to the model as a normal tool-result message so it
/// can adapt, instead of aborting the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: true,
        }
    }
}

/// A callable tool exposed to the model.
///
/// `parameters` returns a JSON Schema object describing the arguments, used
/// verbatim in the OpenAI-compatible `tools` array sent to the inference
/// subprocess. `execute` receives the raw arguments JSON string from the
/// model's tool call and a cancellation token the orchestrator trips when
/// the owning request is aborted.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> serde_json::Value;

    async fn execute(
        &self,
        cancel: CancellationToken,
        arguments: &str,
    ) -> anyhow::Result<ToolResult>;
}

/// One entry of the OpenAI-compatible `tools` array.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub r#type: &'static str,
    pub function: ToolFunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolFunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Holds the tools available to a given agent run. Registration order is
/// preserved and reflected in `api_tools()` so the tool list sent upstream
/// is stable across requests.
#[derive(Default)]
pub struct ToolRegistry {
    order: Vec<String>,
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool. Errors if a tool with the same name is already
    /// registered rather than silently letting the last registration win,
    /// which would paper over a configuration mistake.
    pub fn register(&mut self, tool: Box<dyn Tool>) -> anyhow::Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            anyhow::bail!("a tool named '{name}' is already registered");
        }
        self.order.push(name.clone());
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    /// The OpenAI-compatible `tools` array, in registration order.
    pub fn api_tools(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDefinition {
                r#type: "function",
                function: ToolFunctionDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters(),
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool {
        name: String,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "echoes its arguments back"
        }

        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object", "properties": {} })
        }

        async fn execute(
            &self,
            _cancel: CancellationToken,
            arguments: &str,
        ) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::ok(arguments.to_string()))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "failing"
        }

        fn description(&self) -> &str {
            "always reports a tool-level error"
        }

        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object", "properties": {} })
        }

        async fn execute(
            &self,
            _cancel: CancellationToken,
            _arguments: &str,
        ) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::error("bad input"))
        }
    }

    #[test]
    fn empty_registry_has_no_tools() {
        let reg = ToolRegistry::new();
        assert!(reg.is_empty());
        assert!(reg.get("anything").is_none());
        assert!(reg.api_tools().is_empty());
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(Box::new(EchoTool { name: "echo".into() })).unwrap();
        assert!(reg.get("echo").is_some());
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = ToolRegistry::new();
        reg.register(Box::new(EchoTool { name: "echo".into() })).unwrap();
        let err = reg
            .register(Box::new(EchoTool { name: "echo".into() }))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn api_tools_preserves_registration_order() {
        let mut reg = ToolRegistry::new();
        reg.register(Box::new(EchoTool { name: "alpha".into() })).unwrap();
        reg.register(Box::new(EchoTool { name: "beta".into() })).unwrap();
        reg.register(Box::new(EchoTool { name: "gamma".into() })).unwrap();

        let names: Vec<_> = reg.api_tools().into_iter().map(|t| t.function.name).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn execute_runs_registered_tool_with_raw_arguments() {
        let mut reg = ToolRegistry::new();
        reg.register(Box::new(EchoTool { name: "echo".into() })).unwrap();
        let tool = reg.get("echo").unwrap();
        let result = tool
            .execute(CancellationToken::new(), "{\"x\":1}")
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.output, "{\"x\":1}");
    }

    #[tokio::test]
    async fn tool_level_failure_is_not_infrastructure_error() {
        let mut reg = ToolRegistry::new();
        reg.register(Box::new(FailingTool)).unwrap();
        let tool = reg.get("failing").unwrap();
        let result = tool.execute(CancellationToken::new(), "{}").await.unwrap();
        assert!(result.is_error);
        assert_eq!(result.output, "bad input");
    }
}
