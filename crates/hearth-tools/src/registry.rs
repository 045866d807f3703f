use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use hearth_core::config::CommandToolConfig;
use hearth_core::error::{HearthError, Result};
use hearth_core::traits::{Tool, ToolDispatcher};
use hearth_core::types::{ToolContext, ToolDefinition};

use crate::command::CommandTool;

/// Registry of available tools. Doubles as the engine's tool dispatcher.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Get tool definitions for catalog listings.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name within `timeout`, or within the tool's own
    /// limit when that is shorter. A soft error reported by the tool becomes
    /// a `ToolExecution` error; no retries are attempted.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| HearthError::ToolNotFound(name.to_string()))?;

        let timeout = tool.timeout().map_or(timeout, |own| own.min(timeout));
        debug!(tool = %name, timeout_ms = timeout.as_millis() as u64, "Dispatching tool call");

        // Dropping the future on timeout cancels the call.
        match tokio::time::timeout(timeout, tool.execute(input, ctx)).await {
            Ok(Ok(result)) if result.is_error => Err(HearthError::ToolExecution {
                tool: name.to_string(),
                message: render_output(&result.output),
            }),
            Ok(Ok(result)) => Ok(result.output),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(HearthError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// Create a registry with the command tools declared in configuration.
    pub fn from_config(tools: &[CommandToolConfig]) -> Self {
        let mut registry = Self::new();
        for config in tools {
            registry.register(CommandTool::new(config.clone()));
        }
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolDispatcher for ToolRegistry {
    fn invoke<'a>(
        &'a self,
        name: &'a str,
        args: serde_json::Value,
        ctx: ToolContext,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(self.execute(name, args, ctx, timeout))
    }

    fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }
}

fn render_output(output: &serde_json::Value) -> String {
    match output {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
