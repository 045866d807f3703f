use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use hearth_core::error::{HearthError, Result};
use hearth_core::traits::{Tool, ToolDispatcher};
use hearth_core::types::{ToolContext, ToolResult};

/// Always returns the same output.
pub struct StaticTool {
    name: String,
    output: serde_json::Value,
}

impl StaticTool {
    pub fn new(name: &str, output: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            output,
        }
    }
}

impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "static test tool"
    }

    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        let output = self.output.clone();
        Box::pin(async move { Ok(ToolResult::success(output)) })
    }
}

/// Returns its input as output.
pub struct EchoTool {
    name: String,
}

impl EchoTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "echo test tool"
    }

    fn execute(&self, input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move { Ok(ToolResult::success(input)) })
    }
}

/// Fails with a hard execution error.
pub struct FailingTool {
    name: String,
    message: String,
}

impl FailingTool {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
        }
    }
}

impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "failing test tool"
    }

    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            Err(HearthError::ToolExecution {
                tool: self.name.clone(),
                message: self.message.clone(),
            })
        })
    }
}

/// Reports a soft error (`ToolResult::error`).
pub struct SoftErrorTool {
    name: String,
    message: String,
}

impl SoftErrorTool {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
        }
    }
}

impl Tool for SoftErrorTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "soft-error test tool"
    }

    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        let message = self.message.clone();
        Box::pin(async move { Ok(ToolResult::error(message)) })
    }
}

/// Sleeps before succeeding.
pub struct SlowTool {
    name: String,
    delay: Duration,
    limit: Option<Duration>,
}

impl SlowTool {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay,
            limit: None,
        }
    }

    /// Declare the tool's own call limit.
    pub fn with_limit(mut self, limit: Duration) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "slow test tool"
    }

    fn timeout(&self) -> Option<Duration> {
        self.limit
    }

    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(ToolResult::success("done"))
        })
    }
}

/// Counts invocations and keeps the arguments it was called with.
#[derive(Clone)]
pub struct CountingTool {
    name: String,
    output: serde_json::Value,
    calls: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl CountingTool {
    pub fn new(name: &str, output: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            output,
            calls: Arc::new(AtomicUsize::new(0)),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<serde_json::Value> {
        self.inputs.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl Tool for CountingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "counting test tool"
    }

    fn execute(&self, input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut inputs) = self.inputs.lock() {
            inputs.push(input);
        }
        let output = self.output.clone();
        Box::pin(async move { Ok(ToolResult::success(output)) })
    }
}

/// Dispatcher returning fixed results per tool name and logging every call.
#[derive(Default)]
pub struct ScriptedDispatcher {
    results: HashMap<String, std::result::Result<serde_json::Value, String>>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<(String, serde_json::Value)>>,
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(mut self, tool: &str, value: serde_json::Value) -> Self {
        self.results.insert(tool.to_string(), Ok(value));
        self
    }

    pub fn fail(mut self, tool: &str, message: &str) -> Self {
        self.results.insert(tool.to_string(), Err(message.to_string()));
        self
    }

    /// Delay a tool's response (use with a paused tokio clock).
    pub fn delay(mut self, tool: &str, delay: Duration) -> Self {
        self.delays.insert(tool.to_string(), delay);
        self
    }

    /// Tool names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|c| c.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    /// Arguments of every call to `tool`, in call order.
    pub fn args_for(&self, tool: &str) -> Vec<serde_json::Value> {
        self.calls
            .lock()
            .map(|c| {
                c.iter()
                    .filter(|(name, _)| name == tool)
                    .map(|(_, args)| args.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn call_count(&self, tool: &str) -> usize {
        self.calls().iter().filter(|name| *name == tool).count()
    }
}

impl ToolDispatcher for ScriptedDispatcher {
    fn invoke<'a>(
        &'a self,
        name: &'a str,
        args: serde_json::Value,
        _ctx: ToolContext,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((name.to_string(), args));
            }
            let result = self
                .results
                .get(name)
                .cloned()
                .ok_or_else(|| HearthError::ToolNotFound(name.to_string()))?;

            let respond = async {
                if let Some(delay) = self.delays.get(name) {
                    tokio::time::sleep(*delay).await;
                }
                result.map_err(|message| HearthError::ToolExecution {
                    tool: name.to_string(),
                    message,
                })
            };

            tokio::time::timeout(timeout, respond)
                .await
                .unwrap_or_else(|_| {
                    Err(HearthError::ToolTimeout {
                        tool: name.to_string(),
                        timeout_secs: timeout.as_secs(),
                    })
                })
        })
    }

    fn contains(&self, name: &str) -> bool {
        self.results.contains_key(name)
    }
}
