use std::time::Duration;

use futures::future::BoxFuture;

use crate::chain::{Chain, ChainDefinition, ChainId};
use crate::error::Result;
use crate::permissions::PermissionSet;
use crate::record::ExecutionRecord;
use crate::types::*;

/// An external adapter invoked by name.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in chain definitions and permission patterns).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Upper bound this tool puts on every call, if any.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Uniform "invoke by name" contract the engine runs against.
pub trait ToolDispatcher: Send + Sync + 'static {
    /// Invoke a tool. The call must resolve or be dropped within `timeout`.
    fn invoke<'a>(
        &'a self,
        name: &'a str,
        args: serde_json::Value,
        ctx: ToolContext,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<serde_json::Value>>;

    /// Whether a tool with this name is known.
    fn contains(&self, name: &str) -> bool;
}

/// Read-only load of fully resolved chain definitions.
pub trait ChainSource: Send + Sync + 'static {
    fn load_chain(&self, id: ChainId) -> BoxFuture<'_, Result<ChainDefinition>>;

    fn list_chains(&self) -> BoxFuture<'_, Result<Vec<Chain>>>;
}

/// Resolves a caller's effective tool-name patterns.
pub trait PermissionSource: Send + Sync + 'static {
    fn permissions_for(&self, caller: &Caller) -> BoxFuture<'_, Result<PermissionSet>>;
}

/// Append-only write of sealed execution records.
pub trait RecordSink: Send + Sync + 'static {
    fn append<'a>(&'a self, record: &'a ExecutionRecord) -> BoxFuture<'a, Result<()>>;
}
