use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chain::{ActionId, ChainId, StepId};
use crate::record::{NodeStatus, RunStatus, StepStatus};

/// Unique identifier of a single chain run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identity a run executes on behalf of. Authorization is decided per group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Caller {
    pub group: String,
}

impl Caller {
    pub fn group(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
        }
    }
}

impl std::fmt::Display for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.group)
    }
}

/// Result of a tool execution.
///
/// `is_error` marks a soft failure reported by the adapter itself; the
/// dispatcher turns it into a tool error for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub output: serde_json::Value,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(output: impl Into<serde_json::Value>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    pub fn error(output: impl Into<serde_json::Value>) -> Self {
        Self {
            output: output.into(),
            is_error: true,
        }
    }
}

/// Tool definition exposed to callers that list the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run_id: RunId,
    pub chain_id: ChainId,
    pub caller: Caller,
}

/// Progress event broadcast while a chain runs.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A run was started for a loaded chain.
    RunStarted {
        run_id: RunId,
        chain_id: ChainId,
        chain_name: String,
    },
    /// A step is about to invoke its tool.
    StepStarted {
        run_id: RunId,
        step_id: StepId,
        tool: String,
    },
    /// A step reached its final status.
    StepFinished {
        run_id: RunId,
        step_id: StepId,
        status: StepStatus,
    },
    /// An action node reached its final status.
    ActionFinished {
        run_id: RunId,
        action_id: ActionId,
        status: NodeStatus,
    },
    /// A tool call was refused by the permission gate.
    ToolBlocked {
        run_id: RunId,
        tool: String,
        group: String,
    },
    /// The record was sealed.
    RunFinished { run_id: RunId, status: RunStatus },
}
