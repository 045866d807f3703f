//! The sealed outcome of one chain run.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::{ActionId, BranchLabel, ChainId, StepId, TerminalStatus};
use crate::error::{ErrorKind, HearthError};
use crate::types::RunId;

/// Overall status of a sealed run. Runs in progress are only visible
/// through `ChainEvent`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    PartiallyFailed,
    Stopped,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PartiallyFailed => "partially_failed",
            Self::Stopped => "stopped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a top-level step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ran,
    Skipped,
    Failed,
    Cancelled,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ran => "ran",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Status of an action node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Skipped,
    Failed,
    PartiallyFailed,
    Stopped,
    Cancelled,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::PartiallyFailed => "partially_failed",
            Self::Stopped => "stopped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A failure recorded against a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&HearthError> for NodeError {
    fn from(e: &HearthError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<HearthError> for NodeError {
    fn from(e: HearthError) -> Self {
        Self::from(&e)
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Why a run stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalStop {
    pub action_id: ActionId,
    pub status: TerminalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Trace of one executed (or skipped) action node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTrace {
    pub action_id: ActionId,
    pub kind: String,
    pub status: NodeStatus,
    /// Branch taken by a `branch` action, or by an `invoke` action's children.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchLabel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ActionTrace>,
}

impl ActionTrace {
    pub fn new(action_id: ActionId, kind: &str, status: NodeStatus) -> Self {
        Self {
            action_id,
            kind: kind.to_string(),
            status,
            branch: None,
            tool: None,
            result: None,
            error: None,
            children: Vec::new(),
        }
    }

    /// This trace and all descendants, depth-first.
    pub fn walk(&self) -> Vec<&ActionTrace> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }
}

/// Record of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: StepId,
    pub position: i64,
    pub key: String,
    pub tool: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionTrace>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Sealed execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub run_id: RunId,
    pub chain_id: ChainId,
    pub chain_name: String,
    pub caller: String,
    pub status: RunStatus,
    pub steps: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<TerminalStop>,
    /// Context snapshot at seal time, keyed by node key.
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn step(&self, step_id: StepId) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Every action trace in the record, depth-first in execution order.
    pub fn action_traces(&self) -> Vec<&ActionTrace> {
        self.steps
            .iter()
            .flat_map(|s| s.actions.iter())
            .flat_map(|a| a.walk())
            .collect()
    }

    pub fn action(&self, action_id: ActionId) -> Option<&ActionTrace> {
        self.action_traces()
            .into_iter()
            .find(|a| a.action_id == action_id)
    }

    /// Copy with identity and timestamps blanked, for comparing runs.
    pub fn normalized(&self) -> Self {
        let epoch = DateTime::<Utc>::default();
        let mut copy = self.clone();
        copy.run_id = RunId(String::new());
        copy.started_at = epoch;
        copy.finished_at = epoch;
        for step in &mut copy.steps {
            step.started_at = epoch;
            step.finished_at = epoch;
        }
        copy
    }
}
