use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hearth_core::chain::{BranchLabel, TerminalStatus, ToolCall};
use hearth_core::error::{HearthError, Result};
use hearth_core::event::EventBus;
use hearth_core::record::{ActionTrace, NodeError, NodeStatus, TerminalStop};
use hearth_core::types::{ChainEvent, ToolContext};

use crate::condition::evaluate;
use crate::context::{ContextEntry, ExecutionContext};
use crate::gate::PermissionGate;
use crate::template::render_args;
use crate::tree::{ActionNode, ActionNodeKind, ChainTree};

/// Result of running one action node and everything below it.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Succeeded,
    /// Gated off by its condition group. Counts as success.
    Skipped,
    Failed(NodeError),
    /// The node ran but something beneath it failed.
    PartiallyFailed,
    /// A terminal action fired; the whole run stops.
    Stopped(TerminalStop),
    Cancelled,
}

impl ActionOutcome {
    pub fn status(&self) -> NodeStatus {
        match self {
            Self::Succeeded => NodeStatus::Succeeded,
            Self::Skipped => NodeStatus::Skipped,
            Self::Failed(_) => NodeStatus::Failed,
            Self::PartiallyFailed => NodeStatus::PartiallyFailed,
            Self::Stopped(_) => NodeStatus::Stopped,
            Self::Cancelled => NodeStatus::Cancelled,
        }
    }
}

/// Runs action trees for one run.
///
/// Recursion depth is bounded by the tree itself: a `ChainTree` cannot be
/// built with nesting beyond the configured limit.
pub struct ActionExecutor<'a> {
    tree: &'a ChainTree,
    gate: &'a PermissionGate,
    events: &'a EventBus,
    cancel: &'a CancellationToken,
    tool_ctx: ToolContext,
    /// Budget for calls whose node sets no timeout.
    default_timeout: Duration,
}

impl<'a> ActionExecutor<'a> {
    pub(crate) fn new(
        tree: &'a ChainTree,
        gate: &'a PermissionGate,
        events: &'a EventBus,
        cancel: &'a CancellationToken,
        tool_ctx: ToolContext,
        default_timeout: Duration,
    ) -> Self {
        Self {
            tree,
            gate,
            events,
            cancel,
            tool_ctx,
            default_timeout,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether an optional gating group lets its node run.
    pub(crate) fn gate_open(&self, condition: Option<usize>, context: &ExecutionContext) -> bool {
        condition.map_or(true, |g| evaluate(self.tree.group(g), context))
    }

    /// Render arguments, authorize and invoke one tool within the node's
    /// timeout, or the engine default when the node sets none. In-flight
    /// calls are abandoned on cancellation and reported as
    /// `HearthError::Cancelled`.
    pub(crate) async fn call(
        &self,
        call: &ToolCall,
        timeout: Option<Duration>,
        context: &ExecutionContext,
    ) -> Result<Value> {
        if self.cancel.is_cancelled() {
            return Err(HearthError::Cancelled);
        }
        let args = render_args(&call.args, context);
        let timeout = timeout.unwrap_or(self.default_timeout);
        debug!(tool = %call.tool, run_id = %self.tool_ctx.run_id, timeout_secs = timeout.as_secs(), "Invoking tool");

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HearthError::Cancelled),
            result = self.gate.execute(&call.tool, args, self.tool_ctx.clone(), timeout) => result,
        }
    }

    /// Store an outcome. Keys are unique per tree, so a conflict is only logged.
    pub(crate) fn remember(&self, context: &mut ExecutionContext, key: &str, entry: ContextEntry) {
        if let Err(e) = context.record(key, entry) {
            warn!(key = %key, error = %e, "Context entry not recorded");
        }
    }

    /// Run sibling actions in order. Stops at the first terminal action or
    /// on cancellation; failures are collected and the rest still run.
    pub(crate) async fn run_children(
        &self,
        children: &[usize],
        context: &mut ExecutionContext,
    ) -> (ActionOutcome, Vec<ActionTrace>) {
        let mut traces = Vec::with_capacity(children.len());
        let mut failed = false;
        for &idx in children {
            if self.cancel.is_cancelled() {
                return (ActionOutcome::Cancelled, traces);
            }
            let (outcome, trace) = self.run_action(idx, context).await;
            traces.push(trace);
            match outcome {
                ActionOutcome::Stopped(_) | ActionOutcome::Cancelled => return (outcome, traces),
                ActionOutcome::Failed(_) | ActionOutcome::PartiallyFailed => failed = true,
                ActionOutcome::Succeeded | ActionOutcome::Skipped => {}
            }
        }
        let outcome = if failed {
            ActionOutcome::PartiallyFailed
        } else {
            ActionOutcome::Succeeded
        };
        (outcome, traces)
    }

    fn run_action<'b>(
        &'b self,
        idx: usize,
        context: &'b mut ExecutionContext,
    ) -> BoxFuture<'b, (ActionOutcome, ActionTrace)> {
        Box::pin(async move {
            let node = self.tree.action(idx);
            let (outcome, trace) = match &node.kind {
                ActionNodeKind::Invoke { key, call, timeout } => {
                    self.invoke_action(node, key, call, *timeout, context).await
                }
                ActionNodeKind::Branch => self.branch_action(node, context).await,
                ActionNodeKind::Terminal { status, message } => {
                    self.terminal_action(node, *status, message.as_deref(), context)
                }
            };
            self.events.publish(ChainEvent::ActionFinished {
                run_id: self.tool_ctx.run_id.clone(),
                action_id: node.id,
                status: trace.status,
            });
            (outcome, trace)
        })
    }

    async fn invoke_action(
        &self,
        node: &ActionNode,
        key: &str,
        call: &ToolCall,
        timeout: Option<Duration>,
        context: &mut ExecutionContext,
    ) -> (ActionOutcome, ActionTrace) {
        let mut trace = ActionTrace::new(node.id, node.kind.name(), NodeStatus::Succeeded);
        trace.tool = Some(call.tool.clone());

        if !self.gate_open(node.condition, context) {
            trace.status = NodeStatus::Skipped;
            return (ActionOutcome::Skipped, trace);
        }

        let (label, mut outcome) = match self.call(call, timeout, context).await {
            Ok(value) => {
                self.remember(context, key, ContextEntry::Success(value.clone()));
                trace.result = Some(value);
                (BranchLabel::Then, ActionOutcome::Succeeded)
            }
            Err(HearthError::Cancelled) => {
                trace.status = NodeStatus::Cancelled;
                return (ActionOutcome::Cancelled, trace);
            }
            Err(e) => {
                warn!(action = %node.id, tool = %call.tool, error = %e, "Action tool call failed");
                let error = NodeError::from(&e);
                self.remember(context, key, ContextEntry::Failure(error.clone()));
                trace.error = Some(error.clone());
                (BranchLabel::Else, ActionOutcome::Failed(error))
            }
        };

        if !node.children.is_empty() {
            trace.branch = Some(label);
        }
        let children = node.children.select(label);
        if !children.is_empty() {
            let (below, traces) = self.run_children(children, context).await;
            trace.children = traces;
            outcome = match (outcome, below) {
                (_, stop @ ActionOutcome::Stopped(_)) => stop,
                (_, ActionOutcome::Cancelled) => ActionOutcome::Cancelled,
                (ActionOutcome::Succeeded, ActionOutcome::PartiallyFailed) => {
                    ActionOutcome::PartiallyFailed
                }
                (own, _) => own,
            };
        }
        trace.status = outcome.status();
        (outcome, trace)
    }

    async fn branch_action(
        &self,
        node: &ActionNode,
        context: &mut ExecutionContext,
    ) -> (ActionOutcome, ActionTrace) {
        let mut trace = ActionTrace::new(node.id, node.kind.name(), NodeStatus::Succeeded);
        // Branches always own a group; the tree builder rejects them otherwise.
        let label = match node.condition {
            Some(g) if evaluate(self.tree.group(g), context) => BranchLabel::Then,
            _ => BranchLabel::Else,
        };
        debug!(action = %node.id, branch = %label, "Branch selected");
        trace.branch = Some(label);

        let (outcome, traces) = self.run_children(node.children.select(label), context).await;
        trace.children = traces;
        trace.status = outcome.status();
        (outcome, trace)
    }

    fn terminal_action(
        &self,
        node: &ActionNode,
        status: TerminalStatus,
        message: Option<&str>,
        context: &ExecutionContext,
    ) -> (ActionOutcome, ActionTrace) {
        let mut trace = ActionTrace::new(node.id, node.kind.name(), NodeStatus::Stopped);
        if !self.gate_open(node.condition, context) {
            trace.status = NodeStatus::Skipped;
            return (ActionOutcome::Skipped, trace);
        }
        info!(action = %node.id, status = %status, "Terminal action reached, stopping chain");
        let stop = TerminalStop {
            action_id: node.id,
            status,
            message: message.map(str::to_string),
        };
        (ActionOutcome::Stopped(stop), trace)
    }
}
