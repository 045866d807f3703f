use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use hearth_core::error::{HearthError, Result};
use hearth_core::event::EventBus;
use hearth_core::permissions::{GateDecision, PermissionSet};
use hearth_core::traits::{PermissionSource, ToolDispatcher};
use hearth_core::types::{Caller, ChainEvent, ToolContext};

/// Sits between the engine and the tool dispatcher.
///
/// Holds the caller's permission set, resolved once when the run starts, and
/// refuses any call to a tool the caller's group is not granted.
pub struct PermissionGate {
    caller: Caller,
    permissions: PermissionSet,
    dispatcher: Arc<dyn ToolDispatcher>,
    event_bus: Arc<EventBus>,
}

impl PermissionGate {
    pub fn new(
        caller: Caller,
        permissions: PermissionSet,
        dispatcher: Arc<dyn ToolDispatcher>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            caller,
            permissions,
            dispatcher,
            event_bus,
        }
    }

    /// Resolve the caller's permissions from `source`. A source failure
    /// yields an empty set, so every call is denied.
    pub async fn for_caller(
        source: &dyn PermissionSource,
        caller: Caller,
        dispatcher: Arc<dyn ToolDispatcher>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let permissions = match source.permissions_for(&caller).await {
            Ok(set) => set,
            Err(e) => {
                error!(group = %caller.group, error = %e, "Failed to load permissions, denying all tools");
                PermissionSet::default()
            }
        };
        Self::new(caller, permissions, dispatcher, event_bus)
    }

    pub fn authorize(&self, tool: &str) -> GateDecision {
        self.permissions.decide(tool)
    }

    /// Main entry point; replaces direct dispatcher calls.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        match self.authorize(name) {
            GateDecision::Allow => self.dispatcher.invoke(name, input, ctx, timeout).await,
            GateDecision::Deny => {
                warn!(tool = %name, group = %self.caller.group, "Tool call blocked");
                self.event_bus.publish(ChainEvent::ToolBlocked {
                    run_id: ctx.run_id,
                    tool: name.to_string(),
                    group: self.caller.group.clone(),
                });
                Err(HearthError::Unauthorized {
                    tool: name.to_string(),
                    group: self.caller.group.clone(),
                })
            }
        }
    }
}
