//! Chain definitions in their flat, persisted shape.
//!
//! A `ChainDefinition` mirrors the storage rows: one chain, its steps, every
//! action of every tree, the condition groups and their conditions. Nothing
//! here is validated beyond what the types enforce; the engine builds and
//! checks the executable tree from it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{HearthError, Result};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Chain identifier.
    ChainId
);
id_type!(
    /// Step identifier.
    StepId
);
id_type!(
    /// Action identifier.
    ActionId
);
id_type!(
    /// Condition group identifier.
    GroupId
);
id_type!(
    /// Condition identifier.
    ConditionId
);

/// The single owner of an action or a condition group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    Step(StepId),
    Action(ActionId),
}

impl Owner {
    /// Convert a pair of nullable owner columns, rejecting both-set and neither-set.
    pub fn from_columns(step_id: Option<i64>, action_id: Option<i64>) -> Result<Self> {
        match (step_id, action_id) {
            (Some(step), None) => Ok(Self::Step(StepId(step))),
            (None, Some(action)) => Ok(Self::Action(ActionId(action))),
            (Some(step), Some(action)) => Err(HearthError::InvalidChain(format!(
                "owner references both step {} and action {}",
                step, action
            ))),
            (None, None) => Err(HearthError::InvalidChain(
                "owner references neither a step nor an action".to_string(),
            )),
        }
    }

    /// Split back into `(step_id, action_id)` columns.
    pub fn columns(&self) -> (Option<i64>, Option<i64>) {
        match self {
            Self::Step(id) => (Some(id.0), None),
            Self::Action(id) => (None, Some(id.0)),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step(id) => write!(f, "step {}", id),
            Self::Action(id) => write!(f, "action {}", id),
        }
    }
}

/// A complete chain as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub chain: Chain,
    #[serde(default)]
    pub steps: Vec<StepDef>,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
    #[serde(default)]
    pub condition_groups: Vec<ConditionGroupDef>,
    #[serde(default)]
    pub conditions: Vec<ConditionDef>,
}

impl ChainDefinition {
    pub fn id(&self) -> ChainId {
        self.chain.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub id: ChainId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A tool name plus its argument template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default = "empty_args")]
    pub args: serde_json::Value,
}

fn empty_args() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl ToolCall {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: empty_args(),
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    pub id: StepId,
    pub position: i64,
    /// Context key for this step's result; defaults to the tool name.
    #[serde(default)]
    pub key: Option<String>,
    pub call: ToolCall,
    #[serde(default)]
    pub on_failure: Option<FailurePolicy>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// What a failed step call does to the rest of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    Continue,
    Halt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDef {
    pub id: ActionId,
    pub owner: Owner,
    /// Which outcome of the parent selects this action.
    #[serde(default)]
    pub branch: BranchLabel,
    #[serde(default)]
    pub position: i64,
    #[serde(flatten)]
    pub kind: ActionKind,
}

/// Closed set of action kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    /// Perform a tool call.
    Invoke {
        call: ToolCall,
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Select `then` or `else` children from an owned condition group.
    Branch,
    /// Stop the chain with a declared status.
    Terminal {
        status: TerminalStatus,
        #[serde(default)]
        message: Option<String>,
    },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Invoke { .. } => "invoke",
            Self::Branch => "branch",
            Self::Terminal { .. } => "terminal",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchLabel {
    #[default]
    Then,
    Else,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroupDef {
    pub id: GroupId,
    pub owner: Owner,
    #[serde(default)]
    pub combinator: Combinator,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    #[default]
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionDef {
    pub id: ConditionId,
    pub group_id: GroupId,
    /// Dot-separated path into the execution context, e.g. `ping.result.status`.
    pub path: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub position: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Exists,
    Matches,
}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = HearthError;

            fn from_str(s: &str) -> Result<Self> {
                match s.to_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(HearthError::InvalidChain(format!(
                        "unknown {}: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

text_enum!(FailurePolicy {
    Continue => "continue",
    Halt => "halt",
});

text_enum!(BranchLabel {
    Then => "then",
    Else => "else",
});

text_enum!(TerminalStatus {
    Success => "success",
    Failure => "failure",
});

text_enum!(Combinator {
    And => "and",
    Or => "or",
});

text_enum!(Operator {
    Equals => "equals",
    NotEquals => "not_equals",
    Contains => "contains",
    NotContains => "not_contains",
    GreaterThan => "greater_than",
    GreaterOrEqual => "greater_or_equal",
    LessThan => "less_than",
    LessOrEqual => "less_or_equal",
    Exists => "exists",
    Matches => "matches",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_from_columns() {
        assert_eq!(
            Owner::from_columns(Some(3), None).unwrap(),
            Owner::Step(StepId(3))
        );
        assert_eq!(
            Owner::from_columns(None, Some(7)).unwrap(),
            Owner::Action(ActionId(7))
        );
        assert!(Owner::from_columns(Some(1), Some(2)).is_err());
        assert!(Owner::from_columns(None, None).is_err());
        assert_eq!(Owner::Action(ActionId(7)).columns(), (None, Some(7)));
    }

    #[test]
    fn action_kind_is_flattened_with_tag() {
        let json = serde_json::json!({
            "id": 10,
            "owner": {"step": 1},
            "branch": "else",
            "kind": "invoke",
            "call": {"tool": "notify", "args": {"text": "down"}}
        });
        let action: ActionDef = serde_json::from_value(json).unwrap();
        assert_eq!(action.owner, Owner::Step(StepId(1)));
        assert_eq!(action.branch, BranchLabel::Else);
        match action.kind {
            ActionKind::Invoke { ref call, .. } => assert_eq!(call.tool, "notify"),
            ref other => panic!("unexpected kind {:?}", other),
        }

        let terminal: ActionDef = serde_json::from_value(serde_json::json!({
            "id": 11,
            "owner": {"action": 10},
            "kind": "terminal",
            "status": "failure"
        }))
        .unwrap();
        assert_eq!(terminal.branch, BranchLabel::Then);
        assert!(matches!(
            terminal.kind,
            ActionKind::Terminal {
                status: TerminalStatus::Failure,
                ..
            }
        ));
    }

    #[test]
    fn combinator_accepts_uppercase() {
        let c: Combinator = serde_json::from_str("\"OR\"").unwrap();
        assert_eq!(c, Combinator::Or);
        assert_eq!("AND".parse::<Combinator>().unwrap(), Combinator::And);
    }

    #[test]
    fn operator_text_roundtrip() {
        for op in [
            Operator::Equals,
            Operator::NotContains,
            Operator::GreaterOrEqual,
            Operator::Matches,
        ] {
            assert_eq!(op.as_str().parse::<Operator>().unwrap(), op);
        }
        assert!("approximately".parse::<Operator>().is_err());
    }

    #[test]
    fn definition_defaults() {
        let def: ChainDefinition = serde_json::from_value(serde_json::json!({
            "chain": {"id": 1, "name": "nightly"},
            "steps": [{"id": 1, "position": 0, "call": {"tool": "ping"}}]
        }))
        .unwrap();
        assert!(def.chain.enabled);
        assert_eq!(def.steps[0].call.args, serde_json::json!({}));
        assert!(def.actions.is_empty());
    }
}
