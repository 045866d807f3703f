//! Tool chain conditional execution engine.
//!
//! A chain is an ordered list of steps. Each step makes one tool call, may be
//! gated by a condition group, and may own a tree of nested actions
//! (`invoke`, `branch`, `terminal`) that run after it. Conditions are
//! evaluated against the run's `ExecutionContext`, which accumulates every
//! step and action result in order. The `ChainRunner` walks a validated
//! `ChainTree` strictly sequentially and seals an `ExecutionRecord`.

pub mod condition;
pub mod context;
pub mod executor;
pub mod export;
pub mod gate;
pub mod orchestrator;
pub mod template;
pub mod tree;

pub use condition::{evaluate, Condition, ConditionGroup};
pub use context::{ContextEntry, ExecutionContext};
pub use executor::ActionOutcome;
pub use export::JsonlRecordSink;
pub use gate::PermissionGate;
pub use orchestrator::{ChainRunner, RunRequest};
pub use tree::{ActionNode, ActionNodeKind, ChainTree, Children, StepNode};
